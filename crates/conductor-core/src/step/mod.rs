pub mod machine;
pub mod output;

pub use machine::StepEffect;
pub use output::extract_json_block;
