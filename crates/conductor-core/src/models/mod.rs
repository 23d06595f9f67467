pub mod activity;
pub mod step;
pub mod workflow;

pub use activity::*;
pub use step::*;
pub use workflow::*;
