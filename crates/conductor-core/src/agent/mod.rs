pub mod claude_code;
pub mod prompt;
pub mod runner;
pub mod scripted;

pub use claude_code::{ClaudeCodeBackend, ClaudeStreamParser};
pub use prompt::build_prompt;
pub use runner::{AgentBackend, AgentOutcome, AgentRequest, AgentRun, AgentRunner};
pub use scripted::{Script, ScriptAction, ScriptedBackend};
