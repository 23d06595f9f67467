//! Conductor Core: a workflow execution engine for multi-step AI agent runs.
//!
//! A workflow is an ordered plan of steps (clarification, discovery,
//! planning, implementation, ...). Each step is executed by one agent run
//! whose events flow through a [`stream::StreamChannel`]; the
//! [`workflow::WorkflowController`] advances steps, applies the pause policy,
//! and routes clarification questions to a human and back.
//!
//! The crate has no transport dependency; CLIs and servers drive it through
//! the controller.

pub mod agent;
pub mod clarification;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod persistence;
pub mod step;
pub mod store;
pub mod stream;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::EngineError;
pub use persistence::{Persistence, SqlitePersistence};
pub use workflow::{RecoveryReport, WorkflowController, WorkflowEvent};
