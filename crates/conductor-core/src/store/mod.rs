pub mod activity_store;
pub mod step_store;
pub mod workflow_store;

pub use activity_store::ActivityStore;
pub use step_store::StepStore;
pub use workflow_store::WorkflowStore;

use chrono::{DateTime, TimeZone, Utc};

/// Epoch milliseconds back to a timestamp.
pub(crate) fn to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}
