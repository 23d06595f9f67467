//! Streaming primitives shared by agent backends, the runner, and observers.

pub mod channel;
pub mod event;
pub mod fanout;

pub use channel::{EventSink, StreamChannel};
pub use event::{AgentPhase, StreamEvent, TokenUsage};
pub use fanout::{Fanout, FanoutItem, Subscription};
