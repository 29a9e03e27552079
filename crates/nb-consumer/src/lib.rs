pub mod consumer;
pub mod delivery;
pub mod handler;
pub mod retry;

pub use consumer::{admit, Admission, ConsumeError, Consumer};
pub use delivery::{header_u32, parse_delivery, ValidationError};
pub use handler::{EventHandler, FnHandler};
pub use retry::{failure_action, Backoff, EmptyScheduleError, FailureAction, RetryStage};
