//! Waiting on workflow jobs.
//!
//! - [`source`]: reading job records
//! - [`channel`]: the shared, reference-counted notification subscription
//! - [`waiter`]: polling and notification paths racing to one outcome

pub mod channel;
pub mod source;
pub mod waiter;

pub use channel::{ChannelPhase, JobHandler, ListenerId, NotificationChannel};
pub use source::{BucketJobSource, DEFAULT_JOBS_BUCKET, JobSource};
pub use waiter::{JobOutcome, JobWaiter, WaitOptions};
