//! Progress and log delivery for running jobs.
//!
//! - [`channel`] creates a bounded, non-blocking, single-consumer queue of
//!   [`JobEvent`]s. Log lines are dropped oldest-first under pressure;
//!   progress updates never are.
//! - [`JsonLinesSink`] forwards a channel to any async writer.

pub mod channel;
pub mod sink;

pub use channel::{channel, EventReceiver, EventSender, JobEvent, LogLevel, DEFAULT_CAPACITY};
pub use sink::JsonLinesSink;
