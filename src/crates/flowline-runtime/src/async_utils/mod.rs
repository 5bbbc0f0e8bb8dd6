//! Async utilities shared by the runtime primitives
//!
//! - `retry` - node-level retry policy with fixed or exponential waits
//! - `timeout` - deadline wrappers that turn expiry into a value
//! - `blocking` - off-loading of blocking closures to the blocking pool

pub mod blocking;
pub mod retry;
pub mod timeout;

pub use blocking::{run_blocking, run_blocking_fallible};
pub use retry::{with_retry, RetryPolicy};
pub use timeout::{with_optional_timeout, with_timeout, TimeoutError};
