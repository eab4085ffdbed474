//! Concurrency primitives shared by the runner dispatcher and executors.
//!
//! - `pool` - Bounded worker thread pool fed by a task channel
//! - `cancel` - Cooperative cancellation tokens

pub mod cancel;
pub mod pool;

pub use cancel::CancelToken;
pub use pool::WorkerPool;
