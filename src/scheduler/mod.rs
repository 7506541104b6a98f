//! Bounded worker pool for blocking calls such as prompt exchanges.

pub mod handle;
pub mod pool;

pub use handle::TaskHandle;
pub use pool::TaskScheduler;
