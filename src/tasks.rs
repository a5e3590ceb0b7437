//! Task records and the worker pool that runs long operations.

pub mod model;
pub mod store;
pub mod runner;

pub use model::{Progress, Task, TaskOptions, TaskStatus};
pub use runner::{Outcome, TaskExecutor, TaskHandle, TaskRunner};
pub use store::TaskStore;
