pub mod dispatch;
pub mod pool;

pub use dispatch::{check_invocation, DispatchError, Dispatcher, ToolRunReport};
pub use pool::{PoolConfig, WorkerPool};
