// Worker pools: OS threads and OS processes

pub mod process;
pub mod protocol;
pub mod thread;

pub use process::{ProcessPool, ProcessPoolConfig, Reply};
pub use protocol::{serve, TaskRequest, TaskResponse};
pub use thread::WorkerPool;
