//! Daemon library — orchestration, background workers, and shutdown
//! plumbing shared by the binary and the integration tests.

pub mod daemon;
pub mod logging;
pub mod shutdown;
pub mod sync_worker;
pub mod task_worker;

pub use daemon::Daemon;
pub use shutdown::ShutdownSignal;
