//! State plumbing for warkeep — the hot cache, the SQLite system-of-record,
//! the timed-task queues, dirty-user tracking, and the lock manager.
//!
//! Domain services read and mutate the cache; sync workers move dirty users'
//! cache contents into persistence on fixed cadences. The persistent store
//! never serves steady-state reads.

pub mod cache;
pub mod dirty;
pub mod ids;
pub mod keys;
pub mod locks;
pub mod persist;
pub mod queue;

pub use cache::CacheStore;
pub use dirty::DirtyTracker;
pub use ids::IdAllocator;
pub use locks::{LockGuard, LockManager};
pub use persist::PersistentStore;
pub use queue::{DueTask, TaskQueue};
