//! Domain services for warkeep.
//!
//! Each service owns one entity class and composes the cache, the queues,
//! the resource ledger, and the catalog. Services are instantiated per
//! request with the caller's user number; the dispatcher (or the task
//! worker) holds the user lock for the duration of a write operation, so
//! services compose freely without re-locking.

pub mod alliance;
pub mod buff;
pub mod building;
pub mod context;
pub mod item;
pub mod login;
pub mod mission;
pub mod research;
pub mod resource;
pub mod shop;
pub mod unit;

pub use context::{CompletionEvent, Deps, TaskQueues};
