pub mod cache;
pub mod mutex;

pub use cache::EphemeralCache;
pub use mutex::{LockHandle, LockRegistry};
