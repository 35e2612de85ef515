//! Access-control records and the store that persists them.

mod access;
mod store;

pub use access::{Access, UserAccess};
pub use store::{KvBackend, MemBackend, RedbBackend, Store, StoreError, StoreProvider};
