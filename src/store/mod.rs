//! Store gateway for the wide-column backend
//!
//! This module owns all persisted access: query construction, retry policy,
//! paged scans, and the compare-and-set updates the claim protocol depends
//! on. Upper layers talk to the [`Store`] trait; production wires in
//! [`CassandraStore`], the test suite wires in [`MemoryStore`].

mod cassandra;
mod memory;
mod traits;

pub use cassandra::CassandraStore;
pub use memory::MemoryStore;
pub use traits::{Store, StoreError, StoreResult};
