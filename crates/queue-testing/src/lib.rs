//! An in-memory `Store` and a handful of test-harness helpers, used by
//! `queue-core`'s own behavioral test suite and available to any downstream
//! crate that wants to exercise job handlers without a database.

pub mod harness;
pub mod memory;

pub use harness::wait_until;
pub use memory::InMemoryStore;
