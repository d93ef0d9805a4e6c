//! Step memory - outputs remembered across runs of the same workflow

mod schema;
mod store;

pub use store::{MemoryEntry, MemoryStore, format_memory_context};
