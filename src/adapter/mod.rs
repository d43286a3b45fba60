pub mod memory;

pub use memory::{MemoryDatabaseAdmin, MemoryInventory, MemoryObjectStore, MemoryRepository};
