//! Identity store backends

pub mod memory;
pub mod security;

pub use memory::MemoryStore;
pub use security::SecurityCli;
