// Adapters layer: concrete transports to the protocol server.

pub mod memory;
pub mod stdio;

pub use memory::{memory_channel, memory_connector, MemoryChannel, MemoryConnector, MemoryServer};
pub use stdio::{ServerCommand, StdioChannel, StdioConnector};
