pub mod framer;
pub mod inbox;
pub mod memory;
pub mod transport;
pub mod wire;

pub use framer::Framer;
pub use inbox::{InputBuffer, Inbox};
pub use memory::{MemoryTransport, Mesh};
pub use transport::{Destination, Transport};
pub use wire::{FrameHeader, MessageKind, RESERVED_BYTES};
