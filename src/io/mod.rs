//! I/O layer: buffers, packet queues, and wire framing
//!
//! This module holds the data structures the socket shim runs on:
//!
//! - **pool**: a fixed-population free list of byte buffers, so the hot
//!   ingress path never allocates
//! - **queue**: a bounded FIFO of framed packets per socket descriptor
//! - **frame**: the magic-prefixed metadata header carried on the wire
//! - **table**: the process-global descriptor-to-queue map

pub mod frame;
pub mod pool;
pub mod queue;
pub mod table;

pub use self::frame::{FrameHeader, HEADER_LEN, MAGIC, MAGIC_LEN, MAX_PAYLOAD, PACKET_SIZE};
pub use self::pool::{Buffer, BufferPool, BUFFER_LEN, DEFAULT_POOL_BUFFERS};
pub use self::queue::{Packet, PacketQueue, QUEUE_CAPACITY};
pub use self::table::{DescriptorTable, SharedQueue};
