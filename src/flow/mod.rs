//! Composable packet-flow building blocks: the four typed interfaces plus
//! the adapters that connect them (buffers, framing, flow multiplexers).

mod iface;

pub mod fair_queue;
pub mod packet_buffer;
pub mod priority_queue;
pub mod proto;
pub mod single_buffer;

pub use fair_queue::{FairQueue, FairQueueFlow};
pub use iface::{PacketPass, PacketRecv, StreamPass, StreamRecv};
pub use packet_buffer::{BufferWriter, PacketBuffer};
pub use priority_queue::{PriorityQueue, PriorityQueueFlow};
pub use proto::{PacketProtoDecoder, PacketProtoEncoder, HEADER_LEN};
pub use single_buffer::SinglePacketBuffer;
