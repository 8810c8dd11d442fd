//! Non-blocking sockets integrated with the reactor, exposing stream
//! connections through `StreamPass`/`StreamRecv` and datagram sockets
//! through `PacketPass`/`PacketRecv`.

mod tcp;
mod udp;

pub use tcp::{Connection, ConnectionEvent, Connector, Listener};
pub use udp::{Datagram, DatagramEvent};

/// Per-direction inline-completion budget per reactor iteration.
pub(crate) const DISPATCH_LIMIT: u32 = 2;
