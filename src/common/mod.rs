pub mod error;

pub use error::Error;

/// Receive window granted to every intercepted TCP connection; also the size
/// of the per-client staging buffer between the stack and the SOCKS tunnel.
pub const TCP_WND: usize = 8 * 1024;

/// Size of the per-client buffer holding bytes received from the SOCKS server
/// while they are being queued into the stack.
pub const SOCKS_RECV_BUF_SIZE: usize = 8 * 1024;

/// Capacity, in packets, of the buffer between the stack's output hook and
/// the TUN device write side.
pub const DEVICE_WRITE_BUFFER_PACKETS: usize = 32;

/// Interval of the periodic stack timer tick, in milliseconds.
pub const TCP_TICK_INTERVAL_MS: u64 = 250;
