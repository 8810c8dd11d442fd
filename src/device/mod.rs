//! TUN device integration. The engine consumes a device through two flow
//! endpoints: a `PacketRecv` producing packets read from the device, and a
//! `PacketPass` accepting packets to write. Platform glue lives in
//! per-target submodules.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::Tun;
