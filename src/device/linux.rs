//! Linux TUN device: `/dev/net/tun` in IFF_TUN/IFF_NO_PI mode, non-blocking
//! and registered with the reactor.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use mio::unix::SourceFd;
use mio::Interest;
use tracing::{debug, info};

use crate::common::Error;
use crate::flow::{PacketPass, PacketRecv};
use crate::reactor::{IoToken, Readiness, Reactor};

pub struct Tun {
    core: Rc<TunCore>,
}

struct TunCore {
    reactor: Reactor,
    fd: OwnedFd,
    name: String,
    mtu: usize,
    token: Cell<Option<IoToken>>,
    output_iface: PacketRecv,
    out_pending: RefCell<Option<(BytesMut, usize)>>,
    input_iface: PacketPass,
    in_pending: RefCell<Option<Bytes>>,
    on_error: RefCell<Option<Box<dyn FnMut()>>>,
    errored: Cell<bool>,
}

impl Tun {
    /// Opens (or creates) the named TUN device and captures its MTU.
    pub fn open(
        reactor: &Reactor,
        name: Option<&str>,
        on_error: impl FnMut() + 'static,
    ) -> Result<Tun, Error> {
        let fd = open_tun_fd()?;
        let name = attach_tun(fd.as_raw_fd(), name)?;
        let mtu = query_mtu(&name)?;
        info!(device = %name, mtu, "TUN device opened");

        let core = Rc::new(TunCore {
            reactor: reactor.clone(),
            fd,
            name,
            mtu,
            token: Cell::new(None),
            output_iface: PacketRecv::new(reactor),
            out_pending: RefCell::new(None),
            input_iface: PacketPass::new(reactor, mtu),
            in_pending: RefCell::new(None),
            on_error: RefCell::new(Some(Box::new(on_error))),
            errored: Cell::new(false),
        });

        let weak = Rc::downgrade(&core);
        core.output_iface.set_recv_handler(move |buf: BytesMut, max: usize| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.out_pending.borrow().is_none());
                *core.out_pending.borrow_mut() = Some((buf, max));
                if !core.errored.get() {
                    TunCore::try_read(&core);
                }
            }
        });

        let weak = Rc::downgrade(&core);
        core.input_iface.set_send_handler(move |packet: Bytes| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.in_pending.borrow().is_none());
                *core.in_pending.borrow_mut() = Some(packet);
                if !core.errored.get() {
                    TunCore::try_write(&core);
                }
            }
        });

        let weak = Rc::downgrade(&core);
        let raw = core.fd.as_raw_fd();
        let token = reactor.add_io(
            &mut SourceFd(&raw),
            Interest::READABLE | Interest::WRITABLE,
            Box::new(move |ready: Readiness| {
                if let Some(core) = weak.upgrade() {
                    TunCore::on_ready(&core, ready);
                }
            }),
        )?;
        core.token.set(Some(token));

        Ok(Tun { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn mtu(&self) -> usize {
        self.core.mtu
    }

    /// Packets read from the device.
    pub fn output(&self) -> PacketRecv {
        self.core.output_iface.clone()
    }

    /// Packets to be written to the device.
    pub fn input(&self) -> PacketPass {
        self.core.input_iface.clone()
    }
}

impl TunCore {
    fn on_ready(core: &Rc<TunCore>, ready: Readiness) {
        if core.errored.get() {
            return;
        }
        if ready.error {
            Self::report_error(core);
            return;
        }
        if ready.readable && core.out_pending.borrow().is_some() {
            Self::try_read(core);
        }
        if core.errored.get() {
            return;
        }
        if ready.writable && core.in_pending.borrow().is_some() {
            Self::try_write(core);
        }
    }

    fn try_read(core: &Rc<TunCore>) {
        let (mut buf, max) = {
            let mut pending = core.out_pending.borrow_mut();
            match pending.take() {
                Some(p) => p,
                None => return,
            }
        };
        buf.resize(max, 0);
        let fd = core.fd.as_raw_fd();
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, max) };
            if n > 0 {
                buf.truncate(n as usize);
                debug!(len = n, "device: received packet");
                core.output_iface.done(buf);
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    buf.truncate(0);
                    *core.out_pending.borrow_mut() = Some((buf, max));
                    return;
                }
                io::ErrorKind::Interrupted => continue,
                _ => {
                    debug!(error = %err, "device: read failed");
                    Self::report_error(core);
                    return;
                }
            }
        }
    }

    fn try_write(core: &Rc<TunCore>) {
        let packet = {
            let pending = core.in_pending.borrow();
            match pending.as_ref() {
                Some(p) => p.clone(),
                None => return,
            }
        };
        let fd = core.fd.as_raw_fd();
        loop {
            let n = unsafe {
                libc::write(fd, packet.as_ptr() as *const libc::c_void, packet.len())
            };
            if n >= 0 {
                // TUN writes are atomic per packet.
                *core.in_pending.borrow_mut() = None;
                core.input_iface.done();
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    debug!(error = %err, "device: write failed");
                    Self::report_error(core);
                    return;
                }
            }
        }
    }

    fn report_error(core: &Rc<TunCore>) {
        if core.errored.get() {
            return;
        }
        core.errored.set(true);
        let taken = core.on_error.borrow_mut().take();
        if let Some(mut f) = taken {
            f();
            let mut slot = core.on_error.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}

impl Drop for Tun {
    fn drop(&mut self) {
        if let Some(token) = self.core.token.take() {
            let raw = self.core.fd.as_raw_fd();
            self.core.reactor.remove_io(token, &mut SourceFd(&raw));
        }
        self.core.output_iface.detach();
        self.core.input_iface.detach();
    }
}

fn open_tun_fd() -> Result<OwnedFd, Error> {
    let fd: RawFd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(Error::InitFailure(format!(
            "open /dev/net/tun: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn attach_tun(fd: RawFd, name: Option<&str>) -> Result<String, Error> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    if let Some(name) = name {
        let bytes = name.as_bytes();
        if bytes.len() >= libc::IFNAMSIZ {
            return Err(Error::InitFailure(format!("device name too long: {}", name)));
        }
        for (i, b) in bytes.iter().enumerate() {
            ifr.ifr_name[i] = *b as libc::c_char;
        }
    }
    unsafe {
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
    }
    let res = unsafe { libc::ioctl(fd, libc::TUNSETIFF, &ifr) };
    if res < 0 {
        return Err(Error::InitFailure(format!(
            "TUNSETIFF: {}",
            io::Error::last_os_error()
        )));
    }
    let name = unsafe { std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Ok(name)
}

fn query_mtu(name: &str) -> Result<usize, Error> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(Error::InitFailure(format!(
            "socket for MTU query: {}",
            io::Error::last_os_error()
        )));
    }
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in name.as_bytes().iter().take(libc::IFNAMSIZ - 1).enumerate() {
        ifr.ifr_name[i] = *b as libc::c_char;
    }
    let res = unsafe { libc::ioctl(sock, libc::SIOCGIFMTU, &mut ifr) };
    let mtu = unsafe { ifr.ifr_ifru.ifru_mtu };
    unsafe { libc::close(sock) };
    if res < 0 {
        return Err(Error::InitFailure(format!(
            "SIOCGIFMTU: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(mtu as usize)
}
