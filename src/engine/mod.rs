//! The TUN-to-SOCKS bridging engine.
//!
//! Wiring, in dependency order: the device write side first (writer →
//! packet buffer → device input), then the stack (so its output hook can
//! emit into the writer), then the device read side (so packets can reach
//! the stack). Per-connection bridging lives in [`client`].

mod client;

pub use client::TcpClient;

use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::common::{Error, DEVICE_WRITE_BUFFER_PACKETS, TCP_TICK_INTERVAL_MS};
use crate::flow::{BufferWriter, PacketBuffer, PacketPass, PacketRecv, SinglePacketBuffer};
use crate::reactor::{Job, Reactor, Timer};
use crate::stack::{AcceptError, ConnHandle, Netstack, Pbuf, StackHooks};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Device MTU captured at open time; bounds every packet path.
    pub mtu: usize,
    /// SOCKS5 server address.
    pub socks_server: SocketAddr,
    /// Optional replacement for the intercepted destination, used by tests
    /// and debugging setups.
    pub override_dest: Option<SocketAddr>,
}

pub struct Engine {
    pub(crate) core: Rc<EngineCore>,
}

pub(crate) struct EngineCore {
    pub(crate) reactor: Reactor,
    pub(crate) cfg: EngineConfig,
    pub(crate) stack: Box<dyn Netstack>,
    pub(crate) writer: BufferWriter,
    _write_buffer: PacketBuffer,
    read_if: PacketPass,
    _read_buffer: SinglePacketBuffer,
    tcp_timer: RefCell<Option<Timer>>,
    init_job: RefCell<Option<Job>>,
    pub(crate) quitting: Cell<bool>,
    pub(crate) clients: RefCell<ClientTable>,
}

pub(crate) struct ClientTable {
    slots: Vec<Option<Rc<RefCell<TcpClient>>>>,
    free: Vec<usize>,
    count: usize,
}

impl ClientTable {
    fn new() -> Self {
        ClientTable {
            slots: Vec::new(),
            free: Vec::new(),
            count: 0,
        }
    }

    pub(crate) fn insert(&mut self, client: Rc<RefCell<TcpClient>>) -> usize {
        self.count += 1;
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(client);
                i
            }
            None => {
                self.slots.push(Some(client));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn remove(&mut self, slot: usize) {
        debug_assert!(self.slots[slot].is_some());
        self.slots[slot] = None;
        self.free.push(slot);
        self.count -= 1;
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn get(&self, slot: usize) -> Option<Rc<RefCell<TcpClient>>> {
        self.slots.get(slot).and_then(|s| s.clone())
    }

    fn drain_all(&mut self) -> Vec<Rc<RefCell<TcpClient>>> {
        self.slots.iter().flatten().cloned().collect()
    }
}

impl Engine {
    /// Builds the engine around an already-created reactor, a stack and the
    /// device's two flow endpoints.
    pub fn new(
        reactor: &Reactor,
        cfg: EngineConfig,
        stack: Box<dyn Netstack>,
        device_output: PacketRecv,
        device_input: PacketPass,
    ) -> Result<Engine, Error> {
        // Device write side first: the stack's output hook lands here.
        let (write_buffer, writer) =
            PacketBuffer::new(reactor, device_input, DEVICE_WRITE_BUFFER_PACKETS);

        let read_if = PacketPass::new(reactor, cfg.mtu);

        let core = Rc::new(EngineCore {
            reactor: reactor.clone(),
            cfg,
            stack,
            writer,
            _write_buffer: write_buffer,
            read_if: read_if.clone(),
            _read_buffer: SinglePacketBuffer::new(reactor, device_output, read_if.clone()),
            tcp_timer: RefCell::new(None),
            init_job: RefCell::new(None),
            quitting: Cell::new(false),
            clients: RefCell::new(ClientTable::new()),
        });

        // Device read side: every packet is acknowledged immediately so the
        // read loop keeps running, then injected into the stack.
        let weak = Rc::downgrade(&core);
        read_if.set_send_handler(move |frame: Bytes| {
            if let Some(core) = weak.upgrade() {
                EngineCore::on_device_packet(&core, frame);
            }
        });

        // The stack starts from a job on the first reactor iteration.
        let weak = Rc::downgrade(&core);
        let init_job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                EngineCore::start_stack(&core);
            }
        });
        reactor.schedule_job(&init_job);
        *core.init_job.borrow_mut() = Some(init_job);

        // Periodic stack tick, re-armed from its own handler.
        let weak = Rc::downgrade(&core);
        let timer = Timer::new(move || {
            if let Some(core) = weak.upgrade() {
                EngineCore::on_tick(&core);
            }
        });
        reactor.set_timer_relative(&timer, Duration::from_millis(TCP_TICK_INTERVAL_MS));
        *core.tcp_timer.borrow_mut() = Some(timer);

        Ok(Engine { core })
    }

    /// Number of live bridged connections.
    pub fn client_count(&self) -> usize {
        self.core.clients.borrow().count()
    }

    /// Begins orderly termination: stops feeding the stack and asks the
    /// reactor to exit. Remaining clients are destroyed by `shutdown` after
    /// the loop returns.
    pub fn terminate(&self) {
        if self.core.quitting.get() {
            return;
        }
        info!("tearing down");
        self.core.quitting.set(true);
        if let Some(timer) = self.core.tcp_timer.borrow().as_ref() {
            self.core.reactor.remove_timer(timer);
        }
        if let Some(job) = self.core.init_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
        self.core.reactor.quit(0);
    }

    /// Destroys every remaining client unconditionally. Call after the
    /// reactor loop has returned.
    pub fn shutdown(&self) {
        let clients = self.core.clients.borrow_mut().drain_all();
        for cl in clients {
            {
                let c = cl.borrow();
                info!(local = %c.local_addr, remote = %c.remote_addr, "killing client");
            }
            client::murder(&self.core, &cl);
        }
        debug_assert_eq!(self.core.clients.borrow().count(), 0);
    }
}

impl EngineCore {
    fn start_stack(core: &Rc<EngineCore>) {
        if core.quitting.get() {
            return;
        }
        debug!("stack init");

        let weak: Weak<EngineCore> = Rc::downgrade(core);
        let output = Box::new(move |pbuf: &Pbuf| {
            if let Some(core) = weak.upgrade() {
                EngineCore::on_stack_output(&core, pbuf);
            }
        });

        let weak = Rc::downgrade(core);
        let accept = Box::new(
            move |conn: ConnHandle, local: SocketAddrV4, remote: SocketAddrV4| {
                match weak.upgrade() {
                    Some(core) => client::on_accept(&core, conn, local, remote),
                    None => Err(AcceptError::Mem),
                }
            },
        );

        if let Err(e) = core.stack.start(StackHooks { output, accept }) {
            error!(error = %e, "stack start failed");
            core.quitting.set(true);
            core.reactor.quit(1);
        }
    }

    fn on_tick(core: &Rc<EngineCore>) {
        if core.quitting.get() {
            return;
        }
        if let Some(timer) = core.tcp_timer.borrow().as_ref() {
            core.reactor
                .set_timer_relative(timer, Duration::from_millis(TCP_TICK_INTERVAL_MS));
        }
        core.stack.tick();
    }

    fn on_device_packet(core: &Rc<EngineCore>, frame: Bytes) {
        // Accept the packet immediately to keep the device read loop going.
        core.read_if.done();
        if core.quitting.get() {
            return;
        }
        debug!(len = frame.len(), "device: received packet");
        core.stack.inject(&frame);
    }

    /// The stack's netif output path: flatten the chain into a writer slot
    /// and let the buffer's deferred submit run before returning into the
    /// stack.
    fn on_stack_output(core: &Rc<EngineCore>, pbuf: &Pbuf) {
        if core.quitting.get() {
            return;
        }
        debug!(len = pbuf.total_len(), "device write: send packet");

        let Some(mut slot) = core.writer.start_packet() else {
            debug!("device write: no buffer space, dropping");
            return;
        };
        let mtu = core.writer.mtu();
        let mut len = 0;
        for seg in pbuf.segments() {
            if len + seg.len() > mtu {
                warn!("device write: packet exceeds MTU, truncating");
                break;
            }
            slot[len..len + seg.len()].copy_from_slice(seg);
            len += seg.len();
        }
        core.writer.end_packet(slot, len);
        core.reactor.flush_pending();
    }
}
