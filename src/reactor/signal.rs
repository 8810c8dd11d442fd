//! SIGINT/SIGTERM delivery into the reactor via the self-pipe trick. The
//! async-signal context only writes one byte; everything else happens on the
//! reactor side of the pipe.

use std::cell::RefCell;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use mio::unix::pipe::{self, Receiver, Sender};
use mio::Interest;

use super::{IoToken, Reactor};

static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_sig: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 0;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Owns the pipe and the reactor registration for termination signals. The
/// handler fires once per delivered signal batch.
pub struct SignalWatcher {
    reactor: Reactor,
    receiver: Rc<RefCell<Receiver>>,
    _sender: Sender,
    token: IoToken,
}

impl SignalWatcher {
    pub fn new(reactor: &Reactor, mut handler: Box<dyn FnMut()>) -> io::Result<SignalWatcher> {
        let (sender, receiver) = pipe::new()?;
        NOTIFY_FD.store(sender.as_raw_fd(), Ordering::Relaxed);

        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            let f: extern "C" fn(libc::c_int) = on_signal;
            sa.sa_sigaction = f as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
            libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        }

        let receiver = Rc::new(RefCell::new(receiver));
        let recv_in_handler = receiver.clone();
        let token = reactor.add_io(
            &mut *receiver.borrow_mut(),
            Interest::READABLE,
            Box::new(move |_ready| {
                let mut scratch = [0u8; 64];
                while let Ok(n) = recv_in_handler.borrow_mut().read(&mut scratch) {
                    if n == 0 {
                        break;
                    }
                }
                handler();
            }),
        )?;

        Ok(SignalWatcher {
            reactor: reactor.clone(),
            receiver,
            _sender: sender,
            token,
        })
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        NOTIFY_FD.store(-1, Ordering::Relaxed);
        self.reactor
            .remove_io(self.token, &mut *self.receiver.borrow_mut());
    }
}
