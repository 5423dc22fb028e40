//! User-facing connection handles.
//!
//! A handle names one connection endpoint. It is reference-counted, but it
//! does not own its socket: the socket owns every live handle through its
//! active-handle table, which is what lets a forced close walk and
//! invalidate all of them without waiting on user references. While
//! `references > 0` the handle sits in that table and the socket is not
//! closed.

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{
    AtomicBool, AtomicUsize,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::{Arc, Mutex, Weak};

use crate::errors::{NmError, NmResult};
use crate::event::NetIEvent;
use crate::socket::{NmSocket, NmSocketType, RecvCb, SendCb};
use crate::{tcp, tcpdns, tls, udp};

pub type ResetCb = Box<dyn FnOnce() + Send>;
pub type FreeCb = Box<dyn FnOnce() + Send>;

fn unspec() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

pub struct NmHandle {
    pub(crate) me: Weak<NmHandle>,
    pub(crate) references: AtomicUsize,
    /// Set once the handle has been deactivated; guards against callbacks
    /// firing twice when a forced close races a final detach.
    pub(crate) dead: AtomicBool,
    pub(crate) sock: Mutex<Weak<NmSocket>>,
    /// Slot in the owning socket's active-handle table.
    pub(crate) ah_pos: AtomicUsize,
    pub(crate) peer: Mutex<SocketAddr>,
    pub(crate) local: Mutex<SocketAddr>,
    pub(crate) opaque: Mutex<Option<Box<dyn Any + Send>>>,
    pub(crate) on_reset: Mutex<Option<ResetCb>>,
    pub(crate) on_free: Mutex<Option<FreeCb>>,
    /// Caller-sized scratch region, allocated per the listener's
    /// `extrahandlesize`.
    pub(crate) extra: Mutex<Vec<u8>>,
}

impl NmHandle {
    pub(crate) fn alloc(extrasize: usize) -> Arc<NmHandle> {
        Arc::new_cyclic(|me| NmHandle {
            me: me.clone(),
            references: AtomicUsize::new(1),
            dead: AtomicBool::new(false),
            sock: Mutex::new(Weak::new()),
            ah_pos: AtomicUsize::new(0),
            peer: Mutex::new(unspec()),
            local: Mutex::new(unspec()),
            opaque: Mutex::new(None),
            on_reset: Mutex::new(None),
            on_free: Mutex::new(None),
            extra: Mutex::new(vec![0u8; extrasize]),
        })
    }

    /// Strip per-connection state before the handle goes back on its
    /// socket's reuse stack.
    pub(crate) fn recycle(&self) {
        *self.sock.lock().unwrap() = Weak::new();
        *self.opaque.lock().unwrap() = None;
        *self.on_reset.lock().unwrap() = None;
        *self.on_free.lock().unwrap() = None;
        for b in self.extra.lock().unwrap().iter_mut() {
            *b = 0;
        }
    }

    /// Take an additional reference.
    pub fn attach(&self) -> Arc<NmHandle> {
        self.references.fetch_add(1, AcqRel);
        self.me.upgrade().expect("live handle upgrades")
    }

    /// Drop one reference. When the last reference goes, the handle is
    /// deactivated on its owning worker: the reset callback runs, the
    /// handle leaves the active-handle table, and the socket's
    /// close-handle callback fires.
    pub fn detach(h: Arc<NmHandle>) {
        let prev = h.references.fetch_sub(1, AcqRel);
        debug_assert!(prev >= 1);
        if prev != 1 || h.dead.load(Acquire) {
            return;
        }
        let sock = h.sock.lock().unwrap().upgrade();
        let Some(sock) = sock else {
            h.dead.store(true, Release);
            return;
        };
        if crate::worker::current_tid() == Some(sock.tid) {
            sock.deactivate_handle(&h);
        } else {
            let ev = NetIEvent::CloseHandle {
                sock: sock.clone(),
                handle: h,
            };
            sock.mgr.enqueue(sock.tid, ev);
        }
    }

    pub fn references(&self) -> usize {
        self.references.load(Acquire)
    }

    pub fn peer(&self) -> SocketAddr {
        *self.peer.lock().unwrap()
    }

    pub fn local(&self) -> SocketAddr {
        *self.local.lock().unwrap()
    }

    pub fn socket(&self) -> Option<Arc<NmSocket>> {
        self.sock.lock().unwrap().upgrade()
    }

    /// Attach caller data and optional lifecycle callbacks: `on_reset`
    /// runs when the handle is deactivated, `on_free` when it is torn
    /// down without going back on the reuse stack.
    pub fn set_data(
        &self,
        data: Box<dyn Any + Send>,
        on_reset: Option<ResetCb>,
        on_free: Option<FreeCb>,
    ) {
        *self.opaque.lock().unwrap() = Some(data);
        *self.on_reset.lock().unwrap() = on_reset;
        *self.on_free.lock().unwrap() = on_free;
    }

    pub fn take_data(&self) -> Option<Box<dyn Any + Send>> {
        self.opaque.lock().unwrap().take()
    }

    /// Access the fixed extra-bytes region that trails every handle of
    /// this socket.
    pub fn with_extra<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.extra.lock().unwrap())
    }

    fn live_socket(&self) -> NmResult<Arc<NmSocket>> {
        self.sock
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(NmError::NotConnected)
    }

    /// Send `region` on this handle's connection; dispatches per
    /// transport. The callback fires exactly once, on the owning worker.
    pub fn send(&self, region: &[u8], cb: SendCb) -> NmResult<()> {
        let sock = self.live_socket()?;
        match sock.sock_type {
            NmSocketType::Udp => udp::send(&sock, self, region, cb),
            NmSocketType::Tcp => tcp::send(&sock, self, region, cb),
            NmSocketType::TcpDns => tcpdns::send(&sock, self, region, cb),
            NmSocketType::Tls => tls::send(&sock, self, region, cb),
            _ => Err(NmError::NotConnected),
        }
    }

    /// Start delivering received data to `cb`.
    pub fn read(&self, cb: RecvCb) -> NmResult<()> {
        let sock = self.live_socket()?;
        let ev = match sock.sock_type {
            NmSocketType::Udp => NetIEvent::UdpRead { sock: sock.clone() },
            NmSocketType::Tcp => NetIEvent::TcpStartRead { sock: sock.clone() },
            NmSocketType::TcpDns => NetIEvent::TcpDnsRead { sock: sock.clone() },
            NmSocketType::Tls => NetIEvent::TlsStartRead { sock: sock.clone() },
            _ => return Err(NmError::NotConnected),
        };
        *sock.recv_cb.lock().unwrap() = Some(cb);
        sock.mgr.enqueue(sock.tid, ev);
        Ok(())
    }

    /// Stop reading; the receive callback fires one final time with
    /// `Cancelled` on the owning worker, and never again afterwards.
    pub fn cancel_read(&self) {
        let Ok(sock) = self.live_socket() else { return };
        let ev = match sock.sock_type {
            NmSocketType::Udp => NetIEvent::UdpCancel {
                sock: sock.clone(),
                handle: self.attach(),
            },
            NmSocketType::Tcp | NmSocketType::Tls => NetIEvent::TcpCancel {
                sock: sock.clone(),
                handle: self.attach(),
            },
            NmSocketType::TcpDns => NetIEvent::TcpDnsCancel {
                sock: sock.clone(),
                handle: self.attach(),
            },
            _ => return,
        };
        sock.mgr.enqueue(sock.tid, ev);
    }

    /// Stop pulling data from the transport; in-flight callbacks complete
    /// normally.
    pub fn pause_read(&self) -> NmResult<()> {
        let sock = self.live_socket()?;
        match sock.sock_type {
            NmSocketType::Tcp => {
                sock.mgr
                    .enqueue(sock.tid, NetIEvent::TcpPauseRead { sock: sock.clone() });
            }
            NmSocketType::TcpDns | NmSocketType::Tls => {
                sock.set_readpaused(true);
                if let Some(outer) = sock.outer_sock() {
                    sock.mgr
                        .enqueue(outer.tid, NetIEvent::TcpPauseRead { sock: outer });
                }
            }
            _ => return Err(NmError::NotConnected),
        }
        Ok(())
    }

    pub fn resume_read(&self) -> NmResult<()> {
        let sock = self.live_socket()?;
        match sock.sock_type {
            NmSocketType::Tcp => {
                sock.mgr
                    .enqueue(sock.tid, NetIEvent::TcpStartRead { sock: sock.clone() });
            }
            NmSocketType::TcpDns => {
                sock.set_readpaused(false);
                if let Some(outer) = sock.outer_sock() {
                    sock.mgr
                        .enqueue(outer.tid, NetIEvent::TcpStartRead { sock: outer });
                }
                sock.mgr
                    .enqueue(sock.tid, NetIEvent::TcpDnsRead { sock: sock.clone() });
            }
            NmSocketType::Tls => {
                sock.set_readpaused(false);
                if let Some(outer) = sock.outer_sock() {
                    sock.mgr
                        .enqueue(outer.tid, NetIEvent::TcpStartRead { sock: outer });
                }
                sock.mgr
                    .enqueue(sock.tid, NetIEvent::TlsDoIo { sock: sock.clone() });
            }
            _ => return Err(NmError::NotConnected),
        }
        Ok(())
    }

    /// Set the read timeout (milliseconds) for this connection; takes
    /// effect the next time the timer is armed.
    pub fn set_timeout(&self, ms: u64) {
        if let Ok(sock) = self.live_socket() {
            sock.set_read_timeout(ms);
            if let Some(outer) = sock.outer_sock() {
                outer.set_read_timeout(ms);
            }
        }
    }

    /// Switch a framed DNS connection to strictly sequential processing:
    /// the next query is delivered only after the response to the
    /// previous one has been sent.
    pub fn set_sequential(&self, on: bool) {
        if let Ok(sock) = self.live_socket() {
            if sock.sock_type == NmSocketType::TcpDns {
                sock.set_sequential(on);
            }
        }
    }

    /// Use the keepalive timeout instead of the idle timeout for this
    /// connection.
    pub fn set_keepalive(&self, on: bool) {
        if let Ok(sock) = self.live_socket() {
            sock.set_keepalive(on);
            if let Some(outer) = sock.outer_sock() {
                outer.set_keepalive(on);
            }
        }
    }
}

impl std::fmt::Debug for NmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NmHandle")
            .field("peer", &self.peer())
            .field("local", &self.local())
            .field("references", &self.references())
            .finish()
    }
}
