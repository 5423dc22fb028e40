//! Per-connection and per-listener socket state.
//!
//! `NmSocket` is the tagged union at the heart of the manager: one type
//! covers single connections, multi-child listeners, and the wrapping
//! relationships (framed DNS over TCP, TLS over TCP). A socket is pinned
//! to the worker named by `tid` at creation; every operation on its I/O
//! state runs there, routed through tagged events. Only the active-handle
//! table takes the socket lock.

use std::net::SocketAddr;
use std::sync::atomic::{
    AtomicBool, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::errors::{NmError, NmResult};
use crate::event::NetIEvent;
use crate::handle::NmHandle;
use crate::manager::NetMgr;
use crate::quota::{Quota, QuotaGuard};
use crate::req::IoReq;
use crate::stats::StatId;
use crate::tls::TlsState;

/// Discriminant for the socket union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmSocketType {
    Udp = 0,
    UdpListener = 1,
    Tcp = 2,
    TcpListener = 3,
    TcpDns = 4,
    TcpDnsListener = 5,
    Tls = 6,
    TlsListener = 7,
}

impl NmSocketType {
    pub(crate) const COUNT: usize = 8;
    pub(crate) const ALL: [NmSocketType; 8] = [
        NmSocketType::Udp,
        NmSocketType::UdpListener,
        NmSocketType::Tcp,
        NmSocketType::TcpListener,
        NmSocketType::TcpDns,
        NmSocketType::TcpDnsListener,
        NmSocketType::Tls,
        NmSocketType::TlsListener,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NmSocketType::Udp => "udp",
            NmSocketType::UdpListener => "udplistener",
            NmSocketType::Tcp => "tcp",
            NmSocketType::TcpListener => "tcplistener",
            NmSocketType::TcpDns => "tcpdns",
            NmSocketType::TcpDnsListener => "tcpdnslistener",
            NmSocketType::Tls => "tls",
            NmSocketType::TlsListener => "tlslistener",
        }
    }

    pub fn is_listener(self) -> bool {
        matches!(
            self,
            NmSocketType::UdpListener
                | NmSocketType::TcpListener
                | NmSocketType::TcpDnsListener
                | NmSocketType::TlsListener
        )
    }
}

// ---------------------------------------------------------------------------
// Callback signatures
// ---------------------------------------------------------------------------

/// Receive callback: handle, and either a borrowed view of the received
/// bytes or the error that ended the read. Runs on the owning worker.
pub type RecvCb = Arc<dyn Fn(&Arc<NmHandle>, NmResult<&[u8]>) + Send + Sync>;
/// Send completion; fires exactly once per send.
pub type SendCb = Box<dyn FnOnce(&Arc<NmHandle>, NmResult<()>) + Send>;
/// Connect completion; the handle is absent on failure.
pub type ConnectCb = Box<dyn FnOnce(Option<&Arc<NmHandle>>, NmResult<()>) + Send>;
/// Accept callback; the handle is absent when the connection was refused
/// (e.g. quota exhausted).
pub type AcceptCb = Arc<dyn Fn(Option<&Arc<NmHandle>>, NmResult<()>) + Send + Sync>;
/// Fired on the socket each time one of its handles is deactivated.
pub type CloseHandleCb = Arc<dyn Fn(&Arc<NmSocket>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Active-handle table
// ---------------------------------------------------------------------------

/// Compact allocator mapping live handles to slot indices.
///
/// `frees` is a permutation of `0..size`: positions `[0, ah)` hold the
/// currently allocated slot indices and `[ah, size)` the free ones.
/// `slot_of[pos]` records where `pos` currently sits inside `frees`, which
/// keeps both insert and out-of-order removal O(1).
pub(crate) struct ActiveHandles {
    ah: usize,
    frees: Vec<usize>,
    slot_of: Vec<usize>,
    handles: Vec<Option<Arc<NmHandle>>>,
}

impl ActiveHandles {
    pub fn new() -> Self {
        ActiveHandles {
            ah: 0,
            frees: Vec::new(),
            slot_of: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ah
    }

    pub fn insert(&mut self, h: Arc<NmHandle>) -> usize {
        if self.ah == self.handles.len() {
            let n = self.handles.len();
            self.handles.push(None);
            self.frees.push(n);
            self.slot_of.push(n);
        }
        let pos = self.frees[self.ah];
        debug_assert!(self.handles[pos].is_none());
        self.handles[pos] = Some(h);
        self.ah += 1;
        pos
    }

    pub fn remove(&mut self, pos: usize) -> Option<Arc<NmHandle>> {
        let h = self.handles.get_mut(pos)?.take()?;
        let i = self.slot_of[pos];
        debug_assert!(i < self.ah && self.frees[i] == pos);
        let last = self.ah - 1;
        self.frees.swap(i, last);
        self.slot_of[self.frees[i]] = i;
        self.slot_of[self.frees[last]] = last;
        self.ah = last;
        Some(h)
    }

    pub fn live(&self) -> impl Iterator<Item = &Arc<NmHandle>> {
        self.handles.iter().flatten()
    }

    /// Table consistency: every live handle's recorded position resolves
    /// back to itself through the allocated prefix of `frees`.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut live = 0;
        for (pos, slot) in self.handles.iter().enumerate() {
            if let Some(h) = slot {
                live += 1;
                assert_eq!(h.ah_pos.load(Relaxed), pos);
                let i = self.slot_of[pos];
                assert!(i < self.ah, "allocated pos {pos} outside frees[0..ah)");
                assert_eq!(self.frees[i], pos);
            }
        }
        assert_eq!(live, self.ah);
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

pub(crate) struct ListenSync {
    pub pending: usize,
    pub err: Option<NmError>,
}

pub(crate) const NO_TOKEN: usize = usize::MAX;

pub struct NmSocket {
    pub(crate) me: Weak<NmSocket>,
    pub(crate) mgr: Arc<NetMgr>,
    pub(crate) sock_type: NmSocketType,
    /// Owning worker; immutable after creation.
    pub(crate) tid: usize,
    pub(crate) uid: u64,
    /// Address this socket listens on or binds from.
    pub(crate) iface: SocketAddr,
    pub(crate) extrahandlesize: usize,
    pub(crate) backlog: std::sync::atomic::AtomicU32,

    /// Parent listener, for per-worker children.
    pub(crate) parent: Mutex<Weak<NmSocket>>,
    /// Listener this connection was accepted on.
    pub(crate) listener: Mutex<Weak<NmSocket>>,
    /// Carrier socket for wrappers (framed DNS over TCP, TLS over TCP).
    pub(crate) outer: Mutex<Option<Arc<NmSocket>>>,
    /// Wrapper riding on this socket, if any.
    pub(crate) wrapper: Mutex<Weak<NmSocket>>,
    /// Handle pinning the carrier connection alive.
    pub(crate) outerhandle: Mutex<Option<Arc<NmHandle>>>,
    /// Self-loop for wrapper connections, which have no I/O registration
    /// of their own to own them; broken when the socket closes.
    pub(crate) selfref: Mutex<Option<Arc<NmSocket>>>,
    pub(crate) children: Mutex<Vec<Arc<NmSocket>>>,
    /// Running (listening) children.
    pub(crate) rchildren: AtomicUsize,

    pub(crate) peer: Mutex<Option<SocketAddr>>,
    pub(crate) local: Mutex<Option<SocketAddr>>,

    /// mio token on the owning worker, `NO_TOKEN` when unregistered.
    pub(crate) token: AtomicUsize,
    pub(crate) references: AtomicUsize,

    pub(crate) active: AtomicBool,
    pub(crate) destroying: AtomicBool,
    pub(crate) closing: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) listening: AtomicBool,
    pub(crate) listen_error: AtomicBool,
    pub(crate) connecting: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) connect_error: AtomicBool,
    /// Outgoing connection (we are the client, not the server).
    pub(crate) client: AtomicBool,
    pub(crate) sequential: AtomicBool,
    pub(crate) overlimit: AtomicBool,
    pub(crate) processing: AtomicBool,
    pub(crate) readpaused: AtomicBool,
    pub(crate) keepalive: AtomicBool,

    /// Milliseconds; timers re-arm from these on each read / connect.
    pub(crate) read_timeout: AtomicU64,
    pub(crate) connect_timeout: AtomicU64,
    /// Bumped to invalidate any scheduled timer entry.
    pub(crate) timer_gen: AtomicU64,

    pub(crate) quota: Mutex<Option<QuotaGuard>>,
    /// Non-owning quota reference carried by listeners; attached (made
    /// owning) on each accepted connection.
    pub(crate) pquota: Mutex<Option<Arc<Quota>>>,

    pub(crate) recv_cb: Mutex<Option<RecvCb>>,
    pub(crate) accept_cb: Mutex<Option<AcceptCb>>,
    pub(crate) connect_cb: Mutex<Option<ConnectCb>>,
    pub(crate) closehandle_cb: Mutex<Option<CloseHandleCb>>,

    /// Primary handle for stream connections.
    pub(crate) statichandle: Mutex<Weak<NmHandle>>,
    pub(crate) ah: Mutex<ActiveHandles>,
    pub(crate) inactive_handles: Mutex<Vec<Arc<NmHandle>>>,
    pub(crate) inactive_reqs: Mutex<Vec<Box<IoReq>>>,

    /// Assembly buffer for DNS message framing.
    pub(crate) dnsbuf: Mutex<Vec<u8>>,
    /// Delivered-but-unanswered queries on a framed DNS connection.
    pub(crate) inflight: AtomicUsize,

    pub(crate) tls: Mutex<Option<TlsState>>,
    pub(crate) tls_listen_cfg: Mutex<Option<Arc<rustls::ServerConfig>>>,

    pub(crate) listen_sync: Mutex<ListenSync>,
    pub(crate) cond: Condvar,
}

impl NmSocket {
    pub(crate) fn new(
        mgr: &Arc<NetMgr>,
        sock_type: NmSocketType,
        tid: usize,
        iface: SocketAddr,
        extrahandlesize: usize,
    ) -> Arc<NmSocket> {
        let uid = mgr.next_uid();
        let sock = Arc::new_cyclic(|me| NmSocket {
            me: me.clone(),
            mgr: mgr.clone(),
            sock_type,
            tid,
            uid,
            iface,
            extrahandlesize,
            backlog: std::sync::atomic::AtomicU32::new(128),
            parent: Mutex::new(Weak::new()),
            listener: Mutex::new(Weak::new()),
            outer: Mutex::new(None),
            wrapper: Mutex::new(Weak::new()),
            outerhandle: Mutex::new(None),
            selfref: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            rchildren: AtomicUsize::new(0),
            peer: Mutex::new(None),
            local: Mutex::new(None),
            token: AtomicUsize::new(NO_TOKEN),
            references: AtomicUsize::new(1),
            active: AtomicBool::new(true),
            destroying: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            listen_error: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_error: AtomicBool::new(false),
            client: AtomicBool::new(false),
            sequential: AtomicBool::new(false),
            overlimit: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            readpaused: AtomicBool::new(false),
            keepalive: AtomicBool::new(false),
            read_timeout: AtomicU64::new(0),
            connect_timeout: AtomicU64::new(0),
            timer_gen: AtomicU64::new(0),
            quota: Mutex::new(None),
            pquota: Mutex::new(None),
            recv_cb: Mutex::new(None),
            accept_cb: Mutex::new(None),
            connect_cb: Mutex::new(None),
            closehandle_cb: Mutex::new(None),
            statichandle: Mutex::new(Weak::new()),
            ah: Mutex::new(ActiveHandles::new()),
            inactive_handles: Mutex::new(Vec::new()),
            inactive_reqs: Mutex::new(Vec::new()),
            dnsbuf: Mutex::new(Vec::new()),
            inflight: AtomicUsize::new(0),
            tls: Mutex::new(None),
            tls_listen_cfg: Mutex::new(None),
            listen_sync: Mutex::new(ListenSync {
                pending: 0,
                err: None,
            }),
            cond: Condvar::new(),
        });
        mgr.stats.of(sock_type).inc(StatId::Active);
        mgr.trace_insert(&sock);
        sock
    }

    // -- simple state ------------------------------------------------------

    pub fn sock_type(&self) -> NmSocketType {
        self.sock_type
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn is_active(&self) -> bool {
        if let Some(parent) = self.parent.lock().unwrap().upgrade() {
            return parent.active.load(Acquire);
        }
        self.active.load(Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Acquire)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Acquire)
    }

    /// Bound local address: resolved at listen/connect time.
    pub fn local_addr(&self) -> SocketAddr {
        self.local.lock().unwrap().unwrap_or(self.iface)
    }

    pub fn active_handles(&self) -> usize {
        self.ah.lock().unwrap().len()
    }

    pub(crate) fn set_readpaused(&self, on: bool) {
        self.readpaused.store(on, Release);
    }

    pub(crate) fn set_sequential(&self, on: bool) {
        self.sequential.store(on, Release);
    }

    pub(crate) fn set_keepalive(&self, on: bool) {
        self.keepalive.store(on, Release);
    }

    pub(crate) fn set_read_timeout(&self, ms: u64) {
        self.read_timeout.store(ms, Release);
    }

    pub(crate) fn outer_sock(&self) -> Option<Arc<NmSocket>> {
        self.outer.lock().unwrap().clone()
    }

    pub(crate) fn wrapper_sock(&self) -> Option<Arc<NmSocket>> {
        self.wrapper.lock().unwrap().upgrade()
    }

    pub(crate) fn arc(&self) -> Arc<NmSocket> {
        self.me.upgrade().expect("live socket upgrades")
    }

    /// Invalidate any scheduled timer for this socket.
    pub(crate) fn timer_cancel(&self) {
        self.timer_gen.fetch_add(1, AcqRel);
    }

    // -- reference counting ------------------------------------------------

    /// Take a logical reference to the socket.
    pub fn attach(&self) -> Arc<NmSocket> {
        self.references.fetch_add(1, AcqRel);
        self.arc()
    }

    /// Release a logical reference; at zero the socket is closed (if it
    /// was not already) and destroyed.
    pub fn detach(sock: &NmSocket) {
        let prev = sock.references.fetch_sub(1, AcqRel);
        debug_assert!(prev >= 1);
        if prev != 1 {
            return;
        }
        sock.prep_destroy();
    }

    pub(crate) fn prep_destroy(&self) {
        if !self.closed.load(Acquire) {
            if crate::worker::current_tid() == Some(self.tid) || self.sock_type.is_listener() {
                self.close();
            } else {
                self.mgr
                    .enqueue(self.tid, NetIEvent::Detach { sock: self.arc() });
            }
            return;
        }
        self.destroy_final();
    }

    pub(crate) fn destroy_final(&self) {
        if self.destroying.swap(true, AcqRel) {
            return;
        }
        self.mgr.trace_remove(self.uid);
        self.mgr.stats.of(self.sock_type).dec(StatId::Active);
        self.inactive_handles.lock().unwrap().clear();
        self.inactive_reqs.lock().unwrap().clear();
    }

    // -- handles -----------------------------------------------------------

    /// Get a handle for this socket, reusing a deactivated one when
    /// available, and enter it into the active-handle table.
    pub(crate) fn get_handle(&self, peer: SocketAddr, local: SocketAddr) -> Arc<NmHandle> {
        debug_assert!(!self.closed.load(Acquire));
        let h = self
            .inactive_handles
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| NmHandle::alloc(self.extrahandlesize));
        h.references.store(1, Release);
        h.dead.store(false, Release);
        *h.sock.lock().unwrap() = self.me.clone();
        *h.peer.lock().unwrap() = peer;
        *h.local.lock().unwrap() = local;
        let pos = self.ah.lock().unwrap().insert(h.clone());
        h.ah_pos.store(pos, Release);
        self.references.fetch_add(1, AcqRel);
        h
    }

    /// Tear one handle down: reset callback, table removal, close-handle
    /// callback, then reuse or free. Runs on the owning worker (or inline
    /// during shutdown).
    pub(crate) fn deactivate_handle(&self, h: &Arc<NmHandle>) {
        if h.dead.swap(true, AcqRel) {
            return;
        }
        if let Some(cb) = h.on_reset.lock().unwrap().take() {
            cb();
        }
        self.ah.lock().unwrap().remove(h.ah_pos.load(Acquire));
        let chcb = self.closehandle_cb.lock().unwrap().clone();
        if let Some(cb) = chcb {
            cb(&self.arc());
        }
        if self.is_active() && !self.closing.load(Acquire) {
            h.recycle();
            self.inactive_handles.lock().unwrap().push(h.clone());
        } else {
            if let Some(cb) = h.on_free.lock().unwrap().take() {
                cb();
            }
            h.recycle();
        }
        if self.close_on_last_handle()
            && self.ah.lock().unwrap().len() == 0
            && !self.closing.load(Acquire)
        {
            self.close();
        }
        NmSocket::detach(self);
    }

    /// Connection sockets whose lifetime is bound to their primary
    /// handle: outgoing clients and plain accepted stream connections.
    /// Framed DNS connections use per-query handles and persist between
    /// them; listener children come and go with datagrams.
    fn close_on_last_handle(&self) -> bool {
        match self.sock_type {
            NmSocketType::Udp => self.client.load(Acquire),
            NmSocketType::Tcp | NmSocketType::Tls => {
                self.client.load(Acquire) || self.listener.lock().unwrap().upgrade().is_some()
            }
            _ => false,
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Initiate close. Idempotent: calls after the first are no-ops. The
    /// actual teardown runs on the owning worker; for listeners every
    /// child is stopped on its own worker. Closing releases the creation
    /// reference once teardown completes.
    pub fn close(&self) {
        if self.closing.swap(true, AcqRel) {
            return;
        }
        if self.sock_type.is_listener() {
            self.listening.store(false, Release);
            match self.sock_type {
                NmSocketType::UdpListener | NmSocketType::TcpListener => {
                    let running = self.rchildren.load(Acquire);
                    self.stop_children_async();
                    if running == 0 {
                        self.closed.store(true, Release);
                        self.active.store(false, Release);
                        NmSocket::detach(self);
                    }
                    // otherwise the last stopping child releases us
                }
                _ => {
                    // Wrapped listeners delegate to the carrier listener.
                    if let Some(inner) = self.outer_sock() {
                        inner.close();
                    }
                    self.closed.store(true, Release);
                    self.active.store(false, Release);
                    NmSocket::detach(self);
                }
            }
            return;
        }
        let me = self.arc();
        let ev = match self.sock_type {
            NmSocketType::Udp => NetIEvent::UdpClose { sock: me },
            NmSocketType::Tcp => NetIEvent::TcpClose { sock: me },
            NmSocketType::TcpDns => NetIEvent::TcpDnsClose { sock: me },
            NmSocketType::Tls => NetIEvent::TlsClose { sock: me },
            _ => unreachable!(),
        };
        self.mgr.enqueue(self.tid, ev);
    }

    /// Post stop events for every child without waiting; completion is
    /// observed through `rchildren`.
    pub(crate) fn stop_children_async(&self) {
        let children = self.children.lock().unwrap().clone();
        for child in children {
            let ev = match child.sock_type {
                NmSocketType::Udp => NetIEvent::UdpStop { sock: child.clone() },
                _ => NetIEvent::TcpStop { sock: child.clone() },
            };
            self.mgr.enqueue(child.tid, ev);
        }
    }

    /// Stop listening: interlocks against other manager-wide operations,
    /// stops every child on its own worker, and blocks until the running
    /// children count reaches zero. Must not be called from a worker
    /// thread.
    pub fn stop_listening(&self) {
        assert!(self.sock_type.is_listener());
        assert!(
            crate::worker::current_tid().is_none(),
            "stop_listening may not run on a network worker"
        );
        self.mgr.acquire_interlocked_force();
        let target = match self.sock_type {
            NmSocketType::TcpDnsListener | NmSocketType::TlsListener => {
                self.outer_sock().unwrap_or_else(|| self.arc())
            }
            _ => self.arc(),
        };
        self.close();
        {
            let mut sync = target.listen_sync.lock().unwrap();
            while target.rchildren.load(Acquire) > 0 {
                sync = target.cond.wait(sync).unwrap();
            }
            drop(sync);
        }
        self.mgr.drop_interlocked();
    }
}

/// Inline teardown for a child whose bind failed: report the error to the
/// waiting listener and release the creation reference.
pub(crate) fn listen_child_failed(child: &Arc<NmSocket>, err: NmError) {
    child.closing.store(true, Release);
    child.closed.store(true, Release);
    child.active.store(false, Release);
    listen_child_result(child, Err(err));
    NmSocket::detach(child);
}

/// Report one child's listen outcome back to its parent listener.
pub(crate) fn listen_child_result(child: &Arc<NmSocket>, res: NmResult<()>) {
    let Some(parent) = child.parent.lock().unwrap().upgrade() else {
        return;
    };
    match res {
        Ok(()) => {
            child.listening.store(true, Release);
            parent.rchildren.fetch_add(1, AcqRel);
        }
        Err(_) => {
            child.listen_error.store(true, Release);
        }
    }
    let mut sync = parent.listen_sync.lock().unwrap();
    if sync.pending > 0 {
        sync.pending -= 1;
    }
    if let Err(e) = res {
        sync.err.get_or_insert(e);
    }
    parent.cond.notify_all();
}

/// Called on a child's worker once the child has fully stopped. The last
/// child to stop marks the parent listener closed and releases its
/// creation reference.
pub(crate) fn listen_child_stopped(child: &Arc<NmSocket>) {
    let Some(parent) = child.parent.lock().unwrap().upgrade() else {
        return;
    };
    if parent.rchildren.fetch_sub(1, AcqRel) == 1 {
        parent.closed.store(true, Release);
        parent.active.store(false, Release);
        {
            let _sync = parent.listen_sync.lock().unwrap();
            parent.cond.notify_all();
        }
        NmSocket::detach(&parent);
    }
}

/// Block until every child of `listener` has reported its bind result.
pub(crate) fn wait_listen_result(listener: &Arc<NmSocket>) -> NmResult<()> {
    let mut sync = listener.listen_sync.lock().unwrap();
    while sync.pending > 0 {
        sync = listener.cond.wait(sync).unwrap();
    }
    match sync.err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle() -> Arc<NmHandle> {
        NmHandle::alloc(0)
    }

    #[test]
    fn test_ah_table_insert_remove() {
        let mut t = ActiveHandles::new();
        let a = dummy_handle();
        let b = dummy_handle();
        let pa = t.insert(a.clone());
        a.ah_pos.store(pa, Release);
        let pb = t.insert(b.clone());
        b.ah_pos.store(pb, Release);
        assert_eq!(t.len(), 2);
        t.check_invariants();

        let got = t.remove(pa).unwrap();
        assert!(Arc::ptr_eq(&got, &a));
        assert_eq!(t.len(), 1);
        t.check_invariants();

        // Freed slot is reused.
        let c = dummy_handle();
        let pc = t.insert(c.clone());
        c.ah_pos.store(pc, Release);
        assert_eq!(pc, pa);
        t.check_invariants();
    }

    #[test]
    fn test_ah_table_out_of_order_removal() {
        let mut t = ActiveHandles::new();
        let hs: Vec<_> = (0..8).map(|_| dummy_handle()).collect();
        for h in &hs {
            let pos = t.insert(h.clone());
            h.ah_pos.store(pos, Release);
        }
        t.check_invariants();
        // Remove middle, first, last, then re-fill.
        for idx in [3usize, 0, 7, 5] {
            t.remove(hs[idx].ah_pos.load(Acquire)).unwrap();
            t.check_invariants();
        }
        assert_eq!(t.len(), 4);
        for _ in 0..4 {
            let h = dummy_handle();
            let pos = t.insert(h.clone());
            h.ah_pos.store(pos, Release);
            t.check_invariants();
        }
        assert_eq!(t.len(), 8);
    }

    #[test]
    fn test_ah_table_remove_twice_is_none() {
        let mut t = ActiveHandles::new();
        let a = dummy_handle();
        let pos = t.insert(a);
        assert!(t.remove(pos).is_some());
        assert!(t.remove(pos).is_none());
        t.check_invariants();
    }

    #[test]
    fn test_ah_table_grows() {
        let mut t = ActiveHandles::new();
        let hs: Vec<_> = (0..100).map(|_| dummy_handle()).collect();
        for h in &hs {
            let pos = t.insert(h.clone());
            h.ah_pos.store(pos, Release);
        }
        assert_eq!(t.len(), 100);
        t.check_invariants();
        for h in &hs {
            t.remove(h.ah_pos.load(Acquire)).unwrap();
        }
        assert_eq!(t.len(), 0);
        t.check_invariants();
    }
}
