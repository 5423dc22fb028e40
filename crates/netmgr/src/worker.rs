//! Network workers.
//!
//! One worker per thread, each driving a single-threaded mio poll loop.
//! Cross-thread requests arrive as [`NetIEvent`]s on two channels (normal
//! and priority) paired with a `mio::Waker`; the loop drains the priority
//! queue fully, then the normal queue unless paused, polls with a timeout
//! derived from the earliest pending timer, dispatches readiness, and runs
//! expired timers. While paused, a worker parks on a blocking receive of
//! the priority queue, so listen setup and resume still execute.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::errors::NmError;
use crate::event::NetIEvent;
use crate::handle::NmHandle;
use crate::manager::NetMgr;
use crate::req::IoReq;
use crate::socket::{listen_child_stopped, NmSocket, NmSocketType, NO_TOKEN};
use crate::stats::StatId;
use crate::{tcp, tcpdns, tls, udp};

pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Shared receive buffer size per worker: sized for a full recvmmsg batch
/// on Unix, a single datagram elsewhere.
#[cfg(not(windows))]
pub(crate) const RECVBUF_SIZE: usize = 20 * 65536;
#[cfg(windows)]
pub(crate) const RECVBUF_SIZE: usize = 65536;

thread_local! {
    static CURRENT_TID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The worker id of the current thread, if it is a network worker.
pub(crate) fn current_tid() -> Option<usize> {
    CURRENT_TID.with(|c| c.get())
}

// ---------------------------------------------------------------------------
// Cross-thread face of a worker
// ---------------------------------------------------------------------------

pub(crate) struct Networker {
    pub id: usize,
    waker: Arc<Waker>,
    tx: Sender<NetIEvent>,
    tx_prio: Sender<NetIEvent>,
    pub paused: AtomicBool,
    pub finished: AtomicBool,
    pub pktcount: AtomicU64,
}

impl Networker {
    pub fn new(
        id: usize,
        waker: Arc<Waker>,
        tx: Sender<NetIEvent>,
        tx_prio: Sender<NetIEvent>,
    ) -> Networker {
        Networker {
            id,
            waker,
            tx,
            tx_prio,
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            pktcount: AtomicU64::new(0),
        }
    }

    /// Enqueue an event for this worker and wake its loop. Returns the
    /// event back if the worker can no longer accept work.
    pub fn enqueue(&self, ev: NetIEvent) -> Result<(), NetIEvent> {
        if self.finished.load(Acquire) {
            return Err(ev);
        }
        let q = if ev.is_priority() {
            &self.tx_prio
        } else {
            &self.tx
        };
        match q.send(ev) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(e) => Err(e.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Read,
    Connect,
}

pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub gen: u64,
    pub kind: TimerKind,
    pub sock: Arc<NmSocket>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.gen == other.gen
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.gen.cmp(&other.gen))
    }
}

// ---------------------------------------------------------------------------
// Worker-owned connection registry
// ---------------------------------------------------------------------------

pub(crate) enum SockIo {
    Udp(mio::net::UdpSocket),
    TcpListener(mio::net::TcpListener),
    Tcp(mio::net::TcpStream),
}

impl SockIo {
    fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        match self {
            SockIo::Udp(s) => s,
            SockIo::TcpListener(s) => s,
            SockIo::Tcp(s) => s,
        }
    }
}

pub(crate) struct ConnEntry {
    pub sock: Arc<NmSocket>,
    pub io: SockIo,
    pub sendq: VecDeque<Box<IoReq>>,
    pub pending_connect: Option<Box<IoReq>>,
    /// Readiness arrived while reads were off; drain on start/resume.
    pub read_pending: bool,
    pub wants_writable: bool,
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

pub(crate) struct WorkerIo {
    pub id: usize,
    pub mgr: Arc<NetMgr>,
    pub poll: Poll,
    pub conns: HashMap<usize, ConnEntry>,
    next_token: usize,
    pub timers: BinaryHeap<Reverse<TimerEntry>>,
    pub recvbuf: Box<[u8]>,
    pub recvbuf_inuse: bool,
    pub paused: bool,
    pub finished: bool,
    rx: Receiver<NetIEvent>,
    rx_prio: Receiver<NetIEvent>,
}

pub(crate) fn run(
    mgr: Arc<NetMgr>,
    id: usize,
    poll: Poll,
    rx: Receiver<NetIEvent>,
    rx_prio: Receiver<NetIEvent>,
) {
    CURRENT_TID.with(|c| c.set(Some(id)));
    let mut w = WorkerIo {
        id,
        mgr: mgr.clone(),
        poll,
        conns: HashMap::new(),
        next_token: 1,
        timers: BinaryHeap::new(),
        recvbuf: vec![0u8; RECVBUF_SIZE].into_boxed_slice(),
        recvbuf_inuse: false,
        paused: false,
        finished: false,
        rx,
        rx_prio,
    };
    mgr.worker_started();
    tracing::debug!(worker = id, "network worker running");

    let mut events = Events::with_capacity(1024);
    loop {
        w.drain_queues();
        if w.finished {
            break;
        }
        if w.paused {
            w.pause_loop();
            continue;
        }
        let timeout = w.next_poll_timeout();
        match w.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(worker = id, "poll failed: {e}");
                break;
            }
        }
        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect();
        for (tok, readable, writable) in ready {
            if tok == WAKER_TOKEN {
                continue;
            }
            w.dispatch_io(tok.0, readable, writable);
        }
        w.run_timers();
    }

    // Nothing will execute these; fire their callbacks with Cancelled.
    while let Ok(ev) = w.rx_prio.try_recv() {
        ev.cancel();
    }
    while let Ok(ev) = w.rx.try_recv() {
        ev.cancel();
    }
    mgr.worker(id).finished.store(true, Release);
    tracing::debug!(worker = id, "network worker stopped");
    mgr.worker_stopped();
}

impl WorkerIo {
    fn drain_queues(&mut self) {
        loop {
            let mut did = false;
            while let Ok(ev) = self.rx_prio.try_recv() {
                did = true;
                self.handle_event(ev);
                if self.finished || self.paused {
                    return;
                }
            }
            if let Ok(ev) = self.rx.try_recv() {
                did = true;
                self.handle_event(ev);
                if self.finished || self.paused {
                    return;
                }
            }
            if !did {
                break;
            }
        }
    }

    /// Park on the priority queue until resumed; priority events (listen
    /// setup, detach, resume) keep executing.
    fn pause_loop(&mut self) {
        self.mgr.worker(self.id).paused.store(true, Release);
        self.mgr.worker_paused();
        while self.paused && !self.finished {
            match self.rx_prio.recv() {
                Ok(ev) => self.handle_event(ev),
                Err(_) => break,
            }
        }
        self.mgr.worker(self.id).paused.store(false, Release);
        self.mgr.worker_unpaused();
    }

    fn handle_event(&mut self, ev: NetIEvent) {
        match ev {
            NetIEvent::UdpListen { sock } => udp::async_listen(self, &sock),
            NetIEvent::UdpStop { sock } => udp::async_stop(self, &sock),
            NetIEvent::UdpSend { sock, req } => udp::async_send(self, &sock, req),
            NetIEvent::UdpRead { sock } => udp::async_read(self, &sock),
            NetIEvent::UdpCancel { sock, handle } => udp::async_cancel(self, &sock, handle),
            NetIEvent::UdpClose { sock } => finish_close(self, &sock),
            NetIEvent::UdpConnect { sock, req } => udp::async_connect(self, &sock, req),

            NetIEvent::TcpConnect { sock, req } => tcp::async_connect(self, &sock, req),
            NetIEvent::TcpListen { sock } => tcp::async_listen(self, &sock),
            NetIEvent::TcpStartRead { sock } => tcp::async_startread(self, &sock),
            NetIEvent::TcpPauseRead { sock } => tcp::async_pauseread(self, &sock),
            NetIEvent::TcpSend { sock, req } => tcp::async_send(self, &sock, req),
            NetIEvent::TcpStop { sock } => tcp::async_stop(self, &sock),
            NetIEvent::TcpCancel { sock, handle } => tcp::async_cancel(self, &sock, handle),
            NetIEvent::TcpClose { sock } => finish_close(self, &sock),

            NetIEvent::TcpDnsSend { sock, req } => tcpdns::async_send(self, &sock, req),
            NetIEvent::TcpDnsRead { sock } => tcpdns::async_read(self, &sock),
            NetIEvent::TcpDnsCancel { sock, handle } => tcpdns::async_cancel(self, &sock, handle),
            NetIEvent::TcpDnsClose { sock } => tcpdns::async_close(self, &sock),

            NetIEvent::TlsSend { sock, req } => tls::async_send(self, &sock, req),
            NetIEvent::TlsStartRead { sock } => tls::async_startread(self, &sock),
            NetIEvent::TlsDoIo { sock } => tls::async_doio(self, &sock),
            NetIEvent::TlsClose { sock } => tls::async_close(self, &sock),

            NetIEvent::CloseHandle { sock, handle } => sock.deactivate_handle(&handle),

            NetIEvent::Shutdown => self.shutdown(),
            NetIEvent::Pause => {
                self.paused = true;
            }
            NetIEvent::Resume => {
                self.paused = false;
            }
            NetIEvent::Detach { sock } => {
                if !sock.is_closed() {
                    sock.closing.store(true, Release);
                    match sock.sock_type {
                        NmSocketType::TcpDns => tcpdns::async_close(self, &sock),
                        NmSocketType::Tls => tls::async_close(self, &sock),
                        _ => finish_close(self, &sock),
                    }
                } else {
                    sock.destroy_final();
                }
            }
        }
    }

    /// Orderly close of everything this worker still drives, then exit.
    fn shutdown(&mut self) {
        let socks: Vec<Arc<NmSocket>> = self.conns.values().map(|e| e.sock.clone()).collect();
        // Wrappers first, so their user callbacks see Cancelled before the
        // carrier sockets disappear.
        for sock in &socks {
            if let Some(wr) = sock.wrapper_sock() {
                if !wr.closing.swap(true, AcqRel) {
                    match wr.sock_type {
                        NmSocketType::TcpDns => tcpdns::async_close(self, &wr),
                        NmSocketType::Tls => tls::async_close(self, &wr),
                        _ => {}
                    }
                }
            }
        }
        let tokens: Vec<usize> = self.conns.keys().copied().collect();
        for tok in tokens {
            let Some(entry) = self.conns.get(&tok) else {
                continue;
            };
            let sock = entry.sock.clone();
            let was_child = sock.parent.lock().unwrap().upgrade().is_some();
            sock.closing.store(true, Release);
            finish_close(self, &sock);
            if was_child {
                listen_child_stopped(&sock);
            }
        }
        self.finished = true;
    }

    fn dispatch_io(&mut self, tok: usize, readable: bool, writable: bool) {
        let kind = match self.conns.get(&tok) {
            Some(e) => match e.io {
                SockIo::Udp(_) => 0,
                SockIo::TcpListener(_) => 1,
                SockIo::Tcp(_) => 2,
            },
            None => return,
        };
        match kind {
            0 => {
                if writable {
                    udp::process_writable(self, tok);
                }
                if readable {
                    udp::process_read(self, tok);
                }
            }
            1 => {
                if readable {
                    tcp::process_accept(self, tok);
                }
            }
            _ => {
                if writable {
                    tcp::process_writable(self, tok);
                }
                if readable {
                    tcp::process_read(self, tok);
                }
            }
        }
    }

    // -- registry ----------------------------------------------------------

    pub(crate) fn register(
        &mut self,
        sock: &Arc<NmSocket>,
        mut io: SockIo,
        interest: Interest,
    ) -> io::Result<usize> {
        let tok = self.next_token;
        self.next_token += 1;
        self.poll
            .registry()
            .register(io.source_mut(), Token(tok), interest)?;
        sock.token.store(tok, Release);
        self.conns.insert(
            tok,
            ConnEntry {
                sock: sock.clone(),
                io,
                sendq: VecDeque::new(),
                pending_connect: None,
                read_pending: false,
                wants_writable: false,
            },
        );
        Ok(tok)
    }

    /// Add or drop WRITABLE interest for a registered stream.
    pub(crate) fn set_writable_interest(&mut self, tok: usize, on: bool) {
        let Some(entry) = self.conns.get_mut(&tok) else {
            return;
        };
        if entry.wants_writable == on {
            return;
        }
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let registry = self.poll.registry();
        if registry
            .reregister(entry.io.source_mut(), Token(tok), interest)
            .is_ok()
        {
            entry.wants_writable = on;
        }
    }

    // -- timers ------------------------------------------------------------

    /// (Re-)arm the socket's timer; any previously scheduled entry is
    /// invalidated by the generation bump. `ms == 0` just cancels.
    pub(crate) fn arm_timer(&mut self, sock: &Arc<NmSocket>, kind: TimerKind, ms: u64) {
        let gen = sock.timer_gen.fetch_add(1, AcqRel) + 1;
        if ms == 0 {
            return;
        }
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + Duration::from_millis(ms),
            gen,
            kind,
            sock: sock.clone(),
        }));
    }

    fn next_poll_timeout(&self) -> Option<Duration> {
        self.timers
            .peek()
            .map(|Reverse(e)| e.deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn run_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.timers.pop().expect("peeked entry pops");
            if entry.sock.timer_gen.load(Acquire) != entry.gen {
                continue; // cancelled or re-armed
            }
            match entry.kind {
                TimerKind::Connect => tcp::connect_timeout(self, &entry.sock),
                TimerKind::Read => read_timeout(self, &entry.sock),
            }
        }
    }
}

/// Read-timer expiry: synthesise a timeout on the outstanding read, then
/// close. Wrappers see the error through the internal receive callback
/// they install on the carrier socket.
fn read_timeout(_w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    if sock.is_closing() || sock.is_closed() {
        return;
    }
    // Take the callback so the close path cannot fire it again.
    let cb = sock.recv_cb.lock().unwrap().take();
    let handle = sock.statichandle.lock().unwrap().upgrade();
    if let (Some(cb), Some(h)) = (cb, handle) {
        cb(&h, Err(NmError::Timeout));
    }
    sock.close();
}

/// Common teardown for a connection socket on its owning worker: cancel
/// the timer, drop the registered I/O (failing queued requests with
/// `Cancelled`), fire the outstanding read callback with `Cancelled`,
/// release the quota token, drain every live handle, and unhook the
/// carrier socket.
pub(crate) fn finish_close(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    if sock.closed.swap(true, AcqRel) {
        return;
    }
    sock.timer_cancel();
    let tok = sock.token.swap(NO_TOKEN, AcqRel);
    if tok != NO_TOKEN {
        if let Some(mut entry) = w.conns.remove(&tok) {
            let _ = w.poll.registry().deregister(entry.io.source_mut());
            while let Some(req) = entry.sendq.pop_front() {
                req.complete(sock, Err(NmError::Cancelled));
            }
            if let Some(req) = entry.pending_connect.take() {
                req.complete(sock, Err(NmError::Cancelled));
            }
        }
    }
    let rcb = sock.recv_cb.lock().unwrap().take();
    if let Some(cb) = rcb {
        if let Some(h) = sock.statichandle.lock().unwrap().upgrade() {
            cb(&h, Err(NmError::Cancelled));
        }
    }
    *sock.quota.lock().unwrap() = None;
    let handles: Vec<Arc<NmHandle>> = sock.ah.lock().unwrap().live().cloned().collect();
    for h in handles {
        sock.deactivate_handle(&h);
    }
    if let Some(oh) = sock.outerhandle.lock().unwrap().take() {
        NmHandle::detach(oh);
    }
    *sock.outer.lock().unwrap() = None;
    // Break the wrapper self-loop last; the caller's Arc keeps the socket
    // alive for the remainder of this call.
    *sock.selfref.lock().unwrap() = None;
    sock.active.store(false, Release);
    sock.connected.store(false, Release);
    sock.connecting.store(false, Release);
    sock.listening.store(false, Release);
    sock.mgr.stats.of(sock.sock_type).inc(StatId::Close);
    // Release the creation reference; the socket is destroyed once every
    // handle and caller reference is gone too.
    NmSocket::detach(sock);
}
