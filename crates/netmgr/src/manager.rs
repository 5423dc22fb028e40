//! The network manager.
//!
//! Owns the worker pool, the global request pool, the interlock used by
//! manager-wide quiescence operations (pause, stop-listening, shutdown),
//! TCP timeout configuration, and the live-socket trace registry. All
//! listen and connect entry points live here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::unbounded;
use dashmap::DashMap;
use mio::{Poll, Waker};

use crate::errors::{io_err2result, NmError, NmResult};
use crate::event::NetIEvent;
use crate::quota::Quota;
use crate::req::{IoReq, ReqCb};
use crate::socket::{
    wait_listen_result, AcceptCb, ConnectCb, NmSocket, NmSocketType, RecvCb,
};
use crate::stats::{Stats, StatsSnapshot};
use crate::worker::{current_tid, Networker, WAKER_TOKEN};
use crate::{sockopt, tcpdns, tls};

/// Default TCP timeouts, milliseconds (30 s apiece, configured in tenths
/// of seconds at the interface).
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Default cap on concurrent unanswered queries per framed DNS
/// connection.
const DEFAULT_MAX_PIPELINED: usize = 100;

struct MgrState {
    workers_running: u32,
    workers_paused: u32,
}

#[derive(Debug, Clone)]
pub struct SockTrace {
    pub type_name: &'static str,
    pub iface: SocketAddr,
    pub tid: usize,
}

pub struct NetMgr {
    me: Weak<NetMgr>,
    nworkers: usize,
    workers: Vec<Networker>,
    state: Mutex<MgrState>,
    wkstatecond: Condvar,
    /// Active connections are being closed and new ones are refused.
    pub(crate) closing: AtomicBool,
    /// One thread is orchestrating a manager-wide quiescence operation;
    /// contenders wait on `wkstatecond`.
    interlocked: AtomicBool,
    maxudp: AtomicU32,
    timeout_init: AtomicU64,
    timeout_idle: AtomicU64,
    timeout_keepalive: AtomicU64,
    timeout_advertised: AtomicU64,
    max_pipelined: AtomicUsize,
    pub(crate) stats: Stats,
    pub(crate) req_pool: Mutex<Vec<Box<IoReq>>>,
    next_tid: AtomicUsize,
    uid_counter: AtomicU64,
    active_trace: DashMap<u64, SockTrace>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NetMgr {
    /// Create a manager with `nworkers` event-loop threads. Returns once
    /// every worker is running.
    pub fn new(nworkers: usize) -> NmResult<Arc<NetMgr>> {
        assert!(nworkers >= 1);
        let mut workers = Vec::with_capacity(nworkers);
        let mut seeds = Vec::with_capacity(nworkers);
        for id in 0..nworkers {
            let poll = Poll::new().map_err(|e| io_err2result(&e))?;
            let waker = Arc::new(
                Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| io_err2result(&e))?,
            );
            let (tx, rx) = unbounded();
            let (tx_prio, rx_prio) = unbounded();
            workers.push(Networker::new(id, waker, tx, tx_prio));
            seeds.push((poll, rx, rx_prio));
        }
        let mgr = Arc::new_cyclic(|me| NetMgr {
            me: me.clone(),
            nworkers,
            workers,
            state: Mutex::new(MgrState {
                workers_running: 0,
                workers_paused: 0,
            }),
            wkstatecond: Condvar::new(),
            closing: AtomicBool::new(false),
            interlocked: AtomicBool::new(false),
            maxudp: AtomicU32::new(u32::MAX),
            timeout_init: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            timeout_idle: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            timeout_keepalive: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            timeout_advertised: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            max_pipelined: AtomicUsize::new(DEFAULT_MAX_PIPELINED),
            stats: Stats::default(),
            req_pool: Mutex::new(Vec::new()),
            next_tid: AtomicUsize::new(0),
            uid_counter: AtomicU64::new(1),
            active_trace: DashMap::new(),
            join_handles: Mutex::new(Vec::new()),
        });
        for (id, (poll, rx, rx_prio)) in seeds.into_iter().enumerate() {
            let m = mgr.clone();
            let jh = std::thread::Builder::new()
                .name(format!("netmgr-{id}"))
                .spawn(move || crate::worker::run(m, id, poll, rx, rx_prio))
                .map_err(|_| NmError::Unexpected)?;
            mgr.join_handles.lock().unwrap().push(jh);
        }
        {
            let mut st = mgr.state.lock().unwrap();
            while (st.workers_running as usize) < nworkers {
                st = mgr.wkstatecond.wait(st).unwrap();
            }
        }
        Ok(mgr)
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    fn arc(&self) -> Arc<NetMgr> {
        self.me.upgrade().expect("live manager upgrades")
    }

    pub(crate) fn worker(&self, id: usize) -> &Networker {
        &self.workers[id]
    }

    /// Route an event to a worker; if the worker is gone, the event's
    /// callbacks are completed with `Cancelled` instead of being lost.
    pub(crate) fn enqueue(&self, tid: usize, ev: NetIEvent) {
        if let Err(ev) = self.workers[tid].enqueue(ev) {
            ev.cancel();
        }
    }

    pub(crate) fn next_uid(&self) -> u64 {
        self.uid_counter.fetch_add(1, Relaxed)
    }

    fn next_tid(&self) -> usize {
        self.next_tid.fetch_add(1, Relaxed) % self.nworkers
    }

    // -- configuration -----------------------------------------------------

    /// Cap inbound UDP datagram size; larger datagrams are dropped and
    /// counted as receive failures.
    pub fn set_maxudp(&self, maxudp: u32) {
        self.maxudp.store(maxudp, Relaxed);
    }

    pub(crate) fn maxudp(&self) -> u32 {
        self.maxudp.load(Relaxed)
    }

    /// Configure TCP timeouts in tenths of seconds (the configuration
    /// unit); stored internally in milliseconds.
    pub fn set_timeouts(&self, init: u64, idle: u64, keepalive: u64, advertised: u64) {
        self.timeout_init.store(init * 100, Relaxed);
        self.timeout_idle.store(idle * 100, Relaxed);
        self.timeout_keepalive.store(keepalive * 100, Relaxed);
        self.timeout_advertised.store(advertised * 100, Relaxed);
    }

    /// Current (init, idle, keepalive, advertised) timeouts in
    /// milliseconds. The advertised value is what higher layers report in
    /// EDNS keepalive; it does not drive any timer here.
    pub fn timeouts(&self) -> (u64, u64, u64, u64) {
        (
            self.timeout_init.load(Relaxed),
            self.timeout_idle.load(Relaxed),
            self.timeout_keepalive.load(Relaxed),
            self.timeout_advertised.load(Relaxed),
        )
    }

    /// Cap concurrent unanswered queries per framed DNS connection;
    /// beyond it the connection stops reading until responses catch up.
    pub fn set_max_pipelined(&self, max: usize) {
        self.max_pipelined.store(max, Relaxed);
    }

    pub(crate) fn max_pipelined(&self) -> usize {
        self.max_pipelined.load(Relaxed)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Log every live socket. Useful for finding leaks at shutdown.
    pub fn dump_active(&self) {
        for entry in self.active_trace.iter() {
            let t = entry.value();
            tracing::info!(
                uid = *entry.key(),
                sock_type = t.type_name,
                iface = %t.iface,
                tid = t.tid,
                "live socket"
            );
        }
    }

    pub(crate) fn trace_insert(&self, sock: &Arc<NmSocket>) {
        self.active_trace.insert(
            sock.uid,
            SockTrace {
                type_name: sock.sock_type.name(),
                iface: sock.iface,
                tid: sock.tid,
            },
        );
    }

    pub(crate) fn trace_remove(&self, uid: u64) {
        self.active_trace.remove(&uid);
    }

    // -- worker state bookkeeping -----------------------------------------

    pub(crate) fn worker_started(&self) {
        let mut st = self.state.lock().unwrap();
        st.workers_running += 1;
        self.wkstatecond.notify_all();
    }

    pub(crate) fn worker_stopped(&self) {
        let mut st = self.state.lock().unwrap();
        st.workers_running -= 1;
        self.wkstatecond.notify_all();
    }

    pub(crate) fn worker_paused(&self) {
        let mut st = self.state.lock().unwrap();
        st.workers_paused += 1;
        debug_assert!(st.workers_paused <= st.workers_running);
        self.wkstatecond.notify_all();
    }

    pub(crate) fn worker_unpaused(&self) {
        let mut st = self.state.lock().unwrap();
        st.workers_paused -= 1;
        self.wkstatecond.notify_all();
    }

    // -- interlock ---------------------------------------------------------

    /// Wait until this thread holds the pause-initiator role.
    pub(crate) fn acquire_interlocked_force(&self) {
        let mut st = self.state.lock().unwrap();
        while self.interlocked.swap(true, AcqRel) {
            st = self.wkstatecond.wait(st).unwrap();
        }
        drop(st);
    }

    pub(crate) fn drop_interlocked(&self) {
        let _st = self.state.lock().unwrap();
        self.interlocked.store(false, Release);
        self.wkstatecond.notify_all();
    }

    // -- pause / resume / shutdown ----------------------------------------

    /// Quiesce every worker: only priority events run until `resume`.
    /// Returns once all running workers report paused. Holds the
    /// interlock until `resume`.
    pub fn pause(&self) {
        assert!(
            current_tid().is_none(),
            "pause may not run on a network worker"
        );
        self.acquire_interlocked_force();
        for w in &self.workers {
            let _ = w.enqueue(NetIEvent::Pause);
        }
        let mut st = self.state.lock().unwrap();
        while st.workers_paused < st.workers_running {
            st = self.wkstatecond.wait(st).unwrap();
        }
    }

    /// Undo `pause`; returns once every worker is running again and
    /// releases the interlock.
    pub fn resume(&self) {
        assert!(
            current_tid().is_none(),
            "resume may not run on a network worker"
        );
        for w in &self.workers {
            let _ = w.enqueue(NetIEvent::Resume);
        }
        {
            let mut st = self.state.lock().unwrap();
            while st.workers_paused > 0 {
                st = self.wkstatecond.wait(st).unwrap();
            }
        }
        self.drop_interlocked();
    }

    /// Begin orderly shutdown: refuse new connections, and have every
    /// worker close its live sockets, delivering `Cancelled` to the
    /// outstanding callbacks.
    pub fn shutdown(&self) {
        if self.closing.swap(true, AcqRel) {
            return;
        }
        for w in &self.workers {
            let _ = w.enqueue(NetIEvent::Shutdown);
        }
    }

    /// Complete shutdown and join every worker thread.
    pub fn destroy(&self) {
        assert!(
            current_tid().is_none(),
            "destroy may not run on a network worker"
        );
        self.shutdown();
        {
            let mut st = self.state.lock().unwrap();
            while st.workers_running > 0 {
                st = self.wkstatecond.wait(st).unwrap();
            }
        }
        for jh in self.join_handles.lock().unwrap().drain(..) {
            let _ = jh.join();
        }
    }

    // -- listen ------------------------------------------------------------

    /// Bind a UDP listener: one child socket per worker sharing the port
    /// (kernel load balancing where supported). `recv_cb` is invoked per
    /// datagram with a transient handle carrying the peer address.
    pub fn listen_udp(
        &self,
        iface: SocketAddr,
        recv_cb: RecvCb,
        extrahandlesize: usize,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        let (iface, _probe) = probe_bind(iface, false)?;
        let lsock = NmSocket::new(&self.arc(), NmSocketType::UdpListener, 0, iface, extrahandlesize);
        *lsock.recv_cb.lock().unwrap() = Some(recv_cb.clone());
        let nchildren = if sockopt::reuseport_supported() {
            self.nworkers
        } else {
            1
        };
        lsock.listen_sync.lock().unwrap().pending = nchildren;
        for tid in 0..nchildren {
            let child = NmSocket::new(&self.arc(), NmSocketType::Udp, tid, iface, extrahandlesize);
            *child.parent.lock().unwrap() = Arc::downgrade(&lsock);
            *child.recv_cb.lock().unwrap() = Some(recv_cb.clone());
            lsock.children.lock().unwrap().push(child.clone());
            self.enqueue(tid, NetIEvent::UdpListen { sock: child });
        }
        match wait_listen_result(&lsock) {
            Ok(()) => {
                lsock.listening.store(true, Release);
                *lsock.local.lock().unwrap() = Some(iface);
                Ok(lsock)
            }
            Err(e) => {
                lsock.close();
                Err(e)
            }
        }
    }

    /// Bind a TCP listener; `accept_cb` runs per accepted connection with
    /// a handle for it, or with `QuotaExceeded` when `quota` refuses one.
    pub fn listen_tcp(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        extrahandlesize: usize,
        backlog: u32,
        quota: Option<Arc<Quota>>,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        let (iface, _probe) = probe_bind(iface, true)?;
        let lsock = NmSocket::new(&self.arc(), NmSocketType::TcpListener, 0, iface, extrahandlesize);
        *lsock.accept_cb.lock().unwrap() = Some(accept_cb.clone());
        *lsock.pquota.lock().unwrap() = quota.clone();
        let nchildren = if sockopt::reuseport_supported() {
            self.nworkers
        } else {
            1
        };
        lsock.listen_sync.lock().unwrap().pending = nchildren;
        for tid in 0..nchildren {
            let child = NmSocket::new(&self.arc(), NmSocketType::Tcp, tid, iface, extrahandlesize);
            *child.parent.lock().unwrap() = Arc::downgrade(&lsock);
            *child.accept_cb.lock().unwrap() = Some(accept_cb.clone());
            *child.pquota.lock().unwrap() = quota.clone();
            child.backlog.store(backlog.max(1), Relaxed);
            lsock.children.lock().unwrap().push(child.clone());
            self.enqueue(tid, NetIEvent::TcpListen { sock: child });
        }
        match wait_listen_result(&lsock) {
            Ok(()) => {
                lsock.listening.store(true, Release);
                *lsock.local.lock().unwrap() = Some(iface);
                Ok(lsock)
            }
            Err(e) => {
                lsock.close();
                Err(e)
            }
        }
    }

    /// Bind a DNS-framed TCP listener. Each complete length-prefixed
    /// message is delivered to `recv_cb` with a per-query handle;
    /// `accept_cb` runs once per connection.
    pub fn listen_tcpdns(
        &self,
        iface: SocketAddr,
        recv_cb: RecvCb,
        accept_cb: AcceptCb,
        extrahandlesize: usize,
        backlog: u32,
        quota: Option<Arc<Quota>>,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        let dns_l = NmSocket::new(&self.arc(), NmSocketType::TcpDnsListener, 0, iface, extrahandlesize);
        *dns_l.recv_cb.lock().unwrap() = Some(recv_cb);
        *dns_l.accept_cb.lock().unwrap() = Some(accept_cb);
        let wl = Arc::downgrade(&dns_l);
        let inner: AcceptCb = Arc::new(move |h, res| {
            if let Some(l) = wl.upgrade() {
                tcpdns::accept_wrap(&l, h, res);
            }
        });
        let tcp_l = match self.listen_tcp(iface, inner, 0, backlog, quota) {
            Ok(l) => l,
            Err(e) => {
                dns_l.close();
                return Err(e);
            }
        };
        *dns_l.outer.lock().unwrap() = Some(tcp_l.clone());
        *dns_l.local.lock().unwrap() = Some(tcp_l.local_addr());
        *tcp_l.wrapper.lock().unwrap() = Arc::downgrade(&dns_l);
        dns_l.listening.store(true, Release);
        Ok(dns_l)
    }

    /// Bind a TLS listener; `accept_cb` runs once per connection after
    /// the handshake completes.
    pub fn listen_tls(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        extrahandlesize: usize,
        backlog: u32,
        quota: Option<Arc<Quota>>,
        server_config: Arc<rustls::ServerConfig>,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        tls::tls_initialize();
        let tls_l = NmSocket::new(&self.arc(), NmSocketType::TlsListener, 0, iface, extrahandlesize);
        *tls_l.accept_cb.lock().unwrap() = Some(accept_cb);
        *tls_l.tls_listen_cfg.lock().unwrap() = Some(server_config);
        let wl = Arc::downgrade(&tls_l);
        let inner: AcceptCb = Arc::new(move |h, res| {
            if let Some(l) = wl.upgrade() {
                tls::accept_wrap(&l, h, res);
            }
        });
        let tcp_l = match self.listen_tcp(iface, inner, 0, backlog, quota) {
            Ok(l) => l,
            Err(e) => {
                tls_l.close();
                return Err(e);
            }
        };
        *tls_l.outer.lock().unwrap() = Some(tcp_l.clone());
        *tls_l.local.lock().unwrap() = Some(tcp_l.local_addr());
        *tcp_l.wrapper.lock().unwrap() = Arc::downgrade(&tls_l);
        tls_l.listening.store(true, Release);
        Ok(tls_l)
    }

    // -- connect -----------------------------------------------------------

    /// Associate a UDP socket with `peer`; the connect callback receives
    /// the handle for sending and reading.
    pub fn udp_connect(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        timeout_ms: u64,
        extrahandlesize: usize,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        let tid = self.next_tid();
        let iface = local.unwrap_or_else(|| unspec_for(&peer));
        let sock = NmSocket::new(&self.arc(), NmSocketType::Udp, tid, iface, extrahandlesize);
        sock.client.store(true, Release);
        sock.connect_timeout.store(timeout_ms, Relaxed);
        *sock.peer.lock().unwrap() = Some(peer);
        let mut req = IoReq::get(&sock);
        req.cb = ReqCb::Connect(cb);
        req.peer = Some(peer);
        self.enqueue(tid, NetIEvent::UdpConnect { sock: sock.clone(), req });
        Ok(sock)
    }

    /// Open a TCP connection to `peer`. The connect callback fires once:
    /// with a handle on success, or `Timeout`/the translated error.
    pub fn tcp_connect(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        timeout_ms: u64,
        extrahandlesize: usize,
    ) -> NmResult<Arc<NmSocket>> {
        self.tcp_connect_inner(local, peer, cb, timeout_ms, extrahandlesize, None)
    }

    pub(crate) fn tcp_connect_inner(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        timeout_ms: u64,
        extrahandlesize: usize,
        tid: Option<usize>,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        let tid = tid.unwrap_or_else(|| self.next_tid());
        let iface = local.unwrap_or_else(|| unspec_for(&peer));
        let sock = NmSocket::new(&self.arc(), NmSocketType::Tcp, tid, iface, extrahandlesize);
        sock.client.store(true, Release);
        sock.connect_timeout.store(timeout_ms, Relaxed);
        *sock.peer.lock().unwrap() = Some(peer);
        let mut req = IoReq::get(&sock);
        req.cb = ReqCb::Connect(cb);
        req.peer = Some(peer);
        self.enqueue(tid, NetIEvent::TcpConnect { sock: sock.clone(), req });
        Ok(sock)
    }

    /// Open a TLS-over-TCP connection; the connect callback fires after
    /// the handshake completes (or fails).
    pub fn tls_connect(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        timeout_ms: u64,
        extrahandlesize: usize,
        client_config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> NmResult<Arc<NmSocket>> {
        if self.closing.load(Acquire) {
            return Err(NmError::Cancelled);
        }
        tls::tls_initialize();
        let tid = self.next_tid();
        let iface = local.unwrap_or_else(|| unspec_for(&peer));
        let tls_sock = NmSocket::new(&self.arc(), NmSocketType::Tls, tid, iface, extrahandlesize);
        tls_sock.client.store(true, Release);
        tls_sock.connect_timeout.store(timeout_ms, Relaxed);
        *tls_sock.peer.lock().unwrap() = Some(peer);
        tls::init_client(&tls_sock, client_config, server_name)?;
        *tls_sock.connect_cb.lock().unwrap() = Some(cb);
        // The session owns itself until it closes; the caller's Arc is
        // not required to keep the handshake alive.
        *tls_sock.selfref.lock().unwrap() = Some(tls_sock.clone());
        let wtls = Arc::downgrade(&tls_sock);
        let inner: ConnectCb = Box::new(move |h, res| {
            if let Some(tls_sock) = wtls.upgrade() {
                tls::outer_connect_done(&tls_sock, h, res);
            }
        });
        self.tcp_connect_inner(local, peer, inner, timeout_ms, 0, Some(tid))?;
        Ok(tls_sock)
    }
}

fn unspec_for(peer: &SocketAddr) -> SocketAddr {
    if peer.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

/// Resolve a wildcard port before fanning children out: bind a probe
/// socket, read back the assigned port, and hold the probe until every
/// child has bound the same port with load-balanced reuse.
fn probe_bind(iface: SocketAddr, stream: bool) -> NmResult<(SocketAddr, Option<socket2::Socket>)> {
    if iface.port() != 0 {
        return Ok((iface, None));
    }
    let sock = if stream {
        sockopt::tcp_socket(&iface)
    } else {
        sockopt::udp_socket(&iface)
    }
    .map_err(|e| io_err2result(&e))?;
    sockopt::reuse(&sock).map_err(|e| io_err2result(&e))?;
    if sockopt::reuseport_supported() {
        sockopt::reuse_lb(&sock).map_err(|e| io_err2result(&e))?;
    }
    sock.bind(&iface.into()).map_err(|e| io_err2result(&e))?;
    let bound = sock
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .ok_or(NmError::SocketFail)?;
    Ok((bound, Some(sock)))
}
