//! TCP transport.
//!
//! Listeners fan out one child per worker; accepts run on the child's own
//! worker so the hot path never crosses threads. Accepted connections
//! attach a quota token for their lifetime and arm the initial read
//! timer; the timer switches to the idle (or keepalive) timeout after the
//! first successful read. Outgoing connects are non-blocking: completion
//! is detected on writability, bounded by the connect timer.

use std::io::{self, Read, Write};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

use mio::Interest;

use crate::errors::{io_err2result, NmError, NmResult};
use crate::event::NetIEvent;
use crate::handle::NmHandle;
use crate::req::{IoReq, ReqCb};
use crate::socket::{
    listen_child_failed, listen_child_result, listen_child_stopped, NmSocket, NmSocketType,
    SendCb, NO_TOKEN,
};
use crate::sockopt;
use crate::stats::StatId;
use crate::worker::{finish_close, SockIo, TimerKind, WorkerIo};

fn bind_tcp(sock: &Arc<NmSocket>, multi: bool) -> io::Result<mio::net::TcpListener> {
    let s = sockopt::tcp_socket(&sock.iface)?;
    sockopt::reuse(&s)?;
    if multi {
        sockopt::reuse_lb(&s)?;
    }
    let _ = sockopt::incoming_cpu(&s);
    s.bind(&sock.iface.into())?;
    s.listen(sock.backlog.load(Relaxed) as i32)?;
    let std_l: std::net::TcpListener = s.into();
    Ok(mio::net::TcpListener::from_std(std_l))
}

/// Bind one listener child on its worker and report back to the parent.
pub(crate) fn async_listen(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    let multi = sock.mgr.nworkers() > 1 && sockopt::reuseport_supported();
    let io = match bind_tcp(sock, multi) {
        Ok(io) => io,
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::BindFail);
            listen_child_failed(sock, io_err2result(&e));
            return;
        }
    };
    match w.register(sock, SockIo::TcpListener(io), Interest::READABLE) {
        Ok(_) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::Open);
            listen_child_result(sock, Ok(()));
        }
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::OpenFail);
            listen_child_failed(sock, io_err2result(&e));
        }
    }
}

/// Accept every pending connection on a listener child. Quota refusals
/// close the accepted stream and report `QuotaExceeded` to the accept
/// callback without ever creating a connection socket.
pub(crate) fn process_accept(w: &mut WorkerIo, tok: usize) {
    let child = match w.conns.get(&tok) {
        Some(e) => e.sock.clone(),
        None => return,
    };
    if child.is_closing() || child.mgr.closing.load(Acquire) {
        return;
    }
    let accept_cb = child.accept_cb.lock().unwrap().clone();
    let pquota = child.pquota.lock().unwrap().clone();
    let listener = child
        .parent
        .lock()
        .unwrap()
        .upgrade()
        .unwrap_or_else(|| child.clone());
    loop {
        let accepted = {
            let Some(entry) = w.conns.get_mut(&tok) else {
                return;
            };
            let SockIo::TcpListener(io) = &entry.io else {
                return;
            };
            io.accept()
        };
        match accepted {
            Ok((stream, peer)) => {
                child.mgr.stats.of(child.sock_type).inc(StatId::Accept);
                let guard = match &pquota {
                    Some(q) => match q.acquire() {
                        Some(g) => Some(g),
                        None => {
                            child.mgr.stats.of(child.sock_type).inc(StatId::AcceptFail);
                            if let Some(cb) = &accept_cb {
                                cb(None, Err(NmError::QuotaExceeded));
                            }
                            drop(stream);
                            continue;
                        }
                    },
                    None => None,
                };
                let conn = NmSocket::new(
                    &child.mgr,
                    NmSocketType::Tcp,
                    w.id,
                    child.iface,
                    child.extrahandlesize,
                );
                *conn.listener.lock().unwrap() = Arc::downgrade(&listener);
                *conn.quota.lock().unwrap() = guard;
                let local = stream.local_addr().unwrap_or(child.iface);
                *conn.peer.lock().unwrap() = Some(peer);
                *conn.local.lock().unwrap() = Some(local);
                conn.connected.store(true, Release);
                let (init, _, _, _) = conn.mgr.timeouts();
                conn.read_timeout.store(init, Relaxed);
                if w.register(&conn, SockIo::Tcp(stream), Interest::READABLE).is_err() {
                    conn.mgr.stats.of(child.sock_type).inc(StatId::AcceptFail);
                    conn.closing.store(true, Release);
                    finish_close(w, &conn);
                    continue;
                }
                w.arm_timer(&conn, TimerKind::Read, init);
                let h = conn.get_handle(peer, local);
                *conn.statichandle.lock().unwrap() = Arc::downgrade(&h);
                if let Some(cb) = &accept_cb {
                    cb(Some(&h), Ok(()));
                }
                NmHandle::detach(h);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                child.mgr.stats.of(child.sock_type).inc(StatId::AcceptFail);
                tracing::debug!("tcp accept error: {e}");
                break;
            }
        }
    }
}

/// Drain the stream into the worker's shared buffer, delivering each
/// chunk through the receive callback and re-arming the idle timer on
/// progress.
pub(crate) fn process_read(w: &mut WorkerIo, tok: usize) {
    let sock = match w.conns.get(&tok) {
        Some(e) => e.sock.clone(),
        None => return,
    };
    if sock.is_closing() || sock.is_closed() {
        return;
    }
    let cb = sock.recv_cb.lock().unwrap().clone();
    let paused = sock.readpaused.load(Acquire);
    let (Some(cb), false) = (cb, paused) else {
        if let Some(entry) = w.conns.get_mut(&tok) {
            entry.read_pending = true;
        }
        return;
    };
    let Some(h) = sock.statichandle.lock().unwrap().upgrade() else {
        return;
    };
    debug_assert!(!w.recvbuf_inuse);
    w.recvbuf_inuse = true;
    loop {
        let res = {
            let Some(entry) = w.conns.get_mut(&tok) else { break };
            let SockIo::Tcp(io) = &mut entry.io else { break };
            io.read(&mut w.recvbuf)
        };
        match res {
            Ok(0) => {
                sock.recv_cb.lock().unwrap().take();
                sock.timer_cancel();
                cb(&h, Err(NmError::ConnReset));
                sock.close();
                break;
            }
            Ok(n) => {
                sock.mgr.worker(w.id).pktcount.fetch_add(1, Relaxed);
                let (_, idle, keep, _) = sock.mgr.timeouts();
                let ms = if sock.keepalive.load(Acquire) { keep } else { idle };
                sock.read_timeout.store(ms, Relaxed);
                w.arm_timer(&sock, TimerKind::Read, ms);
                cb(&h, Ok(&w.recvbuf[..n]));
                if sock.is_closing()
                    || sock.readpaused.load(Acquire)
                    || sock.recv_cb.lock().unwrap().is_none()
                {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                sock.mgr.stats.of(sock.sock_type).inc(StatId::RecvFail);
                sock.recv_cb.lock().unwrap().take();
                sock.timer_cancel();
                cb(&h, Err(io_err2result(&e)));
                sock.close();
                break;
            }
        }
    }
    w.recvbuf_inuse = false;
}

enum WriteStep {
    Done,
    Progress,
    Block,
    Fail(io::Error),
}

fn flush_sendq(w: &mut WorkerIo, tok: usize, sock: &Arc<NmSocket>) {
    loop {
        let step = {
            let Some(entry) = w.conns.get_mut(&tok) else {
                return;
            };
            let Some(req) = entry.sendq.front_mut() else {
                break;
            };
            let SockIo::Tcp(io) = &mut entry.io else {
                return;
            };
            match io.write(&req.buf[req.written..]) {
                Ok(0) => WriteStep::Fail(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    req.written += n;
                    if req.written >= req.buf.len() {
                        WriteStep::Done
                    } else {
                        WriteStep::Progress
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteStep::Block,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => WriteStep::Progress,
                Err(e) => WriteStep::Fail(e),
            }
        };
        match step {
            WriteStep::Done => {
                let req = w
                    .conns
                    .get_mut(&tok)
                    .and_then(|e| e.sendq.pop_front())
                    .expect("completed request is queued");
                req.complete(sock, Ok(()));
            }
            WriteStep::Progress => continue,
            WriteStep::Block => {
                w.set_writable_interest(tok, true);
                return;
            }
            WriteStep::Fail(e) => {
                sock.mgr.stats.of(sock.sock_type).inc(StatId::SendFail);
                let req = w
                    .conns
                    .get_mut(&tok)
                    .and_then(|e| e.sendq.pop_front())
                    .expect("failed request is queued");
                req.complete(sock, Err(io_err2result(&e)));
                sock.close();
                return;
            }
        }
    }
    w.set_writable_interest(tok, false);
}

pub(crate) fn process_writable(w: &mut WorkerIo, tok: usize) {
    let sock = match w.conns.get(&tok) {
        Some(e) => e.sock.clone(),
        None => return,
    };
    if sock.connecting.load(Acquire) {
        finish_connect(w, tok, &sock);
    }
    if sock.connected.load(Acquire) {
        flush_sendq(w, tok, &sock);
    }
}

/// Queue a stream write; completions fire in submission order.
pub(crate) fn async_send(w: &mut WorkerIo, sock: &Arc<NmSocket>, req: Box<IoReq>) {
    if sock.is_closing() || sock.mgr.closing.load(Acquire) {
        req.complete(sock, Err(NmError::Cancelled));
        return;
    }
    if !sock.connected.load(Acquire) {
        req.complete(sock, Err(NmError::NotConnected));
        return;
    }
    let tok = sock.token.load(Acquire);
    if tok == NO_TOKEN {
        req.complete(sock, Err(NmError::NotConnected));
        return;
    }
    match w.conns.get_mut(&tok) {
        Some(entry) => entry.sendq.push_back(req),
        None => {
            req.complete(sock, Err(NmError::NotConnected));
            return;
        }
    }
    flush_sendq(w, tok, sock);
}

/// Start (or resume) reading: clears the pause flag, arms the read
/// timer, and drains anything the kernel already queued.
pub(crate) fn async_startread(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    sock.readpaused.store(false, Release);
    let tok = sock.token.load(Acquire);
    if tok == NO_TOKEN {
        return;
    }
    let ms = sock.read_timeout.load(Relaxed);
    if ms > 0 {
        w.arm_timer(sock, TimerKind::Read, ms);
    }
    process_read(w, tok);
}

/// Stop pulling from the stream; the callback stays registered.
pub(crate) fn async_pauseread(_w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    sock.readpaused.store(true, Release);
}

pub(crate) fn async_cancel(_w: &mut WorkerIo, sock: &Arc<NmSocket>, handle: Arc<NmHandle>) {
    sock.timer_cancel();
    let cb = sock.recv_cb.lock().unwrap().take();
    if let Some(cb) = cb {
        cb(&handle, Err(NmError::Cancelled));
    }
    NmHandle::detach(handle);
}

/// Stop one listener child on its worker.
pub(crate) fn async_stop(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    if sock.is_closed() {
        return;
    }
    sock.closing.store(true, Release);
    finish_close(w, sock);
    listen_child_stopped(sock);
}

/// Begin a non-blocking connect; completion is observed on writability
/// or cut short by the connect timer.
pub(crate) fn async_connect(w: &mut WorkerIo, sock: &Arc<NmSocket>, mut req: Box<IoReq>) {
    if sock.mgr.closing.load(Acquire) {
        req.complete(sock, Err(NmError::Cancelled));
        return;
    }
    let peer = match req.peer {
        Some(p) => p,
        None => {
            req.complete(sock, Err(NmError::Unexpected));
            return;
        }
    };
    let pre = (|| -> io::Result<mio::net::TcpStream> {
        let s = sockopt::tcp_socket(&peer)?;
        s.bind(&sock.iface.into())?;
        match s.connect(&peer.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        let std_s: std::net::TcpStream = s.into();
        Ok(mio::net::TcpStream::from_std(std_s))
    })();
    let io = match pre {
        Ok(io) => io,
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::ConnectFail);
            sock.connect_error.store(true, Release);
            req.complete(sock, Err(io_err2result(&e)));
            sock.close();
            return;
        }
    };
    match w.register(sock, SockIo::Tcp(io), Interest::READABLE | Interest::WRITABLE) {
        Ok(tok) => {
            sock.connecting.store(true, Release);
            sock.mgr.stats.of(sock.sock_type).inc(StatId::Open);
            if let Some(entry) = w.conns.get_mut(&tok) {
                entry.pending_connect = Some(req);
            }
            let ms = sock.connect_timeout.load(Relaxed);
            w.arm_timer(sock, TimerKind::Connect, ms);
            // Loopback connects may be complete before the first poll.
            finish_connect(w, tok, sock);
        }
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::OpenFail);
            sock.connect_error.store(true, Release);
            req.complete(sock, Err(io_err2result(&e)));
            sock.close();
        }
    }
}

fn finish_connect(w: &mut WorkerIo, tok: usize, sock: &Arc<NmSocket>) {
    if !sock.connecting.load(Acquire) {
        return;
    }
    let status = {
        let Some(entry) = w.conns.get_mut(&tok) else {
            return;
        };
        let SockIo::Tcp(io) = &mut entry.io else {
            return;
        };
        match io.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match io.peer_addr() {
                Ok(p) => Ok(Some((p, io.local_addr().ok()))),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(None),
                Err(e) => Err(e),
            },
        }
    };
    match status {
        Ok(None) => {} // still in flight; wait for the next writable edge
        Ok(Some((peer, local))) => {
            sock.connecting.store(false, Release);
            sock.connected.store(true, Release);
            sock.timer_cancel();
            *sock.peer.lock().unwrap() = Some(peer);
            if let Some(l) = local {
                *sock.local.lock().unwrap() = Some(l);
            }
            sock.mgr.stats.of(sock.sock_type).inc(StatId::Connect);
            let (init, _, _, _) = sock.mgr.timeouts();
            sock.read_timeout.store(init, Relaxed);
            let Some(mut req) = w
                .conns
                .get_mut(&tok)
                .and_then(|e| e.pending_connect.take())
            else {
                return;
            };
            let h = sock.get_handle(peer, sock.local_addr());
            *sock.statichandle.lock().unwrap() = Arc::downgrade(&h);
            req.handle = Some(h);
            req.complete(sock, Ok(()));
        }
        Err(e) => {
            sock.connecting.store(false, Release);
            sock.connect_error.store(true, Release);
            sock.timer_cancel();
            sock.mgr.stats.of(sock.sock_type).inc(StatId::ConnectFail);
            if let Some(req) = w
                .conns
                .get_mut(&tok)
                .and_then(|e| e.pending_connect.take())
            {
                req.complete(sock, Err(io_err2result(&e)));
            }
            sock.close();
        }
    }
}

/// Connect-timer expiry: fail the pending connect with `Timeout`.
pub(crate) fn connect_timeout(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    if !sock.connecting.load(Acquire) {
        return;
    }
    sock.connecting.store(false, Release);
    sock.connect_error.store(true, Release);
    sock.mgr.stats.of(sock.sock_type).inc(StatId::ConnectFail);
    let tok = sock.token.load(Acquire);
    if tok != NO_TOKEN {
        if let Some(req) = w
            .conns
            .get_mut(&tok)
            .and_then(|e| e.pending_connect.take())
        {
            req.complete(sock, Err(NmError::Timeout));
        }
    }
    sock.close();
}

/// Build and route a stream send request.
pub(crate) fn send(
    sock: &Arc<NmSocket>,
    handle: &NmHandle,
    region: &[u8],
    cb: SendCb,
) -> NmResult<()> {
    let mut req = IoReq::get(sock);
    req.buf.extend_from_slice(region);
    req.cb = ReqCb::Send(cb);
    req.handle = Some(handle.attach());
    sock.mgr.enqueue(
        sock.tid,
        NetIEvent::TcpSend {
            sock: sock.clone(),
            req,
        },
    );
    Ok(())
}
