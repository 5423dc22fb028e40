//! UDP transport.
//!
//! Listeners bind one child socket per worker, sharing the port with
//! kernel load balancing where the platform supports it. Each datagram is
//! delivered through a transient handle carrying the peer address, so UDP
//! and the stream transports share one send/receive surface. Connected
//! (client) UDP sockets associate synchronously on their owning worker.

use std::io;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

use mio::Interest;

use crate::errors::{io_err2result, NmError};
use crate::event::NetIEvent;
use crate::handle::NmHandle;
use crate::req::{IoReq, ReqCb};
use crate::socket::{
    listen_child_failed, listen_child_result, listen_child_stopped, NmSocket, SendCb, NO_TOKEN,
};
use crate::sockopt;
use crate::stats::StatId;
use crate::worker::{finish_close, SockIo, WorkerIo};

fn bind_udp(sock: &Arc<NmSocket>, multi: bool) -> io::Result<mio::net::UdpSocket> {
    let s = sockopt::udp_socket(&sock.iface)?;
    sockopt::reuse(&s)?;
    if multi {
        sockopt::reuse_lb(&s)?;
    }
    let _ = sockopt::incoming_cpu(&s);
    let _ = sockopt::dontfrag(&s, &sock.iface);
    s.bind(&sock.iface.into())?;
    let std_sock: std::net::UdpSocket = s.into();
    Ok(mio::net::UdpSocket::from_std(std_sock))
}

/// Bind one listener child on its worker and report back to the parent.
pub(crate) fn async_listen(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    let multi = sock.mgr.nworkers() > 1 && sockopt::reuseport_supported();
    let io = match bind_udp(sock, multi) {
        Ok(io) => io,
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::BindFail);
            listen_child_failed(sock, io_err2result(&e));
            return;
        }
    };
    let local = io.local_addr().ok();
    match w.register(sock, SockIo::Udp(io), Interest::READABLE) {
        Ok(_) => {
            if let Some(local) = local {
                *sock.local.lock().unwrap() = Some(local);
            }
            sock.mgr.stats.of(sock.sock_type).inc(StatId::Open);
            listen_child_result(sock, Ok(()));
        }
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::OpenFail);
            listen_child_failed(sock, io_err2result(&e));
        }
    }
}

/// Drain inbound datagrams, invoking the receive callback once per
/// datagram with a borrowed view into the worker's shared buffer.
pub(crate) fn process_read(w: &mut WorkerIo, tok: usize) {
    let sock = match w.conns.get(&tok) {
        Some(e) => e.sock.clone(),
        None => return,
    };
    if sock.is_closing() || sock.is_closed() {
        return;
    }
    debug_assert!(!w.recvbuf_inuse);
    w.recvbuf_inuse = true;
    let maxudp = sock.mgr.maxudp() as usize;
    loop {
        if sock.is_closing() || sock.readpaused.load(Acquire) {
            break;
        }
        let res = {
            let Some(entry) = w.conns.get(&tok) else { break };
            let SockIo::Udp(io) = &entry.io else { break };
            io.recv_from(&mut w.recvbuf)
        };
        match res {
            Ok((n, peer)) => {
                sock.mgr.worker(w.id).pktcount.fetch_add(1, Relaxed);
                if n > maxudp {
                    sock.mgr.stats.of(sock.sock_type).inc(StatId::RecvFail);
                    continue;
                }
                let Some(cb) = sock.recv_cb.lock().unwrap().clone() else {
                    break;
                };
                match sock.statichandle.lock().unwrap().upgrade() {
                    Some(h) => cb(&h, Ok(&w.recvbuf[..n])),
                    None => {
                        let h = sock.get_handle(peer, sock.local_addr());
                        cb(&h, Ok(&w.recvbuf[..n]));
                        NmHandle::detach(h);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                sock.mgr.stats.of(sock.sock_type).inc(StatId::RecvFail);
                tracing::debug!("udp recv error: {e}");
                break;
            }
        }
    }
    w.recvbuf_inuse = false;
}

/// Flush queued datagrams once the socket reports writable again.
pub(crate) fn process_writable(w: &mut WorkerIo, tok: usize) {
    let sock = match w.conns.get(&tok) {
        Some(e) => e.sock.clone(),
        None => return,
    };
    loop {
        let attempt = {
            let Some(entry) = w.conns.get_mut(&tok) else {
                return;
            };
            let Some(req) = entry.sendq.front() else {
                break;
            };
            let SockIo::Udp(io) = &entry.io else { return };
            match req.peer {
                Some(peer) => io.send_to(&req.buf, peer),
                None => io.send(&req.buf),
            }
        };
        match attempt {
            Ok(_) => {
                let req = w
                    .conns
                    .get_mut(&tok)
                    .and_then(|e| e.sendq.pop_front())
                    .expect("attempted request is queued");
                req.complete(&sock, Ok(()));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                w.set_writable_interest(tok, true);
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                sock.mgr.stats.of(sock.sock_type).inc(StatId::SendFail);
                let req = w
                    .conns
                    .get_mut(&tok)
                    .and_then(|e| e.sendq.pop_front())
                    .expect("attempted request is queued");
                req.complete(&sock, Err(io_err2result(&e)));
            }
        }
    }
    w.set_writable_interest(tok, false);
}

/// Queue one datagram for sending on the owning worker.
pub(crate) fn async_send(w: &mut WorkerIo, sock: &Arc<NmSocket>, req: Box<IoReq>) {
    if sock.is_closing() || sock.mgr.closing.load(Acquire) {
        req.complete(sock, Err(NmError::Cancelled));
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
    process_writable(w, tok);
}

/// Drain anything already queued by the kernel once a reader registers.
pub(crate) fn async_read(w: &mut WorkerIo, sock: &Arc<NmSocket>) {
    let tok = sock.token.load(Acquire);
    if tok != NO_TOKEN && sock.recv_cb.lock().unwrap().is_some() {
        process_read(w, tok);
    }
}

/// Replace the receive callback with nothing and fire it one last time
/// with `Cancelled`.
pub(crate) fn async_cancel(_w: &mut WorkerIo, sock: &Arc<NmSocket>, handle: Arc<NmHandle>) {
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

/// Associate a client UDP socket with its peer. The association is a
/// local operation, so the result is reported straight away.
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
    let io_res = (|| -> io::Result<mio::net::UdpSocket> {
        let s = sockopt::udp_socket(&sock.iface)?;
        let _ = sockopt::dontfrag(&s, &sock.iface);
        s.bind(&sock.iface.into())?;
        let std_sock: std::net::UdpSocket = s.into();
        std_sock.connect(peer)?;
        Ok(mio::net::UdpSocket::from_std(std_sock))
    })();
    let io = match io_res {
        Ok(io) => io,
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::ConnectFail);
            sock.connect_error.store(true, Release);
            req.complete(sock, Err(io_err2result(&e)));
            sock.close();
            return;
        }
    };
    let local = io.local_addr().ok();
    match w.register(sock, SockIo::Udp(io), Interest::READABLE) {
        Ok(_) => {
            if let Some(l) = local {
                *sock.local.lock().unwrap() = Some(l);
            }
            sock.connected.store(true, Release);
            sock.mgr.stats.of(sock.sock_type).inc(StatId::Open);
            sock.mgr.stats.of(sock.sock_type).inc(StatId::Connect);
            let h = sock.get_handle(peer, sock.local_addr());
            *sock.statichandle.lock().unwrap() = Arc::downgrade(&h);
            req.handle = Some(h);
            req.complete(sock, Ok(()));
        }
        Err(e) => {
            sock.mgr.stats.of(sock.sock_type).inc(StatId::OpenFail);
            sock.connect_error.store(true, Release);
            req.complete(sock, Err(io_err2result(&e)));
            sock.close();
        }
    }
}

/// Build and route a datagram send request.
pub(crate) fn send(
    sock: &Arc<NmSocket>,
    handle: &NmHandle,
    region: &[u8],
    cb: SendCb,
) -> crate::errors::NmResult<()> {
    let mut req = IoReq::get(sock);
    req.buf.extend_from_slice(region);
    req.peer = Some(handle.peer());
    req.cb = ReqCb::Send(cb);
    req.handle = Some(handle.attach());
    sock.mgr.enqueue(
        sock.tid,
        NetIEvent::UdpSend {
            sock: sock.clone(),
            req,
        },
    );
    Ok(())
}
