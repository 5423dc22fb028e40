//! TLS over TCP.
//!
//! Wraps a TCP connection with a rustls session. The session's buffered
//! state machine stands in for the pair of in-memory BIOs the transport
//! is modelled on: inbound ciphertext from the carrier is fed through
//! `read_tls`/`process_new_packets`, plaintext is pulled from `reader()`
//! and delivered to the receive callback, and outbound records drained by
//! `write_tls` ride the carrier's send path. Phases: Init → Handshake →
//! Io → Closing, with Error as a sink. The connect/accept callback fires
//! exactly once, when the handshake completes or fails.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Once};

use crate::errors::{NmError, NmResult};
use crate::handle::NmHandle;
use crate::req::{IoReq, ReqCb};
use crate::socket::{NmSocket, NmSocketType, RecvCb, SendCb};
use crate::worker::{finish_close, WorkerIo};

static TLS_INIT: Once = Once::new();

/// One-shot TLS subsystem initialisation; safe to call any number of
/// times.
pub fn tls_initialize() {
    TLS_INIT.call_once(|| {
        tracing::debug!("TLS subsystem initialised");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsPhase {
    Init,
    Handshake,
    Io,
    Error,
    Closing,
}

pub(crate) struct TlsState {
    pub conn: rustls::Connection,
    pub phase: TlsPhase,
    /// Sends accepted before the handshake finished; released into the
    /// session on completion.
    pub pending_sends: VecDeque<(Vec<u8>, SendCb)>,
    /// The connect/accept callback has been delivered.
    pub cb_fired: bool,
    pub server: bool,
}

/// Prepare the client-side session state on a connecting socket.
pub(crate) fn init_client(
    tls_sock: &Arc<NmSocket>,
    config: Arc<rustls::ClientConfig>,
    server_name: &str,
) -> NmResult<()> {
    let sn = rustls::ServerName::try_from(server_name).map_err(|_| NmError::TlsHandshake)?;
    let mut cc = rustls::ClientConnection::new(config, sn).map_err(|e| {
        tracing::debug!("TLS client session: {e}");
        NmError::TlsHandshake
    })?;
    cc.set_buffer_limit(None);
    *tls_sock.tls.lock().unwrap() = Some(TlsState {
        conn: rustls::Connection::Client(cc),
        phase: TlsPhase::Init,
        pending_sends: VecDeque::new(),
        cb_fired: false,
        server: false,
    });
    Ok(())
}

/// Internal accept callback installed on the carrier TCP listener: build
/// the server session and start the handshake off the first inbound
/// bytes. The user's accept callback fires when the handshake completes.
pub(crate) fn accept_wrap(
    tls_l: &Arc<NmSocket>,
    tcp_h: Option<&Arc<NmHandle>>,
    res: NmResult<()>,
) {
    match (tcp_h, res) {
        (Some(th), Ok(())) => {
            let Some(tcp_sock) = th.socket() else { return };
            let Some(cfg) = tls_l.tls_listen_cfg.lock().unwrap().clone() else {
                return;
            };
            let mut sc = match rustls::ServerConnection::new(cfg) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("TLS server session: {e}");
                    return;
                }
            };
            sc.set_buffer_limit(None);
            let tls = NmSocket::new(
                &tls_l.mgr,
                NmSocketType::Tls,
                tcp_sock.tid,
                tls_l.iface,
                tls_l.extrahandlesize,
            );
            *tls.listener.lock().unwrap() = Arc::downgrade(tls_l);
            *tls.outer.lock().unwrap() = Some(tcp_sock.clone());
            *tcp_sock.wrapper.lock().unwrap() = Arc::downgrade(&tls);
            *tls.outerhandle.lock().unwrap() = Some(th.attach());
            *tls.peer.lock().unwrap() = Some(th.peer());
            *tls.local.lock().unwrap() = Some(th.local());
            *tls.tls.lock().unwrap() = Some(TlsState {
                conn: rustls::Connection::Server(sc),
                phase: TlsPhase::Handshake,
                pending_sends: VecDeque::new(),
                cb_fired: false,
                server: true,
            });
            // Wrapper connections own themselves until closed.
            *tls.selfref.lock().unwrap() = Some(tls.clone());
            let wtls = Arc::downgrade(&tls);
            let inner: RecvCb = Arc::new(move |oh, r| {
                if let Some(tls) = wtls.upgrade() {
                    on_outer_read(&tls, oh, r);
                }
            });
            let _ = th.read(inner);
            drive(&tls, None);
        }
        (h, Err(e)) => {
            if let Some(acb) = tls_l.accept_cb.lock().unwrap().clone() {
                acb(h, Err(e));
            }
        }
        _ => {}
    }
}

/// Completion of the carrier TCP connect for an outgoing TLS connection.
pub(crate) fn outer_connect_done(
    tls_sock: &Arc<NmSocket>,
    tcp_h: Option<&Arc<NmHandle>>,
    res: NmResult<()>,
) {
    match (tcp_h, res) {
        (Some(th), Ok(())) => {
            let Some(tcp_sock) = th.socket() else { return };
            *tls_sock.outer.lock().unwrap() = Some(tcp_sock.clone());
            *tcp_sock.wrapper.lock().unwrap() = Arc::downgrade(tls_sock);
            *tls_sock.outerhandle.lock().unwrap() = Some(th.attach());
            *tls_sock.peer.lock().unwrap() = Some(th.peer());
            *tls_sock.local.lock().unwrap() = Some(th.local());
            if let Some(st) = tls_sock.tls.lock().unwrap().as_mut() {
                st.phase = TlsPhase::Handshake;
            }
            let wtls = Arc::downgrade(tls_sock);
            let inner: RecvCb = Arc::new(move |oh, r| {
                if let Some(tls) = wtls.upgrade() {
                    on_outer_read(&tls, oh, r);
                }
            });
            let _ = th.read(inner);
            // First handshake flight.
            drive(tls_sock, None);
        }
        (_, Err(e)) => failure(tls_sock, e),
        _ => {}
    }
}

/// Ciphertext (or an error) from the carrier connection.
pub(crate) fn on_outer_read(tls: &Arc<NmSocket>, _oh: &Arc<NmHandle>, res: NmResult<&[u8]>) {
    match res {
        Ok(bytes) => drive(tls, Some(bytes)),
        Err(e) => failure(tls, e),
    }
}

/// Pump the session: feed inbound ciphertext, progress the handshake,
/// pull plaintext for the receive callback, and flush outbound records
/// through the carrier.
pub(crate) fn drive(tls: &Arc<NmSocket>, input: Option<&[u8]>) {
    let deliverable =
        tls.recv_cb.lock().unwrap().is_some() && !tls.readpaused.load(Acquire);
    let mut out: Vec<u8> = Vec::new();
    let mut plain: Vec<Vec<u8>> = Vec::new();
    let mut flushed: Vec<SendCb> = Vec::new();
    let mut completed = false;
    let mut peer_closed = false;
    let mut err: Option<NmError> = None;
    {
        let mut guard = tls.tls.lock().unwrap();
        let Some(st) = guard.as_mut() else { return };
        let teardown = matches!(st.phase, TlsPhase::Error | TlsPhase::Closing);
        let mut cur = input.map(io::Cursor::new);
        loop {
            let mut progress = false;
            if !teardown {
                if let Some(c) = cur.as_mut() {
                    while (c.position() as usize) < c.get_ref().len() {
                        match st.conn.read_tls(c) {
                            Ok(0) => break,
                            Ok(_) => progress = true,
                            Err(e) => {
                                tracing::debug!("TLS record intake: {e}");
                                break;
                            }
                        }
                    }
                }
                match st.conn.process_new_packets() {
                    Ok(io_state) => {
                        if !st.conn.is_handshaking()
                            && matches!(st.phase, TlsPhase::Init | TlsPhase::Handshake)
                        {
                            st.phase = TlsPhase::Io;
                            progress = true;
                            if !st.cb_fired {
                                st.cb_fired = true;
                                completed = true;
                            }
                            while let Some((buf, cb)) = st.pending_sends.pop_front() {
                                let _ = st.conn.writer().write_all(&buf);
                                flushed.push(cb);
                            }
                        }
                        if io_state.peer_has_closed() {
                            peer_closed = true;
                        }
                        if st.phase == TlsPhase::Io && deliverable {
                            let mut tmp = [0u8; 4096];
                            loop {
                                match st.conn.reader().read(&mut tmp) {
                                    Ok(0) => {
                                        peer_closed = true;
                                        break;
                                    }
                                    Ok(n) => {
                                        plain.push(tmp[..n].to_vec());
                                        progress = true;
                                    }
                                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                                        peer_closed = true;
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("TLS protocol failure: {e}");
                        err = Some(if matches!(st.phase, TlsPhase::Init | TlsPhase::Handshake)
                        {
                            NmError::TlsHandshake
                        } else {
                            NmError::TlsProtocol
                        });
                        st.phase = TlsPhase::Error;
                    }
                }
            }
            while st.conn.wants_write() {
                match st.conn.write_tls(&mut out) {
                    Ok(0) => break,
                    Ok(_) => progress = true,
                    Err(e) => {
                        tracing::debug!("TLS record drain: {e}");
                        break;
                    }
                }
            }
            if teardown || err.is_some() || !progress {
                break;
            }
        }
    }

    if !out.is_empty() {
        let th = tls.outerhandle.lock().unwrap().clone();
        if let Some(th) = th {
            let wtls = Arc::downgrade(tls);
            let cb: SendCb = Box::new(move |_h, res| {
                if let Err(e) = res {
                    if let Some(tls) = wtls.upgrade() {
                        failure(&tls, e);
                    }
                }
            });
            let _ = th.send(&out, cb);
        }
    }
    if completed {
        completion(tls);
    }
    if !flushed.is_empty() {
        if let Some(h) = tls.statichandle.lock().unwrap().upgrade() {
            for cb in flushed {
                cb(&h, Ok(()));
            }
        }
    }
    if !plain.is_empty() {
        let cb = tls.recv_cb.lock().unwrap().clone();
        let h = tls.statichandle.lock().unwrap().upgrade();
        if let (Some(cb), Some(h)) = (cb, h) {
            for chunk in &plain {
                if tls.is_closing() || tls.readpaused.load(Acquire) {
                    break;
                }
                cb(&h, Ok(chunk));
            }
        }
    }
    if let Some(e) = err {
        failure(tls, e);
    } else if peer_closed && !tls.is_closing() {
        deliver_error(tls, NmError::ConnReset);
        tls.close();
    }
}

/// Handshake completion: create the connection handle and fire the
/// connect or accept callback exactly once.
fn completion(tls: &Arc<NmSocket>) {
    tls.connected.store(true, Release);
    let peer = tls.peer.lock().unwrap().unwrap_or(tls.iface);
    let local = tls.local.lock().unwrap().unwrap_or(tls.iface);
    let h = tls.get_handle(peer, local);
    *tls.statichandle.lock().unwrap() = Arc::downgrade(&h);
    if tls.client.load(Acquire) {
        if let Some(cb) = tls.connect_cb.lock().unwrap().take() {
            cb(Some(&h), Ok(()));
        }
    } else {
        let acb = tls
            .listener
            .lock()
            .unwrap()
            .upgrade()
            .and_then(|l| l.accept_cb.lock().unwrap().clone());
        if let Some(acb) = acb {
            acb(Some(&h), Ok(()));
        }
    }
    NmHandle::detach(h);
}

fn deliver_error(tls: &Arc<NmSocket>, e: NmError) {
    let cb = tls.recv_cb.lock().unwrap().take();
    let h = tls.statichandle.lock().unwrap().upgrade();
    if let (Some(cb), Some(h)) = (cb, h) {
        cb(&h, Err(e));
    }
}

/// Fatal session failure: deliver the error to whichever callback is
/// outstanding, fail queued sends, and tear the connection down.
pub(crate) fn failure(tls: &Arc<NmSocket>, e: NmError) {
    let (fired, pending) = {
        let mut guard = tls.tls.lock().unwrap();
        match guard.as_mut() {
            Some(st) => {
                if st.phase == TlsPhase::Error {
                    // already torn down once
                    (true, VecDeque::new())
                } else {
                    st.phase = TlsPhase::Error;
                    let fired = st.cb_fired;
                    st.cb_fired = true;
                    (fired, std::mem::take(&mut st.pending_sends))
                }
            }
            None => (true, VecDeque::new()),
        }
    };
    if !fired {
        if tls.client.load(Acquire) {
            if let Some(cb) = tls.connect_cb.lock().unwrap().take() {
                cb(None, Err(e));
            }
        } else {
            let acb = tls
                .listener
                .lock()
                .unwrap()
                .upgrade()
                .and_then(|l| l.accept_cb.lock().unwrap().clone());
            if let Some(acb) = acb {
                acb(None, Err(e));
            }
        }
    } else {
        deliver_error(tls, e);
    }
    if let Some(h) = tls.statichandle.lock().unwrap().upgrade() {
        for (_buf, cb) in pending {
            cb(&h, Err(NmError::Cancelled));
        }
    }
    tls.close();
}

/// Build and route a TLS send. During the handshake the payload is
/// queued; after it, the payload enters the session synchronously on the
/// owning worker.
pub(crate) fn send(
    tls: &Arc<NmSocket>,
    handle: &NmHandle,
    region: &[u8],
    cb: SendCb,
) -> NmResult<()> {
    let mut req = IoReq::get(tls);
    req.buf.extend_from_slice(region);
    req.cb = ReqCb::Send(cb);
    req.handle = Some(handle.attach());
    tls.mgr.enqueue(
        tls.tid,
        crate::event::NetIEvent::TlsSend {
            sock: tls.clone(),
            req,
        },
    );
    Ok(())
}

pub(crate) fn async_send(_w: &mut WorkerIo, tls: &Arc<NmSocket>, mut req: Box<IoReq>) {
    if tls.is_closing() || tls.mgr.closing.load(Acquire) {
        req.complete(tls, Err(NmError::Cancelled));
        return;
    }
    let phase = tls.tls.lock().unwrap().as_ref().map(|st| st.phase);
    match phase {
        None => req.complete(tls, Err(NmError::NotConnected)),
        Some(TlsPhase::Io) => {
            let write_ok = {
                let mut guard = tls.tls.lock().unwrap();
                match guard.as_mut() {
                    Some(st) => st.conn.writer().write_all(&req.buf).is_ok(),
                    None => false,
                }
            };
            if write_ok {
                req.complete(tls, Ok(()));
                drive(tls, None);
            } else {
                req.complete(tls, Err(NmError::Unexpected));
            }
        }
        Some(TlsPhase::Init) | Some(TlsPhase::Handshake) => {
            let buf = std::mem::take(&mut req.buf);
            let cb = match std::mem::replace(&mut req.cb, ReqCb::None) {
                ReqCb::Send(cb) => cb,
                _ => return,
            };
            if let Some(h) = req.handle.take() {
                NmHandle::detach(h);
            }
            if let Some(st) = tls.tls.lock().unwrap().as_mut() {
                st.pending_sends.push_back((buf, cb));
            }
            IoReq::put(tls, req);
        }
        Some(TlsPhase::Error) | Some(TlsPhase::Closing) => {
            req.complete(tls, Err(NmError::Cancelled));
        }
    }
}

/// Deliver plaintext already decrypted before the reader registered.
pub(crate) fn async_startread(_w: &mut WorkerIo, tls: &Arc<NmSocket>) {
    drive(tls, None);
}

pub(crate) fn async_doio(_w: &mut WorkerIo, tls: &Arc<NmSocket>) {
    drive(tls, None);
}

/// Close the session: emit close_notify through the carrier, then run
/// the common teardown (which drops the carrier handle and with it the
/// TCP connection).
pub(crate) fn async_close(w: &mut WorkerIo, tls: &Arc<NmSocket>) {
    {
        let mut guard = tls.tls.lock().unwrap();
        if let Some(st) = guard.as_mut() {
            if st.phase != TlsPhase::Error {
                st.conn.send_close_notify();
            }
            st.phase = TlsPhase::Closing;
        }
    }
    drive(tls, None);
    finish_close(w, tls);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_idempotent() {
        tls_initialize();
        tls_initialize();
        tls_initialize();
    }
}
