//! DNS message framing over TCP.
//!
//! Wraps an accepted TCP connection and reassembles the 2-byte big-endian
//! length-prefixed messages of RFC 1035 §4.2.2 from arbitrarily split
//! reads. Each complete message is delivered through a per-query handle;
//! responses are sent back with the length prefix prepended. Pipelining is
//! the default, bounded by the manager's per-connection cap; in
//! sequential mode the next query is delivered only after the response to
//! the previous one has gone out.

use std::mem;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::Arc;

use crate::errors::{NmError, NmResult};
use crate::event::NetIEvent;
use crate::handle::NmHandle;
use crate::req::{IoReq, ReqCb};
use crate::socket::{NmSocket, NmSocketType, RecvCb, SendCb};
use crate::worker::{finish_close, WorkerIo};
use crate::tcp;

/// Largest frame a 2-byte length prefix can describe.
pub const MAX_FRAME: usize = u16::MAX as usize;

fn addrs(dns: &Arc<NmSocket>) -> (std::net::SocketAddr, std::net::SocketAddr) {
    let peer = dns.peer.lock().unwrap().unwrap_or(dns.iface);
    let local = dns.local.lock().unwrap().unwrap_or(dns.iface);
    (peer, local)
}

/// Internal accept callback installed on the carrier TCP listener: wrap
/// the new connection, hand a connection handle to the user's accept
/// callback, and start pulling bytes into the assembly buffer.
pub(crate) fn accept_wrap(
    dns_l: &Arc<NmSocket>,
    tcp_h: Option<&Arc<NmHandle>>,
    res: NmResult<()>,
) {
    let user_acb = dns_l.accept_cb.lock().unwrap().clone();
    match (tcp_h, res) {
        (Some(th), Ok(())) => {
            let Some(tcp_sock) = th.socket() else { return };
            let dns = NmSocket::new(
                &dns_l.mgr,
                NmSocketType::TcpDns,
                tcp_sock.tid,
                dns_l.iface,
                dns_l.extrahandlesize,
            );
            *dns.listener.lock().unwrap() = Arc::downgrade(dns_l);
            *dns.outer.lock().unwrap() = Some(tcp_sock.clone());
            *tcp_sock.wrapper.lock().unwrap() = Arc::downgrade(&dns);
            *dns.outerhandle.lock().unwrap() = Some(th.attach());
            *dns.peer.lock().unwrap() = Some(th.peer());
            *dns.local.lock().unwrap() = Some(th.local());
            *dns.recv_cb.lock().unwrap() = dns_l.recv_cb.lock().unwrap().clone();
            dns.connected.store(true, Release);
            // Wrapper connections own themselves until closed.
            *dns.selfref.lock().unwrap() = Some(dns.clone());
            let h = dns.get_handle(th.peer(), th.local());
            *dns.statichandle.lock().unwrap() = Arc::downgrade(&h);
            if let Some(acb) = user_acb {
                acb(Some(&h), Ok(()));
            }
            NmHandle::detach(h);
            let wdns = Arc::downgrade(&dns);
            let inner: RecvCb = Arc::new(move |oh, r| {
                if let Some(dns) = wdns.upgrade() {
                    on_outer_read(&dns, oh, r);
                }
            });
            let _ = th.read(inner);
        }
        (h, Err(e)) => {
            if let Some(acb) = user_acb {
                acb(h, Err(e));
            }
        }
        (None, Ok(())) => {}
    }
}

/// Bytes (or an error) from the carrier TCP connection.
pub(crate) fn on_outer_read(dns: &Arc<NmSocket>, _oh: &Arc<NmHandle>, res: NmResult<&[u8]>) {
    match res {
        Ok(bytes) => {
            dns.dnsbuf.lock().unwrap().extend_from_slice(bytes);
            process_pending(dns);
        }
        Err(e) => {
            deliver_error(dns, e);
            dns.close();
        }
    }
}

fn deliver_error(dns: &Arc<NmSocket>, e: NmError) {
    if dns.is_closing() || dns.is_closed() {
        return;
    }
    // Take the callback so the close path cannot fire it again.
    let Some(cb) = dns.recv_cb.lock().unwrap().take() else {
        return;
    };
    let (peer, local) = addrs(dns);
    match dns.statichandle.lock().unwrap().upgrade() {
        Some(h) => cb(&h, Err(e)),
        None => {
            let h = dns.get_handle(peer, local);
            cb(&h, Err(e));
            NmHandle::detach(h);
        }
    }
}

/// Deliver every complete frame sitting in the assembly buffer, honouring
/// the sequential and pipelining limits.
pub(crate) fn process_pending(dns: &Arc<NmSocket>) {
    let max = dns.mgr.max_pipelined();
    loop {
        if dns.is_closing() || dns.is_closed() {
            return;
        }
        if dns.sequential.load(Acquire) && dns.processing.load(Acquire) {
            return;
        }
        if dns.overlimit.load(Acquire) {
            return;
        }
        let Some(cb) = dns.recv_cb.lock().unwrap().clone() else {
            return;
        };
        let frame = {
            let mut buf = dns.dnsbuf.lock().unwrap();
            if buf.len() < 2 {
                None
            } else {
                let flen = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                if buf.len() < 2 + flen {
                    None
                } else {
                    let f: Vec<u8> = buf[2..2 + flen].to_vec();
                    buf.drain(..2 + flen);
                    Some(f)
                }
            }
        };
        let Some(frame) = frame else { return };
        let inflight = dns.inflight.fetch_add(1, AcqRel) + 1;
        if dns.sequential.load(Acquire) {
            dns.processing.store(true, Release);
            pause_outer(dns);
        }
        if inflight > max && !dns.overlimit.swap(true, AcqRel) {
            pause_outer(dns);
        }
        let (peer, local) = addrs(dns);
        let h = dns.get_handle(peer, local);
        cb(&h, Ok(&frame));
        NmHandle::detach(h);
    }
}

fn pause_outer(dns: &Arc<NmSocket>) {
    if let Some(outer) = dns.outer_sock() {
        dns.mgr
            .enqueue(outer.tid, NetIEvent::TcpPauseRead { sock: outer });
    }
}

fn resume_outer(dns: &Arc<NmSocket>) {
    if let Some(outer) = dns.outer_sock() {
        dns.mgr
            .enqueue(outer.tid, NetIEvent::TcpStartRead { sock: outer });
    }
}

/// One response has gone out on the wire: drop the in-flight count and
/// unblock frame delivery that was gated on it.
pub(crate) fn send_complete(dns: &Arc<NmSocket>) {
    let prev = dns.inflight.fetch_sub(1, AcqRel);
    debug_assert!(prev >= 1);
    let inflight = prev.saturating_sub(1);
    let mut resume = dns.processing.swap(false, AcqRel);
    if dns.overlimit.load(Acquire) && inflight <= dns.mgr.max_pipelined() {
        dns.overlimit.store(false, Release);
        resume = true;
    }
    if resume && !dns.is_closing() {
        resume_outer(dns);
        dns.mgr
            .enqueue(dns.tid, NetIEvent::TcpDnsRead { sock: dns.clone() });
    }
}

/// Build a framed send: 2-byte big-endian length prefix, then the
/// message.
pub(crate) fn send(
    dns: &Arc<NmSocket>,
    handle: &NmHandle,
    region: &[u8],
    cb: SendCb,
) -> NmResult<()> {
    if region.len() > MAX_FRAME {
        return Err(NmError::Unexpected);
    }
    let mut req = IoReq::get(dns);
    req.buf.reserve(region.len() + 2);
    req.buf.extend_from_slice(&(region.len() as u16).to_be_bytes());
    req.buf.extend_from_slice(region);
    req.cb = ReqCb::Send(cb);
    req.handle = Some(handle.attach());
    dns.mgr.enqueue(
        dns.tid,
        NetIEvent::TcpDnsSend {
            sock: dns.clone(),
            req,
        },
    );
    Ok(())
}

/// Hand a framed response to the carrier TCP socket; the user callback
/// and the in-flight accounting both ride on the carrier's completion.
pub(crate) fn async_send(w: &mut WorkerIo, dns: &Arc<NmSocket>, mut req: Box<IoReq>) {
    if dns.is_closing() || dns.mgr.closing.load(Acquire) {
        req.complete(dns, Err(NmError::Cancelled));
        return;
    }
    let outer = dns.outer_sock();
    let th = dns.outerhandle.lock().unwrap().clone();
    let (Some(outer), Some(th)) = (outer, th) else {
        req.complete(dns, Err(NmError::NotConnected));
        return;
    };
    let user_cb = match mem::replace(&mut req.cb, ReqCb::None) {
        ReqCb::Send(cb) => Some(cb),
        _ => None,
    };
    let user_h = req.handle.take();
    let buf = mem::take(&mut req.buf);
    IoReq::put(dns, req);

    let wdns = Arc::downgrade(dns);
    let inner: SendCb = Box::new(move |_th, res| {
        if let Some(dns) = wdns.upgrade() {
            send_complete(&dns);
        }
        if let Some(h) = user_h {
            if let Some(cb) = user_cb {
                cb(&h, res);
            }
            NmHandle::detach(h);
        }
    });
    let mut treq = IoReq::get(&outer);
    treq.buf = buf;
    treq.cb = ReqCb::Send(inner);
    treq.handle = Some(th.attach());
    tcp::async_send(w, &outer, treq);
}

/// Resume frame delivery from the assembly buffer (read start/resume).
pub(crate) fn async_read(_w: &mut WorkerIo, dns: &Arc<NmSocket>) {
    process_pending(dns);
}

pub(crate) fn async_cancel(_w: &mut WorkerIo, dns: &Arc<NmSocket>, handle: Arc<NmHandle>) {
    let cb = dns.recv_cb.lock().unwrap().take();
    if let Some(cb) = cb {
        cb(&handle, Err(NmError::Cancelled));
    }
    NmHandle::detach(handle);
}

pub(crate) fn async_close(w: &mut WorkerIo, dns: &Arc<NmSocket>) {
    finish_close(w, dns);
}

#[cfg(test)]
mod tests {
    use super::MAX_FRAME;

    /// Reference framing: one pass over the whole byte string.
    fn frame_all(mut bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while bytes.len() >= 2 {
            let flen = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            if bytes.len() < 2 + flen {
                break;
            }
            out.push(bytes[2..2 + flen].to_vec());
            bytes = &bytes[2 + flen..];
        }
        out
    }

    /// Incremental framing with the same buffer discipline as
    /// `process_pending`.
    fn frame_split(chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            loop {
                if buf.len() < 2 {
                    break;
                }
                let flen = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                if buf.len() < 2 + flen {
                    break;
                }
                out.push(buf[2..2 + flen].to_vec());
                buf.drain(..2 + flen);
            }
        }
        out
    }

    fn encode(msgs: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for m in msgs {
            assert!(m.len() <= MAX_FRAME);
            out.extend_from_slice(&(m.len() as u16).to_be_bytes());
            out.extend_from_slice(m);
        }
        out
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msgs: [&[u8]; 4] = [b"HELLO", b"BYE", b"", b"\x00\x01\x02"];
        let wire = encode(&msgs);
        let decoded = frame_all(&wire);
        assert_eq!(decoded.len(), 4);
        for (got, want) in decoded.iter().zip(msgs.iter()) {
            assert_eq!(got.as_slice(), *want);
        }
    }

    #[test]
    fn test_split_framing_matches_single_pass() {
        // The exact byte string from the framing scenario: "HELLO" then
        // "BYE", split 1/2/4/5.
        let wire: Vec<u8> = vec![
            0x00, 0x05, 0x48, 0x45, 0x4C, 0x4C, 0x4F, 0x00, 0x03, 0x42, 0x59, 0x45,
        ];
        let single = frame_all(&wire);
        assert_eq!(single, vec![b"HELLO".to_vec(), b"BYE".to_vec()]);

        let split = frame_split(&[&wire[..1], &wire[1..3], &wire[3..7], &wire[7..]]);
        assert_eq!(split, single);
    }

    #[test]
    fn test_all_split_points_agree() {
        let msgs: [&[u8]; 3] = [b"abc", b"", b"0123456789"];
        let wire = encode(&msgs);
        let single = frame_all(&wire);
        for cut1 in 0..wire.len() {
            for cut2 in cut1..wire.len() {
                let split = frame_split(&[&wire[..cut1], &wire[cut1..cut2], &wire[cut2..]]);
                assert_eq!(split, single, "split at {cut1}/{cut2}");
            }
        }
    }

    #[test]
    fn test_partial_frame_is_held_back() {
        let out = frame_split(&[&[0x00, 0x05, b'H', b'E']]);
        assert!(out.is_empty());
        let out = frame_split(&[&[0x00]]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_max_frame_boundary() {
        let big = vec![0xAB; MAX_FRAME];
        let wire = encode(&[&big]);
        let decoded = frame_all(&wire);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].len(), MAX_FRAME);
    }
}
