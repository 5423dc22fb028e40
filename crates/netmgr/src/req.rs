//! Per-I/O scratch records.
//!
//! Every asynchronous send or connect carries one [`IoReq`]: the owned
//! buffer, the target address, the one-shot completion callback, and the
//! write progress for partial stream writes. Completed requests are pushed
//! onto the owning socket's reuse stack, overflowing into a manager-wide
//! pool.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::errors::NmResult;
use crate::handle::NmHandle;
use crate::socket::{ConnectCb, NmSocket, SendCb};

/// Per-socket reuse stack cap; beyond this, requests spill to the manager
/// pool.
const SOCK_REQ_CACHE: usize = 32;
/// Manager pool cap; beyond this, requests are simply dropped.
pub(crate) const MGR_REQ_CACHE: usize = 1024;

pub(crate) enum ReqCb {
    Send(SendCb),
    Connect(ConnectCb),
    None,
}

pub(crate) struct IoReq {
    pub buf: Vec<u8>,
    pub peer: Option<SocketAddr>,
    pub cb: ReqCb,
    /// Handle this request pins; detached when the request completes.
    pub handle: Option<Arc<NmHandle>>,
    /// Bytes of `buf` already written (stream sends only).
    pub written: usize,
}

impl IoReq {
    fn new() -> Box<IoReq> {
        Box::new(IoReq {
            buf: Vec::new(),
            peer: None,
            cb: ReqCb::None,
            handle: None,
            written: 0,
        })
    }

    /// Get a request for `sock`, reusing a pooled one when available.
    pub fn get(sock: &NmSocket) -> Box<IoReq> {
        if let Some(req) = sock.inactive_reqs.lock().unwrap().pop() {
            return req;
        }
        if let Some(req) = sock.mgr.req_pool.lock().unwrap().pop() {
            return req;
        }
        IoReq::new()
    }

    /// Return a spent request to the reuse stacks.
    pub fn put(sock: &NmSocket, mut req: Box<IoReq>) {
        req.buf.clear();
        req.peer = None;
        req.cb = ReqCb::None;
        req.handle = None;
        req.written = 0;
        if sock.is_active() {
            let mut stack = sock.inactive_reqs.lock().unwrap();
            if stack.len() < SOCK_REQ_CACHE {
                stack.push(req);
                return;
            }
        }
        let mut pool = sock.mgr.req_pool.lock().unwrap();
        if pool.len() < MGR_REQ_CACHE {
            pool.push(req);
        }
    }

    /// Fire the completion callback exactly once, detach the pinned
    /// handle, and recycle the request.
    pub fn complete(mut self: Box<Self>, sock: &Arc<NmSocket>, res: NmResult<()>) {
        let cb = mem::replace(&mut self.cb, ReqCb::None);
        let handle = self.handle.take();
        match cb {
            ReqCb::Send(cb) => {
                if let Some(h) = &handle {
                    cb(h, res);
                }
            }
            ReqCb::Connect(cb) => {
                cb(handle.as_ref(), res);
            }
            ReqCb::None => {}
        }
        if let Some(h) = handle {
            NmHandle::detach(h);
        }
        IoReq::put(sock, self);
    }
}
