//! Cross-thread worker events.
//!
//! Every operation on a socket that does not originate on its owning
//! worker is expressed as one of these records and enqueued to
//! `workers[sock.tid]`. Priority events are carried on a separate queue
//! that keeps draining while a worker is paused.

use std::sync::Arc;

use crate::errors::NmError;
use crate::handle::NmHandle;
use crate::req::IoReq;
use crate::socket::NmSocket;

pub(crate) enum NetIEvent {
    // UDP
    UdpListen { sock: Arc<NmSocket> },
    UdpStop { sock: Arc<NmSocket> },
    UdpSend { sock: Arc<NmSocket>, req: Box<IoReq> },
    UdpRead { sock: Arc<NmSocket> },
    UdpCancel { sock: Arc<NmSocket>, handle: Arc<NmHandle> },
    UdpClose { sock: Arc<NmSocket> },
    UdpConnect { sock: Arc<NmSocket>, req: Box<IoReq> },

    // TCP
    TcpConnect { sock: Arc<NmSocket>, req: Box<IoReq> },
    TcpListen { sock: Arc<NmSocket> },
    TcpStartRead { sock: Arc<NmSocket> },
    TcpPauseRead { sock: Arc<NmSocket> },
    TcpSend { sock: Arc<NmSocket>, req: Box<IoReq> },
    TcpStop { sock: Arc<NmSocket> },
    TcpCancel { sock: Arc<NmSocket>, handle: Arc<NmHandle> },
    TcpClose { sock: Arc<NmSocket> },

    // TCPDNS (framing wrapper over TCP)
    TcpDnsSend { sock: Arc<NmSocket>, req: Box<IoReq> },
    TcpDnsRead { sock: Arc<NmSocket> },
    TcpDnsCancel { sock: Arc<NmSocket>, handle: Arc<NmHandle> },
    TcpDnsClose { sock: Arc<NmSocket> },

    // TLS (rustls wrapper over TCP)
    TlsSend { sock: Arc<NmSocket>, req: Box<IoReq> },
    TlsStartRead { sock: Arc<NmSocket> },
    TlsDoIo { sock: Arc<NmSocket> },
    TlsClose { sock: Arc<NmSocket> },

    // Handle teardown that must run on the owning worker.
    CloseHandle { sock: Arc<NmSocket>, handle: Arc<NmHandle> },

    // Manager-wide.
    Shutdown,
    Pause,

    // Priority class: processed even while the worker is paused.
    Resume,
    Detach { sock: Arc<NmSocket> },
}

impl NetIEvent {
    /// Events that run while a worker is paused: listen setup, resume,
    /// detach, and pause itself.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            NetIEvent::UdpListen { .. }
                | NetIEvent::TcpListen { .. }
                | NetIEvent::Resume
                | NetIEvent::Detach { .. }
                | NetIEvent::Pause
        )
    }

    /// Complete an event that will never be executed (target worker is
    /// gone), so its callbacks still fire exactly once and reference
    /// counts still balance.
    pub fn cancel(self) {
        use std::sync::atomic::Ordering::AcqRel;
        match self {
            NetIEvent::UdpSend { sock, req }
            | NetIEvent::UdpConnect { sock, req }
            | NetIEvent::TcpConnect { sock, req }
            | NetIEvent::TcpSend { sock, req }
            | NetIEvent::TcpDnsSend { sock, req }
            | NetIEvent::TlsSend { sock, req } => {
                req.complete(&sock, Err(NmError::Cancelled));
            }
            NetIEvent::UdpCancel { sock, handle }
            | NetIEvent::TcpCancel { sock, handle }
            | NetIEvent::TcpDnsCancel { sock, handle } => {
                NmHandle::detach(handle);
                let _ = sock;
            }
            NetIEvent::CloseHandle { sock, handle } => {
                // Worker is gone; finish the teardown inline.
                sock.deactivate_handle(&handle);
            }
            NetIEvent::UdpListen { sock } | NetIEvent::TcpListen { sock } => {
                crate::socket::listen_child_result(&sock, Err(NmError::Cancelled));
                sock.closed.store(true, std::sync::atomic::Ordering::Release);
                NmSocket::detach(&sock);
            }
            NetIEvent::UdpStop { sock } | NetIEvent::TcpStop { sock } => {
                if !sock.closed.swap(true, AcqRel) {
                    crate::socket::listen_child_stopped(&sock);
                    NmSocket::detach(&sock);
                }
            }
            NetIEvent::UdpClose { sock }
            | NetIEvent::TcpClose { sock }
            | NetIEvent::TcpDnsClose { sock }
            | NetIEvent::TlsClose { sock } => {
                *sock.selfref.lock().unwrap() = None;
                if !sock.closed.swap(true, AcqRel) {
                    NmSocket::detach(&sock);
                }
            }
            NetIEvent::Detach { sock } => {
                *sock.selfref.lock().unwrap() = None;
                sock.closed.store(true, std::sync::atomic::Ordering::Release);
                sock.destroy_final();
            }
            _ => {}
        }
    }
}
