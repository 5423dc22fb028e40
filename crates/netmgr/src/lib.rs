//! Multi-worker network manager for a DNS server.
//!
//! A fixed pool of worker threads, each running a single-threaded mio
//! event loop, multiplexes UDP, TCP, DNS-framed TCP, and TLS sockets.
//! Sockets are pinned to one worker at creation; everything that touches
//! a socket's I/O state is routed to that worker as a tagged event, so
//! the hot path needs no socket locks. Consumers interact through
//! reference-counted [`NmHandle`]s and completion callbacks that fire
//! exactly once, on the socket's owning worker.

pub mod errors;
pub mod handle;
pub mod manager;
pub mod quota;
pub mod socket;
pub mod stats;
pub mod tcpdns;
pub mod tls;

mod event;
mod req;
mod sockopt;
mod tcp;
mod udp;
mod worker;

pub use errors::{NmError, NmResult};
pub use handle::NmHandle;
pub use manager::{NetMgr, SockTrace};
pub use quota::{Quota, QuotaGuard};
pub use socket::{AcceptCb, CloseHandleCb, ConnectCb, NmSocket, NmSocketType, RecvCb, SendCb};
pub use stats::{SockStats, StatId, Stats, StatsSnapshot};
pub use tcpdns::MAX_FRAME;
pub use tls::tls_initialize;
