//! Result kinds surfaced by the network manager.
//!
//! Synchronous entry points return [`NmResult`]; asynchronous operations
//! deliver exactly one of these kinds through their registered callback.

use std::fmt;
use std::io;

/// Error kinds surfaced to consumers, both synchronously and through
/// completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmError {
    /// A read or connect timer expired before the operation completed.
    Timeout,
    /// The operation was preempted by a cancel request or manager shutdown.
    Cancelled,
    /// The listener's connection quota was exhausted at accept time.
    QuotaExceeded,
    AddrInUse,
    AddrNotAvail,
    ConnRefused,
    NetUnreach,
    /// The peer closed or reset the connection.
    ConnReset,
    /// The TLS handshake failed before the session reached the I/O state.
    TlsHandshake,
    /// A TLS protocol error occurred after the handshake.
    TlsProtocol,
    OutOfMemory,
    /// Socket creation or an unclassified socket-level failure.
    SocketFail,
    /// The operation requires a connected socket.
    NotConnected,
    /// Internal invariant failure; logged at the point of conversion.
    Unexpected,
}

pub type NmResult<T> = Result<T, NmError>;

impl fmt::Display for NmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NmError::Timeout => "operation timed out",
            NmError::Cancelled => "operation cancelled",
            NmError::QuotaExceeded => "connection quota exceeded",
            NmError::AddrInUse => "address in use",
            NmError::AddrNotAvail => "address not available",
            NmError::ConnRefused => "connection refused",
            NmError::NetUnreach => "network unreachable",
            NmError::ConnReset => "connection reset by peer",
            NmError::TlsHandshake => "TLS handshake failed",
            NmError::TlsProtocol => "TLS protocol error",
            NmError::OutOfMemory => "out of memory",
            NmError::SocketFail => "socket failure",
            NmError::NotConnected => "socket not connected",
            NmError::Unexpected => "unexpected internal error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for NmError {}

/// Translate an OS-level I/O error into an [`NmError`] kind.
///
/// The mapping covers the kinds consumers are expected to branch on;
/// anything else collapses to `SocketFail` with a debug log entry so new
/// error sources can be added to the table as they show up.
pub(crate) fn io_err2result(e: &io::Error) -> NmError {
    use io::ErrorKind;
    match e.kind() {
        ErrorKind::AddrInUse => NmError::AddrInUse,
        ErrorKind::AddrNotAvailable => NmError::AddrNotAvail,
        ErrorKind::ConnectionRefused => NmError::ConnRefused,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => NmError::ConnReset,
        ErrorKind::TimedOut => NmError::Timeout,
        ErrorKind::NotConnected => NmError::NotConnected,
        ErrorKind::OutOfMemory => NmError::OutOfMemory,
        _ => match e.raw_os_error() {
            Some(code) if code == libc::ENETUNREACH || code == libc::EHOSTUNREACH => {
                NmError::NetUnreach
            }
            _ => {
                tracing::debug!("unmapped I/O error: {e}");
                NmError::SocketFail
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_err_mapping() {
        let cases = [
            (io::ErrorKind::AddrInUse, NmError::AddrInUse),
            (io::ErrorKind::ConnectionRefused, NmError::ConnRefused),
            (io::ErrorKind::ConnectionReset, NmError::ConnReset),
            (io::ErrorKind::BrokenPipe, NmError::ConnReset),
            (io::ErrorKind::TimedOut, NmError::Timeout),
            (io::ErrorKind::NotConnected, NmError::NotConnected),
        ];
        for (kind, want) in cases {
            assert_eq!(io_err2result(&io::Error::from(kind)), want);
        }
    }

    #[test]
    fn test_unreachable_maps_by_os_code() {
        let e = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(io_err2result(&e), NmError::NetUnreach);
        let e = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(io_err2result(&e), NmError::NetUnreach);
    }

    #[test]
    fn test_unknown_collapses_to_socketfail() {
        let e = io::Error::new(io::ErrorKind::Other, "weird");
        assert_eq!(io_err2result(&e), NmError::SocketFail);
    }
}
