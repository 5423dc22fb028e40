//! Per-socket-type statistics counters.
//!
//! All writes use Relaxed ordering; nothing synchronises through these.
//! `Active` is a gauge (incremented on socket creation, decremented on
//! destruction); everything else is a monotonic counter.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::socket::NmSocketType;

/// Index into a per-socket-type counter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatId {
    Open = 0,
    OpenFail = 1,
    Close = 2,
    BindFail = 3,
    ConnectFail = 4,
    Connect = 5,
    AcceptFail = 6,
    Accept = 7,
    SendFail = 8,
    RecvFail = 9,
    Active = 10,
}

pub(crate) const STATID_COUNT: usize = 11;

/// Counter block for one socket type.
#[derive(Default)]
pub struct SockStats {
    counters: [AtomicU64; STATID_COUNT],
}

impl SockStats {
    pub fn inc(&self, id: StatId) {
        self.counters[id as usize].fetch_add(1, Relaxed);
    }

    /// Only meaningful for the `Active` gauge.
    pub fn dec(&self, id: StatId) {
        self.counters[id as usize].fetch_sub(1, Relaxed);
    }

    pub fn get(&self, id: StatId) -> u64 {
        self.counters[id as usize].load(Relaxed)
    }
}

/// Manager-wide statistics: one counter block per socket type.
#[derive(Default)]
pub struct Stats {
    by_type: [SockStats; NmSocketType::COUNT],
}

impl Stats {
    pub fn of(&self, t: NmSocketType) -> &SockStats {
        &self.by_type[t as usize]
    }

    /// Plain-struct snapshot for display; counters may skew slightly
    /// relative to each other while sockets are in flight.
    pub fn snapshot(&self) -> StatsSnapshot {
        let rows = NmSocketType::ALL
            .iter()
            .map(|&t| {
                let s = self.of(t);
                StatRow {
                    socket_type: t.name(),
                    open: s.get(StatId::Open),
                    openfail: s.get(StatId::OpenFail),
                    close: s.get(StatId::Close),
                    bindfail: s.get(StatId::BindFail),
                    connectfail: s.get(StatId::ConnectFail),
                    connect: s.get(StatId::Connect),
                    acceptfail: s.get(StatId::AcceptFail),
                    accept: s.get(StatId::Accept),
                    sendfail: s.get(StatId::SendFail),
                    recvfail: s.get(StatId::RecvFail),
                    active: s.get(StatId::Active),
                }
            })
            .collect();
        StatsSnapshot { rows }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatRow {
    pub socket_type: &'static str,
    pub open: u64,
    pub openfail: u64,
    pub close: u64,
    pub bindfail: u64,
    pub connectfail: u64,
    pub connect: u64,
    pub acceptfail: u64,
    pub accept: u64,
    pub sendfail: u64,
    pub recvfail: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub rows: Vec<StatRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_independent_per_type() {
        let stats = Stats::default();
        stats.of(NmSocketType::Udp).inc(StatId::Open);
        stats.of(NmSocketType::Udp).inc(StatId::Open);
        stats.of(NmSocketType::Tcp).inc(StatId::Open);
        assert_eq!(stats.of(NmSocketType::Udp).get(StatId::Open), 2);
        assert_eq!(stats.of(NmSocketType::Tcp).get(StatId::Open), 1);
        assert_eq!(stats.of(NmSocketType::Tls).get(StatId::Open), 0);
    }

    #[test]
    fn test_active_gauge() {
        let stats = Stats::default();
        let s = stats.of(NmSocketType::TcpListener);
        s.inc(StatId::Active);
        s.inc(StatId::Active);
        s.dec(StatId::Active);
        assert_eq!(s.get(StatId::Active), 1);
    }

    #[test]
    fn test_snapshot_has_all_types() {
        let stats = Stats::default();
        stats.of(NmSocketType::TcpDns).inc(StatId::Accept);
        let snap = stats.snapshot();
        assert_eq!(snap.rows.len(), NmSocketType::COUNT);
        let row = snap
            .rows
            .iter()
            .find(|r| r.socket_type == "tcpdns")
            .unwrap();
        assert_eq!(row.accept, 1);
    }
}
