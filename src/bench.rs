//! `nmprobe bench` — timed echo round-trip benchmark with JSON output.
//!
//! Stands up loopback echo listeners, then ping-pongs a fixed payload for
//! the requested duration: UDP through a connected netmgr client socket,
//! DNS-framed TCP through a plain std client with manual framing. The
//! report carries message counts and RTT percentiles per transport.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded};
use netmgr::{NetMgr, NmHandle, RecvCb};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub duration_secs: u64,
    pub payload_bytes: usize,
    pub workers: usize,
    pub transports: Vec<TransportReport>,
}

#[derive(Debug, Serialize)]
pub struct TransportReport {
    pub transport: &'static str,
    pub messages: u64,
    pub msgs_per_sec: f64,
    pub timeouts: u64,
    pub rtt_p50_us: Option<i64>,
    pub rtt_p95_us: Option<i64>,
    pub rtt_p99_us: Option<i64>,
}

/// (p50, p95, p99) in µs; sorts its input.
fn percentiles(rtts: &mut Vec<i64>) -> (Option<i64>, Option<i64>, Option<i64>) {
    if rtts.is_empty() {
        return (None, None, None);
    }
    rtts.sort_unstable();
    let n = rtts.len();
    let pick = |p: usize| rtts[(n * p / 100).min(n - 1)];
    (Some(pick(50)), Some(pick(95)), Some(pick(99)))
}

fn report(transport: &'static str, mut rtts: Vec<i64>, timeouts: u64, dur: Duration) -> TransportReport {
    let messages = rtts.len() as u64;
    let (p50, p95, p99) = percentiles(&mut rtts);
    TransportReport {
        transport,
        messages,
        msgs_per_sec: messages as f64 / dur.as_secs_f64(),
        timeouts,
        rtt_p50_us: p50,
        rtt_p95_us: p95,
        rtt_p99_us: p99,
    }
}

fn echo_cb() -> RecvCb {
    Arc::new(|h, res| {
        if let Ok(data) = res {
            let _ = h.send(data, Box::new(|_h, _res| {}));
        }
    })
}

/// UDP ping-pong through the manager's own connected-socket path.
fn bench_udp(mgr: &Arc<NetMgr>, duration: Duration, payload: &[u8]) -> Result<TransportReport> {
    let listener = mgr.listen_udp("127.0.0.1:0".parse().unwrap(), echo_cb(), 0)?;
    let addr = listener.local_addr();
    info!(%addr, "udp echo listener up");

    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);
    let _client = mgr.udp_connect(
        None,
        addr,
        Box::new(move |h, res| {
            if let (Some(h), Ok(())) = (h, res) {
                let _ = htx.send(h.attach());
            }
        }),
        5_000,
        0,
    )?;
    let handle = hrx
        .recv_timeout(Duration::from_secs(5))
        .context("udp connect did not complete")?;

    let (rtx, rrx) = unbounded::<()>();
    handle.read(Arc::new(move |_h, res| {
        if res.is_ok() {
            let _ = rtx.send(());
        }
    }))?;

    let mut rtts = Vec::new();
    let mut timeouts = 0u64;
    let t0 = Instant::now();
    while t0.elapsed() < duration {
        let sent = Instant::now();
        handle.send(payload, Box::new(|_h, _res| {}))?;
        match rrx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) => rtts.push(sent.elapsed().as_micros() as i64),
            Err(_) => timeouts += 1,
        }
    }
    let elapsed = t0.elapsed();
    netmgr::NmHandle::detach(handle);
    listener.stop_listening();
    Ok(report("udp", rtts, timeouts, elapsed))
}

/// DNS-framed ping-pong from a plain std client against the framing
/// listener.
fn bench_tcpdns(mgr: &Arc<NetMgr>, duration: Duration, payload: &[u8]) -> Result<TransportReport> {
    let listener = mgr.listen_tcpdns(
        "127.0.0.1:0".parse().unwrap(),
        echo_cb(),
        Arc::new(|_h, _res| {}),
        0,
        128,
        None,
    )?;
    let addr = listener.local_addr();
    info!(%addr, "tcpdns echo listener up");

    let mut stream = std::net::TcpStream::connect(addr).context("tcpdns connect")?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    stream.set_nodelay(true)?;

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);

    let mut rtts = Vec::new();
    let mut timeouts = 0u64;
    let mut resp = vec![0u8; payload.len() + 2];
    let t0 = Instant::now();
    while t0.elapsed() < duration {
        let sent = Instant::now();
        stream.write_all(&frame)?;
        match stream.read_exact(&mut resp) {
            Ok(()) => rtts.push(sent.elapsed().as_micros() as i64),
            Err(_) => {
                timeouts += 1;
                break; // framing is now misaligned; stop this run
            }
        }
    }
    let elapsed = t0.elapsed();
    drop(stream);
    listener.stop_listening();
    Ok(report("tcpdns", rtts, timeouts, elapsed))
}

pub fn run(
    workers: usize,
    duration_secs: u64,
    payload_bytes: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let duration = Duration::from_secs(duration_secs.max(1));
    let payload = vec![0xA5u8; payload_bytes.clamp(1, netmgr::MAX_FRAME)];

    let mgr = NetMgr::new(workers)?;
    let mut transports = Vec::new();
    transports.push(bench_udp(&mgr, duration, &payload)?);
    transports.push(bench_tcpdns(&mgr, duration, &payload)?);
    mgr.shutdown();
    mgr.destroy();

    let out = BenchReport {
        duration_secs,
        payload_bytes: payload.len(),
        workers,
        transports,
    };
    let json = serde_json::to_string_pretty(&out)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let mut v: Vec<i64> = (1..=100).collect();
        let (p50, p95, p99) = percentiles(&mut v);
        assert_eq!(p50, Some(51));
        assert_eq!(p95, Some(96));
        assert_eq!(p99, Some(100));
    }

    #[test]
    fn test_percentiles_empty() {
        let mut v = Vec::new();
        assert_eq!(percentiles(&mut v), (None, None, None));
    }
}
