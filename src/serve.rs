//! `nmprobe serve` — run echo listeners until killed.
//!
//! Every transport echoes back whatever it receives, which is enough to
//! exercise the full listen / accept / read / send / timeout surface from
//! an ordinary client (`dig +tcp`, `openssl s_client`, netcat). Periodic
//! statistics snapshots go to the log.

use anyhow::{bail, Context, Result};
use netmgr::{AcceptCb, NetMgr, NmSocket, Quota, RecvCb, SendCb};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ListenerEntry, ProbeConfig};

fn noop_send_cb() -> SendCb {
    Box::new(|_h, res| {
        if let Err(e) = res {
            debug!("echo send failed: {e}");
        }
    })
}

/// Echo datagrams straight back to their sender.
fn udp_echo_cb() -> RecvCb {
    Arc::new(|h, res| {
        if let Ok(data) = res {
            let _ = h.send(data, noop_send_cb());
        }
    })
}

/// Echo framed DNS messages back on the same connection.
fn tcpdns_echo_cb() -> RecvCb {
    Arc::new(|h, res| {
        if let Ok(frame) = res {
            let _ = h.send(frame, noop_send_cb());
        }
    })
}

/// Accept a stream connection, keep its handle alive for the lifetime of
/// the connection, and echo every chunk.
fn stream_accept_cb(name: String) -> AcceptCb {
    Arc::new(move |h, res| match (h, res) {
        (Some(h), Ok(())) => {
            debug!(listener = %name, peer = %h.peer(), "accepted");
            // The connection lives as long as its handle; park a
            // self-reference in the handle's opaque slot so the echo
            // session survives until the peer (or a timeout) ends it.
            let keep = h.attach();
            h.set_data(Box::new(keep), None, None);
            let _ = h.read(Arc::new(|h, res| {
                if let Ok(data) = res {
                    let _ = h.send(data, noop_send_cb());
                }
            }));
        }
        (_, Err(e)) => debug!("connection refused: {e}"),
        _ => {}
    })
}

fn connection_accept_log_cb(name: String) -> AcceptCb {
    Arc::new(move |h, res| match (h, res) {
        (Some(h), Ok(())) => debug!(listener = %name, peer = %h.peer(), "connection"),
        (_, Err(e)) => debug!(listener = %name, "connection refused: {e}"),
        _ => {}
    })
}

fn load_tls_config(entry: &ListenerEntry) -> Result<Arc<rustls::ServerConfig>> {
    let cert_path = entry
        .cert
        .as_deref()
        .with_context(|| format!("listener '{}' needs a cert", entry.name))?;
    let key_path = entry
        .key
        .as_deref()
        .with_context(|| format!("listener '{}' needs a key", entry.name))?;
    let certs: Vec<rustls::Certificate> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))?
            .into_iter()
            .map(rustls::Certificate)
            .collect();
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key_path)?))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(key_path)?))?;
    }
    let key = keys
        .into_iter()
        .next()
        .with_context(|| format!("no private key found in {key_path}"))?;
    let cfg = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(key))
        .context("invalid certificate/key pair")?;
    Ok(Arc::new(cfg))
}

pub fn run(config: &ProbeConfig) -> Result<()> {
    if config.listeners.is_empty() {
        bail!("no listeners configured; run `nmprobe init` for an example config");
    }

    let mgr = NetMgr::new(config.workers)?;
    let t = &config.timeouts;
    mgr.set_timeouts(t.initial, t.idle, t.keepalive, t.advertised);
    if let Some(maxudp) = config.max_udp {
        mgr.set_maxudp(maxudp);
    }
    if let Some(max) = config.max_pipelined {
        mgr.set_max_pipelined(max);
    }

    let mut listeners: Vec<Arc<NmSocket>> = Vec::new();
    for entry in &config.listeners {
        let addr: SocketAddr = entry
            .address
            .parse()
            .with_context(|| format!("listener '{}': bad address {}", entry.name, entry.address))?;
        let quota = entry.quota.map(Quota::new);
        let sock = match entry.transport.as_str() {
            "udp" => mgr.listen_udp(addr, udp_echo_cb(), 0)?,
            "tcp" => mgr.listen_tcp(addr, stream_accept_cb(entry.name.clone()), 0, 128, quota)?,
            "tcpdns" => mgr.listen_tcpdns(
                addr,
                tcpdns_echo_cb(),
                connection_accept_log_cb(entry.name.clone()),
                0,
                128,
                quota,
            )?,
            "tls" => {
                let tls_cfg = load_tls_config(entry)?;
                mgr.listen_tls(
                    addr,
                    stream_accept_cb(entry.name.clone()),
                    0,
                    128,
                    quota,
                    tls_cfg,
                )?
            }
            other => bail!("listener '{}': unknown transport '{other}'", entry.name),
        };
        info!(
            listener = %entry.name,
            transport = %entry.transport,
            addr = %sock.local_addr(),
            "listening"
        );
        listeners.push(sock);
    }

    let interval = Duration::from_secs(config.stats_interval_secs.max(1));
    loop {
        std::thread::sleep(interval);
        for row in mgr.stats_snapshot().rows {
            if row.open + row.accept + row.connect + row.active == 0 {
                continue;
            }
            info!(
                sock_type = row.socket_type,
                active = row.active,
                accept = row.accept,
                recvfail = row.recvfail,
                sendfail = row.sendfail,
                "stats"
            );
        }
    }
}
