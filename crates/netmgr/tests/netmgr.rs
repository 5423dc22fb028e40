//! End-to-end transport scenarios over loopback.
//!
//! Each test builds its own manager and uses plain std sockets as the
//! remote peer, so the netmgr side is exercised exactly the way an
//! external client would drive it.

use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use netmgr::{AcceptCb, NetMgr, NmError, NmHandle, Quota, RecvCb};

use std::io::Write;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_udp_echo_roundtrip() {
    let mgr = NetMgr::new(2).unwrap();
    let send_count = Arc::new(AtomicU64::new(0));
    let recv_count = Arc::new(AtomicU64::new(0));

    let sc = send_count.clone();
    let rc = recv_count.clone();
    let echo: RecvCb = Arc::new(move |h, res| {
        let data = res.expect("server recv ok");
        rc.fetch_add(1, Relaxed);
        let sc = sc.clone();
        h.send(
            data,
            Box::new(move |_h, res| {
                assert!(res.is_ok());
                sc.fetch_add(1, Relaxed);
            }),
        )
        .unwrap();
    });

    let listener = mgr
        .listen_udp("127.0.0.1:0".parse().unwrap(), echo, 0)
        .unwrap();
    let addr = listener.local_addr();
    assert_ne!(addr.port(), 0);

    let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.send_to(&[0xDE, 0xAD, 0xBE, 0xEF], addr).unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(from, addr);
    assert_eq!(recv_count.load(Relaxed), 1);
    // The send completion fires on the worker; give it a moment.
    let t0 = std::time::Instant::now();
    while send_count.load(Relaxed) < 1 && t0.elapsed() < WAIT {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(send_count.load(Relaxed), 1);

    mgr.shutdown();
    mgr.destroy();
}

#[test]
fn test_tcpdns_framing_across_segments() {
    let mgr = NetMgr::new(2).unwrap();
    let (ftx, frx) = unbounded::<Vec<u8>>();

    let recv: RecvCb = Arc::new(move |_h, res| {
        let frame = res.expect("frame delivered");
        ftx.send(frame.to_vec()).unwrap();
    });
    let accept: AcceptCb = Arc::new(|_h, res| {
        assert!(res.is_ok());
    });
    let listener = mgr
        .listen_tcpdns("127.0.0.1:0".parse().unwrap(), recv, accept, 0, 16, None)
        .unwrap();
    let addr = listener.local_addr();

    // "HELLO" then "BYE", written in chunks of 1, 2, 4, and 5 bytes.
    let wire: [u8; 12] = [
        0x00, 0x05, 0x48, 0x45, 0x4C, 0x4C, 0x4F, 0x00, 0x03, 0x42, 0x59, 0x45,
    ];
    let mut client = StdTcpStream::connect(addr).unwrap();
    client.set_nodelay(true).unwrap();
    for chunk in [&wire[..1], &wire[1..3], &wire[3..7], &wire[7..]] {
        client.write_all(chunk).unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }

    let first = frx.recv_timeout(WAIT).unwrap();
    assert_eq!(first, b"HELLO");
    let second = frx.recv_timeout(WAIT).unwrap();
    assert_eq!(second, b"BYE");
    assert!(frx.recv_timeout(Duration::from_millis(200)).is_err());

    mgr.shutdown();
    mgr.destroy();
}

#[test]
fn test_tcp_quota_refusal() {
    let mgr = NetMgr::new(2).unwrap();
    let quota = Quota::new(1);
    let (atx, arx) = unbounded::<Result<(), NmError>>();

    let accept: AcceptCb = Arc::new(move |h, res| {
        match &res {
            Ok(()) => {
                // Keep the accepted connection open so the quota token
                // stays held.
                let h = h.expect("handle on success");
                let keep = h.attach();
                h.set_data(Box::new(keep), None, None);
            }
            Err(_) => assert!(h.is_none()),
        }
        atx.send(res).unwrap();
    });
    let listener = mgr
        .listen_tcp(
            "127.0.0.1:0".parse().unwrap(),
            accept,
            0,
            16,
            Some(quota.clone()),
        )
        .unwrap();
    let addr = listener.local_addr();

    let _c1 = StdTcpStream::connect(addr).unwrap();
    let first = arx.recv_timeout(WAIT).unwrap();
    assert_eq!(first, Ok(()));
    assert_eq!(quota.used(), 1);

    let _c2 = StdTcpStream::connect(addr).unwrap();
    let second = arx.recv_timeout(WAIT).unwrap();
    assert_eq!(second, Err(NmError::QuotaExceeded));
    assert_eq!(quota.used(), 1);

    mgr.shutdown();
    mgr.destroy();
    // Shutdown released the first connection's token.
    assert_eq!(quota.used(), 0);
}

#[test]
fn test_tcp_read_timeout_then_not_connected() {
    let mgr = NetMgr::new(2).unwrap();
    // 200 ms timeouts, configured in tenths of seconds.
    mgr.set_timeouts(2, 2, 2, 2);

    // A server that accepts and then stays silent.
    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let guard = std::thread::spawn(move || {
        let (stream, _) = server.accept().unwrap();
        std::thread::sleep(Duration::from_secs(2));
        drop(stream);
    });

    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);
    mgr.tcp_connect(
        None,
        addr,
        Box::new(move |h, res| {
            assert!(res.is_ok());
            let _ = htx.send(h.expect("connected handle").attach());
        }),
        5_000,
        0,
    )
    .unwrap();
    let handle = hrx.recv_timeout(WAIT).unwrap();

    let (rtx, rrx) = unbounded::<Result<Vec<u8>, NmError>>();
    handle
        .read(Arc::new(move |_h, res| {
            rtx.send(res.map(|d| d.to_vec())).unwrap();
        }))
        .unwrap();

    // The read timer expires with no data; exactly one Timeout callback.
    let got = rrx.recv_timeout(WAIT).unwrap();
    assert_eq!(got, Err(NmError::Timeout));
    assert!(matches!(
        rrx.recv_timeout(Duration::from_millis(300)),
        Err(RecvTimeoutError::Timeout)
    ));

    // The connection is gone; sends now fail synchronously.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(
        handle.send(b"ping", Box::new(|_h, _res| {})),
        Err(NmError::NotConnected)
    );

    mgr.shutdown();
    mgr.destroy();
    guard.join().unwrap();
}

#[test]
fn test_shutdown_cancels_pending_read() {
    let mgr = NetMgr::new(2).unwrap();

    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let guard = std::thread::spawn(move || {
        let (stream, _) = server.accept().unwrap();
        std::thread::sleep(Duration::from_secs(2));
        drop(stream);
    });

    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);
    mgr.tcp_connect(
        None,
        addr,
        Box::new(move |h, res| {
            assert!(res.is_ok());
            let _ = htx.send(h.expect("connected handle").attach());
        }),
        5_000,
        0,
    )
    .unwrap();
    let handle = hrx.recv_timeout(WAIT).unwrap();

    let (rtx, rrx) = unbounded::<Result<Vec<u8>, NmError>>();
    handle
        .read(Arc::new(move |_h, res| {
            rtx.send(res.map(|d| d.to_vec())).unwrap();
        }))
        .unwrap();

    mgr.shutdown();
    let got = rrx.recv_timeout(WAIT).unwrap();
    assert_eq!(got, Err(NmError::Cancelled));
    assert!(matches!(
        rrx.recv_timeout(Duration::from_millis(300)),
        Err(RecvTimeoutError::Timeout)
    ));

    mgr.destroy();
    guard.join().unwrap();
}

#[test]
fn test_pause_freezes_reads_priority_listen_works() {
    let mgr = NetMgr::new(2).unwrap();
    let (dtx, drx) = unbounded::<Vec<u8>>();

    let recv: RecvCb = Arc::new(move |_h, res| {
        if let Ok(data) = res {
            dtx.send(data.to_vec()).unwrap();
        }
    });
    let listener = mgr
        .listen_udp("127.0.0.1:0".parse().unwrap(), recv, 0)
        .unwrap();
    let addr = listener.local_addr();

    mgr.pause();

    // Listen setup is a priority operation: it succeeds while paused.
    let paused_listener = mgr
        .listen_udp(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(|_h, _res| {}),
            0,
        )
        .unwrap();
    assert!(paused_listener.is_listening());

    // Data sent while paused is not delivered...
    let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"one", addr).unwrap();
    client.send_to(b"two", addr).unwrap();
    assert!(matches!(
        drx.recv_timeout(Duration::from_millis(300)),
        Err(RecvTimeoutError::Timeout)
    ));

    // ...and arrives, in order, after resume.
    mgr.resume();
    assert_eq!(drx.recv_timeout(WAIT).unwrap(), b"one");
    assert_eq!(drx.recv_timeout(WAIT).unwrap(), b"two");

    mgr.shutdown();
    mgr.destroy();
}

#[test]
fn test_idempotent_close() {
    let mgr = NetMgr::new(1).unwrap();

    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let guard = std::thread::spawn(move || {
        let (stream, _) = server.accept().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);
    let sock = mgr
        .tcp_connect(
            None,
            addr,
            Box::new(move |h, res| {
                assert!(res.is_ok());
                let _ = htx.send(h.expect("connected handle").attach());
            }),
            5_000,
            0,
        )
        .unwrap();
    let handle = hrx.recv_timeout(WAIT).unwrap();

    sock.close();
    sock.close();
    sock.close();
    std::thread::sleep(Duration::from_millis(200));
    assert!(sock.is_closed());
    assert!(!sock.is_connected());
    assert_eq!(sock.active_handles(), 0);
    // Terminal state is stable across repeated closes.
    sock.close();
    assert!(sock.is_closed());

    drop(handle);
    mgr.shutdown();
    mgr.destroy();
    guard.join().unwrap();
}

#[test]
fn test_tcp_echo_via_manager_client() {
    // Drives both sides through the manager: a TCP echo listener and a
    // connected client socket.
    let mgr = NetMgr::new(2).unwrap();

    let accept: AcceptCb = Arc::new(|h, res| {
        assert!(res.is_ok());
        let h = h.expect("handle");
        let keep = h.attach();
        h.set_data(Box::new(keep), None, None);
        h.read(Arc::new(|h, res| {
            if let Ok(data) = res {
                let _ = h.send(data, Box::new(|_h, _res| {}));
            }
        }))
        .unwrap();
    });
    let listener = mgr
        .listen_tcp("127.0.0.1:0".parse().unwrap(), accept, 0, 16, None)
        .unwrap();
    let addr = listener.local_addr();

    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);
    mgr.tcp_connect(
        None,
        addr,
        Box::new(move |h, res| {
            assert!(res.is_ok());
            let _ = htx.send(h.expect("handle").attach());
        }),
        5_000,
        0,
    )
    .unwrap();
    let handle = hrx.recv_timeout(WAIT).unwrap();

    let (rtx, rrx) = unbounded::<Vec<u8>>();
    handle
        .read(Arc::new(move |_h, res| {
            if let Ok(data) = res {
                rtx.send(data.to_vec()).unwrap();
            }
        }))
        .unwrap();

    let sent_ok = Arc::new(AtomicU64::new(0));
    let sc = sent_ok.clone();
    handle
        .send(
            b"ping-pong",
            Box::new(move |_h, res| {
                assert!(res.is_ok());
                sc.fetch_add(1, Relaxed);
            }),
        )
        .unwrap();

    let mut collected = Vec::new();
    while collected.len() < 9 {
        let chunk = rrx.recv_timeout(WAIT).unwrap();
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"ping-pong");
    assert_eq!(sent_ok.load(Relaxed), 1);

    NmHandle::detach(handle);
    mgr.shutdown();
    mgr.destroy();
}

#[test]
fn test_handle_extra_and_addresses() {
    let mgr = NetMgr::new(1).unwrap();
    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);

    let recv: RecvCb = Arc::new(move |h, res| {
        if res.is_ok() {
            let _ = htx.send(h.attach());
        }
    });
    let listener = mgr
        .listen_udp("127.0.0.1:0".parse().unwrap(), recv, 32)
        .unwrap();
    let addr = listener.local_addr();

    let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"hi", addr).unwrap();
    let handle = hrx.recv_timeout(WAIT).unwrap();

    assert_eq!(handle.local().port(), addr.port());
    assert_eq!(handle.peer().port(), client.local_addr().unwrap().port());
    handle.with_extra(|extra| {
        assert_eq!(extra.len(), 32);
        extra[0] = 0x7F;
    });
    handle.with_extra(|extra| assert_eq!(extra[0], 0x7F));

    NmHandle::detach(handle);
    mgr.shutdown();
    mgr.destroy();
}

/// Server and client rustls configs sharing the self-signed test
/// certificate under `tests/certs/`.
fn tls_test_configs() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let mut cert_rd: &[u8] = include_bytes!("certs/cert.pem");
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_rd)
        .unwrap()
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    let mut key_rd: &[u8] = include_bytes!("certs/key.pem");
    let key = rustls_pemfile::pkcs8_private_keys(&mut key_rd)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let server = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs.clone(), rustls::PrivateKey(key))
        .unwrap();
    let mut roots = rustls::RootCertStore::empty();
    for cert in &certs {
        roots.add(cert).unwrap();
    }
    let client = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (Arc::new(server), Arc::new(client))
}

#[test]
fn test_tls_echo_via_manager_client() {
    // Full handshake and echo round-trip with both sides driven through
    // the manager.
    let (server_cfg, client_cfg) = tls_test_configs();
    let mgr = NetMgr::new(2).unwrap();

    let accept: AcceptCb = Arc::new(|h, res| {
        assert!(res.is_ok());
        let h = h.expect("handle after handshake");
        let keep = h.attach();
        h.set_data(Box::new(keep), None, None);
        h.read(Arc::new(|h, res| {
            if let Ok(data) = res {
                let _ = h.send(data, Box::new(|_h, _res| {}));
            }
        }))
        .unwrap();
    });
    let listener = mgr
        .listen_tls(
            "127.0.0.1:0".parse().unwrap(),
            accept,
            0,
            16,
            None,
            server_cfg,
        )
        .unwrap();
    let addr = listener.local_addr();
    assert_ne!(addr.port(), 0);

    let (htx, hrx) = bounded::<Arc<NmHandle>>(1);
    mgr.tls_connect(
        None,
        addr,
        Box::new(move |h, res| {
            assert!(res.is_ok());
            let _ = htx.send(h.expect("handle after handshake").attach());
        }),
        5_000,
        0,
        client_cfg,
        "localhost",
    )
    .unwrap();
    let handle = hrx.recv_timeout(WAIT).unwrap();

    let (rtx, rrx) = unbounded::<Vec<u8>>();
    handle
        .read(Arc::new(move |_h, res| {
            if let Ok(data) = res {
                rtx.send(data.to_vec()).unwrap();
            }
        }))
        .unwrap();

    let sent_ok = Arc::new(AtomicU64::new(0));
    let sc = sent_ok.clone();
    handle
        .send(
            b"tls-ping",
            Box::new(move |_h, res| {
                assert!(res.is_ok());
                sc.fetch_add(1, Relaxed);
            }),
        )
        .unwrap();

    let mut collected = Vec::new();
    while collected.len() < 8 {
        let chunk = rrx.recv_timeout(WAIT).unwrap();
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"tls-ping");
    assert_eq!(sent_ok.load(Relaxed), 1);

    NmHandle::detach(handle);
    mgr.shutdown();
    mgr.destroy();
}

#[test]
fn test_tls_handshake_failure_reaches_connect_cb() {
    // The peer answers the ClientHello with junk; the connect callback
    // fires exactly once with a handshake failure, never with a handle.
    let (_server_cfg, client_cfg) = tls_test_configs();
    let mgr = NetMgr::new(1).unwrap();

    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let guard = std::thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        stream.write_all(b"this is not a tls server\n").unwrap();
        std::thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let (etx, erx) = unbounded::<Result<(), NmError>>();
    mgr.tls_connect(
        None,
        addr,
        Box::new(move |h, res| {
            assert!(h.is_none());
            etx.send(res).unwrap();
        }),
        5_000,
        0,
        client_cfg,
        "localhost",
    )
    .unwrap();

    let got = erx.recv_timeout(WAIT).unwrap();
    assert_eq!(got, Err(NmError::TlsHandshake));
    assert!(matches!(
        erx.recv_timeout(Duration::from_millis(300)),
        Err(RecvTimeoutError::Timeout)
    ));

    mgr.shutdown();
    mgr.destroy();
    guard.join().unwrap();
}

#[test]
fn test_stop_listening_releases_port() {
    let mgr = NetMgr::new(2).unwrap();
    let listener = mgr
        .listen_udp("127.0.0.1:0".parse().unwrap(), Arc::new(|_h, _r| {}), 0)
        .unwrap();
    let addr = listener.local_addr();
    assert!(listener.is_listening());

    listener.stop_listening();
    assert!(!listener.is_listening());
    assert!(listener.is_closed());

    // The port is free again for an exclusive bind.
    let reclaim = StdUdpSocket::bind(addr);
    assert!(reclaim.is_ok());

    mgr.shutdown();
    mgr.destroy();
}
