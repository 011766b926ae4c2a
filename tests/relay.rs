//! End-to-end scenarios from spec.md §8 (S1/S2/S3) plus a full
//! local+remote tunnel round trip (testable property 4), driven over
//! real loopback sockets rather than mocked I/O.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::{Events, Poll};
use slog::Logger;

use ss_relay_core::resolver::StdResolver;
use ss_relay_core::socks::CONNECT_SUCCESS_REPLY;
use ss_relay_core::{now_secs, Server};

fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn spawn_server_loop(mut server: Server, poll: Poll, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut events = Events::with_capacity(128);
        while !stop.load(Ordering::Relaxed) {
            if poll.poll(&mut events, Some(Duration::from_millis(50))).is_err() {
                break;
            }
            let now = now_secs();
            if server.dispatch(&events, poll.registry(), now).is_err() {
                break;
            }
        }
        server.close(poll.registry());
    })
}

/// S1: any greeting gets the fixed no-auth selection reply, and the
/// handler does not open a remote socket for it.
#[test]
fn greeting_selects_noauth_without_opening_a_remote_socket() {
    let mut server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        true,
        b"s1-password".to_vec(),
        300,
        None,
        Arc::new(StdResolver),
        test_logger(),
    )
    .unwrap();
    let poll = Poll::new().unwrap();
    server.attach_to_loop(poll.registry()).unwrap();
    let addr = server.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_server_loop(server, poll, stop.clone());

    let mut client = StdTcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();

    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    drop(client);
    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// S3: UDP-ASSOCIATE replies with the accepted socket's own bound
/// IPv4 address and port, then stays alive monitoring only the control
/// connection until the client closes it.
#[test]
fn udp_associate_reply_echoes_the_accepted_sockets_bound_address() {
    let mut server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        true,
        b"s3-password".to_vec(),
        300,
        None,
        Arc::new(StdResolver),
        test_logger(),
    )
    .unwrap();
    let poll = Poll::new().unwrap();
    server.attach_to_loop(poll.registry()).unwrap();
    let addr = server.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_server_loop(server, poll, stop.clone());

    let mut client = StdTcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let client_local_addr = client.local_addr().unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).unwrap();

    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
        .unwrap();
    let mut assoc_reply = [0u8; 10];
    client.read_exact(&mut assoc_reply).unwrap();

    assert_eq!(&assoc_reply[0..4], &[0x05, 0x00, 0x00, 0x01]);
    match addr {
        SocketAddr::V4(bound) => assert_eq!(&assoc_reply[4..8], &bound.ip().octets()),
        SocketAddr::V6(_) => panic!("server listens on IPv4 in this test"),
    }
    let bound_port = u16::from_be_bytes([assoc_reply[8], assoc_reply[9]]);
    // The accepted socket's local address is the server's listening
    // address (same IP:port every accepted connection shares), not the
    // client's own ephemeral port.
    assert_eq!(bound_port, addr.port());
    assert_ne!(bound_port, client_local_addr.port());

    drop(client);
    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// S2 + S4 + testable property 4: a client's CONNECT is tunneled
/// through a local and a remote instance to a plain destination
/// server, and the destination's echoed reply comes back byte-exact.
#[test]
fn full_tunnel_round_trips_bytes_through_local_and_remote() {
    let password = b"shared-tunnel-password".to_vec();

    let dest_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    let dest_thread = thread::spawn(move || {
        let (mut stream, _) = dest_listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });

    let mut remote_server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        false,
        password.clone(),
        300,
        None,
        Arc::new(StdResolver),
        test_logger(),
    )
    .unwrap();
    let remote_poll = Poll::new().unwrap();
    remote_server.attach_to_loop(remote_poll.registry()).unwrap();
    let remote_addr = remote_server.local_addr().unwrap();

    let mut local_server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        true,
        password,
        300,
        Some(remote_addr),
        Arc::new(StdResolver),
        test_logger(),
    )
    .unwrap();
    let local_poll = Poll::new().unwrap();
    local_server.attach_to_loop(local_poll.registry()).unwrap();
    let local_addr = local_server.local_addr().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let remote_handle = spawn_server_loop(remote_server, remote_poll, stop.clone());
    let local_handle = spawn_server_loop(local_server, local_poll, stop.clone());

    let mut client = StdTcpStream::connect(local_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).unwrap();
    assert_eq!(greeting_reply, [0x05, 0x00]);

    let mut connect_request = vec![0x05, 0x01, 0x00, 0x01];
    match dest_addr {
        SocketAddr::V4(a) => connect_request.extend_from_slice(&a.ip().octets()),
        SocketAddr::V6(_) => panic!("test destination must be IPv4"),
    }
    connect_request.extend_from_slice(&dest_addr.port().to_be_bytes());
    client.write_all(&connect_request).unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).unwrap();
    assert_eq!(connect_reply, CONNECT_SUCCESS_REPLY);

    let payload = b"hello through the tunnel";
    client.write_all(payload).unwrap();

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed[..], &payload[..]);

    dest_thread.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    remote_handle.join().unwrap();
    local_handle.join().unwrap();
}
