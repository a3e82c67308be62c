//! End-to-end tests for the UDP proxy over loopback sockets.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Once, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;

use faultline::filter::{InvertFilter, PassFilter};
use faultline::{
    DatagramMeters, DatagramProxy, DatagramProxyConfig, Error, ProxyState, Reactor, ReactorConfig,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        faultline::init_tracing();
    });
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Sends every datagram straight back to its sender.
fn echo_backend() -> SocketAddr {
    let socket = UdpSocket::bind(localhost()).unwrap();
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], from);
        }
    });
    addr
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind(localhost()).unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    socket
}

fn exchange(client: &UdpSocket, proxy: &DatagramProxy, data: &[u8]) -> Vec<u8> {
    client.send_to(data, proxy.local_addr().unwrap()).unwrap();
    let mut buf = [0u8; 65536];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(from, proxy.local_addr().unwrap());
    buf[..n].to_vec()
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn reactor() -> Reactor {
    init_test_tracing();
    Reactor::new(ReactorConfig::default()).unwrap()
}

#[test]
fn each_peer_gets_its_own_relay() {
    const PEERS: usize = 4;

    let reactor = reactor();
    let proxy =
        DatagramProxy::open_new(&reactor, DatagramProxyConfig::new(localhost(), echo_backend()))
            .unwrap();

    let clients: Vec<UdpSocket> = (0..PEERS).map(|_| client()).collect();
    for (i, client) in clients.iter().enumerate() {
        let payload = format!("peer-{i}");
        assert_eq!(exchange(client, &proxy, payload.as_bytes()), payload.as_bytes());
    }

    let mut peers = proxy.clients().unwrap();
    peers.sort();
    let mut expected: Vec<SocketAddr> = clients.iter().map(|c| c.local_addr().unwrap()).collect();
    expected.sort();
    assert_eq!(peers, expected);

    let addr = clients[0].local_addr().unwrap();
    let packets = proxy.client_packet_meters(addr).unwrap().unwrap();
    assert_eq!(packets.sent.total_count(), 1);
    assert_eq!(packets.read.total_count(), 1);
    let bytes = proxy.client_byte_meters(addr).unwrap().unwrap();
    assert_eq!(bytes.sent.total_count(), 6);

    assert_eq!(proxy.inner_packet_meters().read.total_count(), PEERS as u64);
    assert!(eventually(|| proxy.inner_packet_meters().sent.total_count() == PEERS as u64));
}

#[test]
fn zero_length_datagram_is_relayed() {
    let reactor = reactor();
    let proxy =
        DatagramProxy::open_new(&reactor, DatagramProxyConfig::new(localhost(), echo_backend()))
            .unwrap();

    let client = client();
    assert!(exchange(&client, &proxy, &[]).is_empty());
    assert_eq!(exchange(&client, &proxy, b"after"), b"after");
    assert_eq!(proxy.inner_byte_meters().read.total_count(), 5);
}

#[test]
fn filters_rewrite_and_drop_datagrams() {
    let reactor = reactor();
    let config = DatagramProxyConfig::new(localhost(), echo_backend())
        .with_outgoing_filter(InvertFilter::factory())
        .with_incoming_filter(InvertFilter::factory())
        .with_outgoing_pass_filter(Arc::new(|_: SocketAddr| {
            // Runs before the transform, on the bytes the peer sent.
            Box::new(|data: &[u8]| !data.starts_with(b"x")) as Box<dyn PassFilter>
        }));
    let proxy = DatagramProxy::open_new(&reactor, config).unwrap();

    let client = client();
    let target = proxy.local_addr().unwrap();
    client.send_to(b"xdrop", target).unwrap();
    assert_eq!(exchange(&client, &proxy, b"keep"), b"keep");
}

#[test]
fn idle_peers_are_evicted() {
    let reactor = reactor();
    let (deleted_tx, deleted_rx) = channel::unbounded::<SocketAddr>();
    let config = DatagramProxyConfig::new(localhost(), echo_backend())
        .with_max_idle(Duration::from_millis(100))
        .with_on_client_deleted(Arc::new(move |addr: SocketAddr, _: &DatagramMeters| {
            let _ = deleted_tx.send(addr);
        }));
    let proxy = DatagramProxy::open_new(&reactor, config).unwrap();

    let first = client();
    exchange(&first, &proxy, b"one");
    thread::sleep(Duration::from_millis(300));

    let second = client();
    exchange(&second, &proxy, b"two");

    assert_eq!(deleted_rx.recv_timeout(TIMEOUT).unwrap(), first.local_addr().unwrap());
    assert_eq!(proxy.clients().unwrap(), vec![second.local_addr().unwrap()]);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(proxy.close_idle_clients(Duration::ZERO).unwrap(), 1);
    assert!(proxy.clients().unwrap().is_empty());
}

#[test]
fn close_client_reports_whether_peer_existed() {
    let reactor = reactor();
    let proxy =
        DatagramProxy::open_new(&reactor, DatagramProxyConfig::new(localhost(), echo_backend()))
            .unwrap();

    let client = client();
    let addr = client.local_addr().unwrap();
    exchange(&client, &proxy, b"hi");

    assert!(proxy.close_client(addr).unwrap());
    assert!(!proxy.close_client(addr).unwrap());
    assert!(proxy.client_meters(addr).unwrap().is_none());

    // A new datagram recreates the relay.
    assert_eq!(exchange(&client, &proxy, b"again"), b"again");
    assert_eq!(proxy.clients().unwrap(), vec![addr]);
}

#[test]
fn rejected_peer_gets_no_relay() {
    let reactor = reactor();
    let config = DatagramProxyConfig::new(localhost(), echo_backend())
        .with_admission(Arc::new(|_: SocketAddr| false));
    let proxy = DatagramProxy::open_new(&reactor, config).unwrap();

    let client = client();
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    client.send_to(b"nope", proxy.local_addr().unwrap()).unwrap();

    let mut buf = [0u8; 16];
    let err = client.recv_from(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut));
    assert!(proxy.clients().unwrap().is_empty());
    assert_eq!(proxy.inner_packet_meters().read.total_count(), 1);
}

#[test]
fn freeze_defers_datagrams() {
    let reactor = reactor();
    let proxy =
        DatagramProxy::open_new(&reactor, DatagramProxyConfig::new(localhost(), echo_backend()))
            .unwrap();
    let client = client();
    exchange(&client, &proxy, b"warm");

    proxy.freeze().unwrap();
    assert!(matches!(proxy.freeze(), Err(Error::InvalidState { .. })));
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    client.send_to(b"held", proxy.local_addr().unwrap()).unwrap();
    let mut buf = [0u8; 16];
    assert!(client.recv_from(&mut buf).is_err());

    proxy.unfreeze().unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"held");

    proxy.close();
    proxy.close();
    assert!(!proxy.is_open());
    assert!(matches!(proxy.reopen(), Err(Error::InvalidState { .. })));
}

#[test]
fn active_peer_survives_idle_sweep() {
    let reactor = reactor();
    let (deleted_tx, deleted_rx) = channel::unbounded::<SocketAddr>();
    let config = DatagramProxyConfig::new(localhost(), echo_backend())
        .with_max_idle(Duration::from_millis(200))
        .with_on_client_deleted(Arc::new(move |addr: SocketAddr, _: &DatagramMeters| {
            let _ = deleted_tx.send(addr);
        }));
    let proxy = DatagramProxy::open_new(&reactor, config).unwrap();

    let idle = client();
    let active = client();
    exchange(&idle, &proxy, b"idle");
    exchange(&active, &proxy, b"active");

    let until = Instant::now() + Duration::from_millis(400);
    while Instant::now() < until {
        assert_eq!(exchange(&active, &proxy, b"tick"), b"tick");
        thread::sleep(Duration::from_millis(50));
    }

    // A new peer triggers the sweep.
    let newcomer = client();
    exchange(&newcomer, &proxy, b"new");

    assert_eq!(deleted_rx.recv_timeout(TIMEOUT).unwrap(), idle.local_addr().unwrap());
    assert!(deleted_rx.try_recv().is_err());

    let mut peers = proxy.clients().unwrap();
    peers.sort();
    let mut expected = vec![active.local_addr().unwrap(), newcomer.local_addr().unwrap()];
    expected.sort();
    assert_eq!(peers, expected);

    let before = proxy
        .client_packet_meters(active.local_addr().unwrap())
        .unwrap()
        .unwrap()
        .sent
        .total_count();
    assert_eq!(exchange(&active, &proxy, b"still here"), b"still here");
    let after = proxy
        .client_packet_meters(active.local_addr().unwrap())
        .unwrap()
        .unwrap()
        .sent
        .total_count();
    assert_eq!(after, before + 1);
}

#[test]
fn empty_pending_limit_is_rejected_at_open() {
    let reactor = reactor();
    let config = DatagramProxyConfig::new(localhost(), echo_backend()).with_pending_limit(0);
    let proxy = DatagramProxy::new(&reactor, config);
    assert!(matches!(proxy.open(), Err(Error::InvalidConfig(_))));
    assert_eq!(proxy.state(), ProxyState::Closed);
    assert!(reactor.is_open());
}

#[test]
fn close_from_listener_unbinds_socket() {
    let reactor = reactor();
    let slot: Arc<OnceLock<Weak<DatagramProxy>>> = Arc::new(OnceLock::new());
    let (state_tx, state_rx) = channel::bounded(1);

    let listener_slot = Arc::clone(&slot);
    let config = DatagramProxyConfig::new(localhost(), echo_backend()).with_on_client_created(
        Arc::new(move |_: SocketAddr| {
            if let Some(proxy) = listener_slot.get().and_then(Weak::upgrade) {
                proxy.close();
                let _ = state_tx.try_send(proxy.state());
            }
        }),
    );
    let proxy = Arc::new(DatagramProxy::open_new(&reactor, config).unwrap());
    slot.set(Arc::downgrade(&proxy)).unwrap();
    let addr = proxy.local_addr().unwrap();

    let client = client();
    client.send_to(b"first", addr).unwrap();
    assert_eq!(state_rx.recv_timeout(TIMEOUT).unwrap(), ProxyState::Closed);

    // The port is free again once the relay is torn down.
    assert!(eventually(|| UdpSocket::bind(addr).is_ok()));
    assert!(proxy.clients().unwrap().is_empty());
    assert_eq!(proxy.local_addr(), None);
}
