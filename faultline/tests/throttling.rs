//! Wall-clock throughput tests. Run serially so they do not compete for
//! CPU with each other.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use serial_test::serial;

use faultline::throttle::{ByteRateThrottler, DelayThrottler, PacketRateThrottler, Throttler};
use faultline::{
    DatagramProxy, DatagramProxyConfig, Reactor, ReactorConfig, TcpProxy, TcpProxyConfig,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Counts bytes on one connection until end of stream.
fn counting_backend() -> (SocketAddr, channel::Receiver<(usize, Instant)>) {
    let listener = TcpListener::bind(localhost()).unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = channel::bounded(1);
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
            total += n;
        }
        let _ = tx.send((total, Instant::now()));
    });
    (addr, rx)
}

fn udp_echo_backend() -> SocketAddr {
    let socket = UdpSocket::bind(localhost()).unwrap();
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], from);
        }
    });
    addr
}

#[test]
#[serial]
fn outgoing_byte_rate_is_enforced() {
    const RATE: u64 = 500_000;
    const LEN: usize = 1_000_000;

    faultline::init_tracing();
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let (backend, done) = counting_backend();
    let config = TcpProxyConfig::new(localhost(), backend).with_outgoing_throttler(Arc::new(
        |_: SocketAddr| Box::new(ByteRateThrottler::per_second(RATE)) as Box<dyn Throttler>,
    ));
    let proxy = TcpProxy::open_new(&reactor, config).unwrap();

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy.local_addr().unwrap()).unwrap();
    client.write_all(&vec![7u8; LEN]).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (total, finished) = done.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(total, LEN);

    let rate = LEN as f64 / finished.duration_since(started).as_secs_f64();
    let expected = RATE as f64;
    assert!(
        (rate - expected).abs() / expected < 0.05,
        "measured {rate:.0} B/s, expected {expected:.0} B/s"
    );
}

#[test]
#[serial]
fn delay_throttler_postpones_datagrams() {
    const DELAY: Duration = Duration::from_millis(200);

    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let config = DatagramProxyConfig::new(localhost(), udp_echo_backend()).with_outgoing_throttler(
        Arc::new(|_: SocketAddr| Box::new(DelayThrottler::new(DELAY)) as Box<dyn Throttler>),
    );
    let proxy = DatagramProxy::open_new(&reactor, config).unwrap();

    let client = UdpSocket::bind(localhost()).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let started = Instant::now();
    client.send_to(b"late", proxy.local_addr().unwrap()).unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"late");
    let elapsed = started.elapsed();
    assert!(elapsed >= DELAY, "reply after {elapsed:?}");
    assert!(elapsed < DELAY * 3, "reply after {elapsed:?}");
}

#[test]
#[serial]
fn incoming_packet_rate_is_enforced() {
    const RATE: u64 = 50;
    const COUNT: usize = 100;

    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let config = DatagramProxyConfig::new(localhost(), udp_echo_backend()).with_incoming_throttler(
        Arc::new(|_: SocketAddr| Box::new(PacketRateThrottler::per_second(RATE)) as Box<dyn Throttler>),
    );
    let proxy = DatagramProxy::open_new(&reactor, config).unwrap();

    let client = UdpSocket::bind(localhost()).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let target = proxy.local_addr().unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 16];
    for i in 0..COUNT {
        client.send_to(&[i as u8], target).unwrap();
        // Pace the sender so no datagram is lost to socket buffers.
        thread::sleep(Duration::from_millis(1));
    }
    for _ in 0..COUNT {
        client.recv_from(&mut buf).unwrap();
    }

    let rate = COUNT as f64 / started.elapsed().as_secs_f64();
    let expected = RATE as f64;
    assert!(
        (rate - expected).abs() / expected < 0.05,
        "measured {rate:.1} pkt/s, expected {expected:.1} pkt/s"
    );
}
