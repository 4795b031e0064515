//! End-to-end tests: two session runtimes cross-wired through an in-memory
//! link that can drop or duplicate datagrams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};

use rill::{
    ConnectionRegistry, FecConfig, OutputSink, SessionConfig, SessionHandle, SessionListener,
    SessionRuntime,
};

/// Feeds datagrams into the peer's input path, optionally dropping every
/// n-th one or duplicating each one.
struct LinkSink {
    peer: Arc<Mutex<Option<SessionHandle>>>,
    drop_every: usize,
    duplicate: bool,
    counter: usize,
}

impl LinkSink {
    fn new(peer: Arc<Mutex<Option<SessionHandle>>>, drop_every: usize, duplicate: bool) -> Self {
        LinkSink {
            peer,
            drop_every,
            duplicate,
            counter: 0,
        }
    }
}

impl OutputSink for LinkSink {
    fn send(&mut self, datagram: BytesMut) {
        self.counter += 1;
        if self.drop_every > 0 && self.counter % self.drop_every == 0 {
            return;
        }
        if let Some(peer) = self.peer.lock().unwrap().as_ref() {
            let datagram = datagram.freeze();
            if self.duplicate {
                peer.input(datagram.clone());
            }
            peer.input(datagram);
        }
    }
}

struct ChannelListener {
    data_tx: Sender<Bytes>,
    closed_tx: Sender<u32>,
}

impl SessionListener for ChannelListener {
    fn on_data(&mut self, _conv: u32, payload: Bytes) {
        let _ = self.data_tx.send(payload);
    }
    fn on_closed(&mut self, conv: u32) {
        let _ = self.closed_tx.send(conv);
    }
}

#[derive(Default)]
struct CountingRegistry(Mutex<Vec<u32>>);

impl ConnectionRegistry for CountingRegistry {
    fn deregister(&self, conv: u32) {
        self.0.lock().unwrap().push(conv);
    }
}

struct Peer {
    runtime: SessionRuntime,
    data: Receiver<Bytes>,
    closed: Receiver<u32>,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two runtimes wired back-to-back. `drop_every` and `duplicate` shape the
/// link in both directions.
fn pair(cfg: SessionConfig, drop_every: usize, duplicate: bool) -> (Peer, Peer) {
    init_logging();
    let slot_a: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(None));
    let slot_b: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(None));

    let mut peers = Vec::new();
    for peer_slot in [Arc::clone(&slot_b), Arc::clone(&slot_a)] {
        let (data_tx, data_rx) = crossbeam_channel::unbounded();
        let (closed_tx, closed_rx) = crossbeam_channel::unbounded();
        let runtime = SessionRuntime::spawn(
            cfg.clone(),
            Box::new(ChannelListener { data_tx, closed_tx }),
            None,
            Box::new(LinkSink::new(peer_slot, drop_every, duplicate)),
        )
        .unwrap();
        peers.push(Peer {
            runtime,
            data: data_rx,
            closed: closed_rx,
        });
    }
    let b = peers.pop().unwrap();
    let a = peers.pop().unwrap();
    *slot_a.lock().unwrap() = Some(a.runtime.handle());
    *slot_b.lock().unwrap() = Some(b.runtime.handle());
    (a, b)
}

const RECV_WAIT: Duration = Duration::from_secs(10);

#[test]
fn fragmented_message_reassembles() {
    let cfg = SessionConfig {
        mtu: 1400,
        ..SessionConfig::turbo(42)
    };
    let (a, b) = pair(cfg, 0, false);

    let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    a.runtime.handle().write(Bytes::from(payload.clone())).unwrap();

    let got = b.data.recv_timeout(RECV_WAIT).unwrap();
    assert_eq!(got.len(), 3000);
    assert_eq!(got.as_ref(), &payload[..]);

    // 3000 bytes at this MTU cannot fit in fewer than three segments.
    assert!(a.runtime.handle().metrics().segments_out >= 3);
}

#[test]
fn bulk_transfer_survives_datagram_loss() {
    let (a, b) = pair(SessionConfig::turbo(7), 4, false);

    let sent: Vec<Bytes> = (0..50u8)
        .map(|i| Bytes::from(vec![i; 200 + i as usize]))
        .collect();
    for msg in &sent {
        a.runtime.handle().write(msg.clone()).unwrap();
    }

    for expected in &sent {
        let got = b.data.recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(&got, expected, "messages must arrive intact and in order");
    }
    assert!(
        a.runtime.handle().metrics().retransmits > 0,
        "a lossy link must have forced retransmissions"
    );
}

#[test]
fn fec_pair_delivers_under_loss() {
    let cfg = SessionConfig {
        fec: Some(FecConfig::new(10, 3)),
        ..SessionConfig::turbo(99)
    };
    let (a, b) = pair(cfg, 8, false);

    let sent: Vec<Bytes> = (0..100u8).map(|i| Bytes::from(vec![i; 64])).collect();
    for msg in &sent {
        a.runtime.handle().write(msg.clone()).unwrap();
    }
    for expected in &sent {
        let got = b.data.recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(&got, expected);
    }
    assert!(a.runtime.handle().metrics().parity_shards_sent > 0);
}

#[test]
fn duplicated_datagrams_deliver_once() {
    let (a, b) = pair(SessionConfig::turbo(13), 0, true);

    for i in 0..20u8 {
        a.runtime.handle().write(Bytes::from(vec![i; 32])).unwrap();
    }
    for i in 0..20u8 {
        let got = b.data.recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(got.as_ref(), &vec![i; 32][..]);
    }
    assert!(
        b.data.recv_timeout(Duration::from_millis(200)).is_err(),
        "duplicates must not surface as extra messages"
    );
    assert!(b.runtime.handle().metrics().duplicate_segments > 0);
}

#[test]
fn stream_mode_preserves_byte_order() {
    let cfg = SessionConfig {
        stream: true,
        ..SessionConfig::turbo(21)
    };
    let (a, b) = pair(cfg, 0, false);

    let mut expected = Vec::new();
    for i in 0..10u8 {
        let chunk = vec![i; 100];
        expected.extend_from_slice(&chunk);
        a.runtime.handle().write(Bytes::from(chunk)).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < expected.len() {
        let got = b.data.recv_timeout(RECV_WAIT).unwrap();
        received.extend_from_slice(&got);
    }
    assert_eq!(received, expected, "stream bytes must arrive in write order");
}

#[test]
fn close_notifies_exactly_once_and_deregisters() {
    init_logging();
    let registry = Arc::new(CountingRegistry::default());
    let slot: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(None));
    let (data_tx, _data_rx) = crossbeam_channel::unbounded();
    let (closed_tx, closed_rx) = crossbeam_channel::unbounded();

    let mut rt = SessionRuntime::spawn(
        SessionConfig::turbo(55),
        Box::new(ChannelListener { data_tx, closed_tx }),
        Some(Arc::clone(&registry) as Arc<dyn ConnectionRegistry>),
        Box::new(LinkSink::new(slot, 0, false)),
    )
    .unwrap();
    let handle = rt.handle();

    rt.shutdown();
    rt.shutdown();
    handle.close();

    assert_eq!(closed_rx.recv_timeout(RECV_WAIT).unwrap(), 55);
    assert!(
        closed_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "close callback must fire exactly once"
    );
    assert_eq!(registry.0.lock().unwrap().as_slice(), &[55]);
    assert!(handle.write(Bytes::from_static(b"late")).is_err());
}

#[test]
fn idle_peer_times_out() {
    init_logging();
    let cfg = SessionConfig {
        timeout_ms: 300,
        ..SessionConfig::turbo(77)
    };
    let slot: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(None));
    let (data_tx, _data_rx) = crossbeam_channel::unbounded();
    let (closed_tx, closed_rx) = crossbeam_channel::unbounded();

    let _rt = SessionRuntime::spawn(
        cfg,
        Box::new(ChannelListener { data_tx, closed_tx }),
        None,
        Box::new(LinkSink::new(slot, 0, false)),
    )
    .unwrap();

    assert_eq!(closed_rx.recv_timeout(RECV_WAIT).unwrap(), 77);
}
