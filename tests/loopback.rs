//! End-to-end tests over real loopback TCP sockets.
//!
//! Each test starts its own relay on a free port and connects
//! `Communication` endpoints to it.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use packet_bus::socket::mock::wait_until;
use packet_bus::{AckStatus, BusConfig, BusManager, Communication, OsSocket};

const WAIT: Duration = Duration::from_secs(5);

type Inbox = mpsc::Receiver<(u32, Vec<u8>)>;

fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

fn config(ack_enabled: bool) -> BusConfig {
    BusConfig {
        port: free_port(),
        ack_enabled,
        ..BusConfig::default()
    }
}

fn start_relay(config: &BusConfig) -> Arc<BusManager> {
    let bus = BusManager::new(config, Arc::new(OsSocket::new()));
    bus.start().unwrap();
    bus
}

fn node(config: &BusConfig, id: u32) -> (Arc<Communication>, Inbox) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let comm = Communication::new(
        config,
        Arc::new(OsSocket::new()),
        id,
        Arc::new(move |src, data| {
            let _ = tx.lock().unwrap().send((src, data));
        }),
    );
    comm.start_connection().unwrap();
    (comm, rx)
}

fn wait_for_ids(bus: &BusManager, ids: &[u32]) {
    assert!(
        wait_until(WAIT, || bus.server().connected_ids() == ids),
        "peers never registered: {:?}",
        bus.server().connected_ids()
    );
}

#[test]
fn unicast_message_crosses_the_relay() {
    let config = config(false);
    let bus = start_relay(&config);
    let (five, five_inbox) = node(&config, 5);
    let (_eight, eight_inbox) = node(&config, 8);
    wait_for_ids(&bus, &[5, 8]);

    let data: Vec<u8> = (0..20).collect();
    five.send_message(&data, 8, false).unwrap();

    assert_eq!(eight_inbox.recv_timeout(WAIT).unwrap(), (5, data));
    assert!(five_inbox.recv_timeout(Duration::from_millis(200)).is_err());
    bus.stop().unwrap();
}

#[test]
fn broadcast_reaches_every_endpoint() {
    let config = config(false);
    let bus = start_relay(&config);
    let (one, one_inbox) = node(&config, 1);
    let (_two, two_inbox) = node(&config, 2);
    let (_three, three_inbox) = node(&config, 3);
    wait_for_ids(&bus, &[1, 2, 3]);

    let text = b"a broadcast longer than one packet".to_vec();
    one.send_message(&text, 0, true).unwrap();

    for inbox in [&one_inbox, &two_inbox, &three_inbox] {
        assert_eq!(inbox.recv_timeout(WAIT).unwrap(), (1, text.clone()));
    }
    bus.stop().unwrap();
}

#[test]
fn large_message_survives_fragmentation() {
    let config = config(false);
    let bus = start_relay(&config);
    let (sender, _) = node(&config, 10);
    let (_receiver, inbox) = node(&config, 20);
    wait_for_ids(&bus, &[10, 20]);

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    sender.send_message(&data, 20, false).unwrap();

    assert_eq!(inbox.recv_timeout(WAIT).unwrap(), (10, data));
    bus.stop().unwrap();
}

#[test]
fn ack_mode_acknowledges_unicast() {
    let config = config(true);
    let bus = start_relay(&config);
    let (five, _) = node(&config, 5);
    let (_eight, eight_inbox) = node(&config, 8);
    wait_for_ids(&bus, &[5, 8]);

    let (tx, acks) = mpsc::channel();
    let tx = Mutex::new(tx);
    five.set_ack_callback(Arc::new(move |src, status| {
        let _ = tx.lock().unwrap().send((src, status));
    }));

    five.send_message(b"ack me", 8, false).unwrap();
    assert_eq!(eight_inbox.recv_timeout(WAIT).unwrap(), (5, b"ack me".to_vec()));
    assert_eq!(acks.recv_timeout(WAIT).unwrap(), (8, AckStatus::Ack));
    bus.stop().unwrap();
}

#[test]
fn disconnect_removes_peer_from_registry() {
    let config = config(false);
    let bus = start_relay(&config);
    let (five, _) = node(&config, 5);
    let (_eight, _) = node(&config, 8);
    wait_for_ids(&bus, &[5, 8]);

    five.close_connection().unwrap();
    wait_for_ids(&bus, &[8]);
    assert_eq!(bus.server().client_count(), 1);
    bus.stop().unwrap();
}

#[test]
fn relay_stop_disconnects_endpoints() {
    let config = config(false);
    let bus = start_relay(&config);
    let (node, _) = node(&config, 7);
    wait_for_ids(&bus, &[7]);

    bus.stop().unwrap();
    bus.stop().unwrap();

    assert!(wait_until(WAIT, || !node.is_connected()));
    assert!(!bus.server().is_running());
}
