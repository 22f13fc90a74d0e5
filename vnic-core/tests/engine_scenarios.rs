use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vnic_core::frame::build_frame;
use vnic_core::{
    ChannelFlags, DlError, DlState, DlsapAddr, Endpoint, Engine, EngineConfig, EngineError,
    EtherHeader, Ioctl, MacAddr, Primitive, Request, Upstream,
};

const ADDR: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const PEER: MacAddr = MacAddr::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
const OTHER: MacAddr = MacAddr::new([0x02, 0x99, 0x99, 0x99, 0x99, 0x99]);
const MCAST: MacAddr = MacAddr::new([0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb]);

fn engine_with(config: EngineConfig) -> Arc<Engine> {
    let engine = Engine::new(config);
    engine
        .create_instance_with_addr(0, ADDR)
        .expect("create instance");
    engine
}

fn engine() -> Arc<Engine> {
    engine_with(EngineConfig::default())
}

fn frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Bytes {
    build_frame(&EtherHeader::new(dst, src, ethertype), payload)
}

/// Open a channel, attach it to instance 0 and optionally bind it.
/// Acknowledgments are consumed.
fn consumer(engine: &Arc<Engine>, sap: Option<u16>, flags: ChannelFlags) -> Endpoint {
    let ep = engine.open();
    ep.request(Request::Attach { ppa: 0 }).expect("attach");
    if let Some(sap) = sap {
        ep.request(Request::Bind { sap }).expect("bind");
    }
    if flags.contains(ChannelFlags::PROMISC) {
        ep.request(Request::PromiscOn).expect("promisc");
    }
    if flags.contains(ChannelFlags::RAW) {
        ep.ioctl(Ioctl::Raw).expect("raw");
    }
    if flags.contains(ChannelFlags::SERVICE) {
        ep.ioctl(Ioctl::RegisterBridge).expect("register");
    }
    for msg in ep.drain() {
        assert!(msg.error().is_none(), "setup failed: {:?}", msg);
    }
    ep
}

fn data_count(ep: &Endpoint) -> usize {
    ep.drain().into_iter().filter(Upstream::is_data).count()
}

#[test]
fn test_concrete_scenario() {
    let engine = engine();
    let a = consumer(&engine, Some(0x0800), ChannelFlags::empty());
    let b = consumer(&engine, Some(0), ChannelFlags::PROMISC);

    let from_peer = frame(MacAddr::BROADCAST, PEER, 0x0800, b"ip datagram");
    assert_eq!(engine.receive(0, from_peer).expect("receive"), 2);

    let msgs = a.drain();
    assert_eq!(msgs.len(), 1);
    let Upstream::UnitData(ind) = &msgs[0] else {
        panic!("expected an indication, got {:?}", msgs[0]);
    };
    assert_eq!(&ind.payload[..], b"ip datagram");
    assert_eq!(ind.src, DlsapAddr::new(PEER, 0x0800));
    assert_eq!(data_count(&b), 1);

    // self-sourced: the key-matching channel is excluded, the promiscuous
    // key-0 channel still sees it
    let from_self = frame(MacAddr::BROADCAST, ADDR, 0x0800, b"looped");
    assert_eq!(engine.receive(0, from_self).expect("receive"), 1);
    assert_eq!(data_count(&a), 0);
    assert_eq!(data_count(&b), 1);
}

#[test]
fn test_each_eligible_channel_gets_exactly_one_copy() {
    let engine = engine();
    let ip = consumer(&engine, Some(0x0800), ChannelFlags::empty());
    let arp = consumer(&engine, Some(0x0806), ChannelFlags::empty());
    let llc = consumer(&engine, Some(0), ChannelFlags::empty());
    let sniffer = consumer(&engine, Some(0), ChannelFlags::PROMISC | ChannelFlags::RAW);
    let bridge = consumer(
        &engine,
        None,
        ChannelFlags::RAW | ChannelFlags::SERVICE | ChannelFlags::PROMISC,
    );

    // (frame, ip, arp, llc, sniffer)
    let cases = [
        (frame(ADDR, PEER, 0x0800, b"unicast ip"), 1, 0, 0, 1),
        (frame(MacAddr::BROADCAST, PEER, 0x0806, b"arp who-has"), 0, 1, 0, 1),
        (frame(MCAST, PEER, 0x0800, b"mdns"), 1, 0, 0, 1),
        (frame(OTHER, PEER, 0x0800, b"not for us"), 0, 0, 0, 1),
        (frame(ADDR, PEER, 100, b"802.3"), 0, 0, 1, 1),
        (frame(ADDR, PEER, 0x86dd, b"ipv6"), 0, 0, 0, 1),
    ];

    for (f, want_ip, want_arp, want_llc, want_sniffer) in cases {
        engine.receive(0, f.clone()).expect("receive");
        assert_eq!(data_count(&ip), want_ip, "ip for {:?}", &f[..14]);
        assert_eq!(data_count(&arp), want_arp, "arp for {:?}", &f[..14]);
        assert_eq!(data_count(&llc), want_llc, "llc for {:?}", &f[..14]);
        assert_eq!(data_count(&sniffer), want_sniffer, "sniffer for {:?}", &f[..14]);
        assert!(bridge.drain().is_empty(), "bridge got fan-out traffic");
    }
}

#[test]
fn test_raw_channel_gets_exact_frame() {
    let engine = engine();
    let raw = consumer(&engine, Some(0x0800), ChannelFlags::RAW);
    let f = frame(ADDR, PEER, 0x0800, b"exact");
    engine.receive(0, f.clone()).expect("receive");
    assert_eq!(raw.drain(), vec![Upstream::Frame(f)]);
}

#[test]
fn test_broadcast_reaches_every_matching_channel() {
    let engine = engine();
    let consumers: Vec<_> = (0..5)
        .map(|_| consumer(&engine, Some(0x0806), ChannelFlags::empty()))
        .collect();
    let bridge = consumer(&engine, None, ChannelFlags::RAW | ChannelFlags::SERVICE);

    let delivered = engine
        .receive(0, frame(MacAddr::BROADCAST, PEER, 0x0806, b"arp"))
        .expect("receive");
    assert_eq!(delivered, 5);
    for ep in &consumers {
        assert_eq!(data_count(ep), 1);
    }
    assert!(bridge.drain().is_empty());

    // unless the frame is our own
    engine
        .receive(0, frame(MCAST, ADDR, 0x0806, b"arp"))
        .expect("receive");
    for ep in &consumers {
        assert_eq!(data_count(ep), 0);
    }
}

#[test]
fn test_out_of_state_requests_never_mutate() {
    let engine = engine();
    let ep = engine.open();

    ep.request(Request::Bind { sap: 0x0800 }).expect("bind");
    assert_eq!(
        ep.try_read(),
        Some(Upstream::ErrorAck {
            primitive: Primitive::BindReq,
            error: DlError::OutState
        })
    );
    assert_eq!(ep.status().state, DlState::Unattached);
    assert_eq!(ep.status().sap, 0);

    ep.request(Request::Attach { ppa: 0 }).expect("attach");
    ep.drain();
    ep.request(Request::UnitData {
        dest: DlsapAddr::new(PEER, 0x0800),
        payload: Bytes::from_static(b"too early"),
    })
    .expect("send");
    assert_eq!(ep.try_read().and_then(|m| m.error()), Some(DlError::OutState));
    assert_eq!(ep.status().state, DlState::Unbound);
    assert_eq!(engine.run_pending(), 0);
}

#[test]
fn test_attach_to_missing_instance() {
    let engine = engine();
    let ep = engine.open();
    ep.request(Request::Attach { ppa: 7 }).expect("attach");
    assert_eq!(
        ep.try_read(),
        Some(Upstream::ErrorAck {
            primitive: Primitive::AttachReq,
            error: DlError::BadPpa
        })
    );
    assert_eq!(ep.status().state, DlState::Unattached);
    assert_eq!(ep.status().ppa, None);
}

#[test]
fn test_destroy_instance_busy_until_detached() {
    let engine = engine();
    let a = consumer(&engine, Some(0x0800), ChannelFlags::empty());
    let b = consumer(&engine, None, ChannelFlags::empty());

    assert!(matches!(
        engine.destroy_instance(0),
        Err(EngineError::Instance(_))
    ));

    a.request(Request::Unbind).expect("unbind");
    a.request(Request::Detach).expect("detach");
    assert!(a.drain().iter().all(|m| m.error().is_none()));
    assert!(engine.destroy_instance(0).is_err());

    b.close().expect("close");
    engine.destroy_instance(0).expect("destroy");
    assert_eq!(engine.instance_addr(0), None);
}

#[test]
fn test_identifier_reuse() {
    let engine = engine();
    let eps: Vec<_> = (0..4).map(|_| engine.open()).collect();
    let ids: Vec<_> = eps.iter().map(Endpoint::id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);

    let mut eps = eps.into_iter();
    let _e0 = eps.next();
    let e1 = eps.next().expect("e1");
    let e2 = eps.next().expect("e2");
    let _e3 = eps.next();

    e2.close().expect("close 2");
    assert_eq!(engine.open().id(), 2);
    // the previous open was dropped and closed again
    e1.close().expect("close 1");
    let reopened = engine.open();
    assert_eq!(reopened.id(), 1);
    assert_eq!(engine.open().id(), 2);
}

#[test]
fn test_bridge_never_receives_fan_out() {
    let engine = engine();
    let bridge = consumer(
        &engine,
        None,
        ChannelFlags::PROMISC | ChannelFlags::RAW | ChannelFlags::SERVICE,
    );
    for f in [
        frame(MacAddr::BROADCAST, PEER, 0x0800, b"a"),
        frame(ADDR, PEER, 60, b"b"),
        frame(MCAST, ADDR, 0x0806, b"c"),
    ] {
        engine.receive(0, f).expect("receive");
    }
    assert!(bridge.drain().is_empty());
    assert_eq!(engine.stats().delivered, 0);
}

#[test]
fn test_outbound_loopback_and_bridge_forwarding() {
    let engine = engine();
    let bridge = consumer(&engine, None, ChannelFlags::RAW | ChannelFlags::SERVICE);
    let ip = consumer(&engine, Some(0x0800), ChannelFlags::empty());
    let ip2 = consumer(&engine, Some(0x0800), ChannelFlags::empty());
    let sniffer = consumer(&engine, Some(0), ChannelFlags::PROMISC);

    ip.request(Request::UnitData {
        dest: DlsapAddr::new(MacAddr::BROADCAST, 0x0800),
        payload: Bytes::from_static(b"hello"),
    })
    .expect("send");
    assert_eq!(engine.run_pending(), 1);

    // own transmissions are not looped back to key-matching channels
    assert_eq!(data_count(&ip), 0);
    assert_eq!(data_count(&ip2), 0);
    assert_eq!(data_count(&sniffer), 1);

    let Some(Upstream::Frame(sent)) = bridge.try_read() else {
        panic!("bridge did not receive the frame");
    };
    assert_eq!(
        EtherHeader::parse(&sent).expect("parse"),
        EtherHeader::new(MacAddr::BROADCAST, ADDR, 0x0800)
    );
    assert_eq!(&sent[14..], b"hello");
}

#[test]
fn test_frames_from_bridge_are_not_echoed() {
    let engine = engine();
    let bridge = consumer(&engine, None, ChannelFlags::RAW | ChannelFlags::SERVICE);
    let ip = consumer(&engine, Some(0x0800), ChannelFlags::empty());

    bridge
        .send_frame(frame(ADDR, PEER, 0x0800, b"from hub"))
        .expect("write");
    assert_eq!(engine.run_pending(), 1);

    assert_eq!(data_count(&ip), 1);
    assert!(bridge.drain().is_empty());
    assert_eq!(engine.stats().bridge_forwarded, 0);
}

#[test]
fn test_link_down_counted_until_bridge_registers() {
    let engine = engine();
    let ip = consumer(&engine, Some(0x0800), ChannelFlags::empty());
    for _ in 0..3 {
        ip.request(Request::UnitData {
            dest: DlsapAddr::new(PEER, 0x0800),
            payload: Bytes::from_static(b"lost"),
        })
        .expect("send");
    }
    assert_eq!(engine.run_pending(), 3);
    assert_eq!(engine.link_warnings(0), Some(3));
    assert_eq!(engine.stats().bridge_dropped, 3);

    let _bridge = consumer(&engine, None, ChannelFlags::RAW | ChannelFlags::SERVICE);
    assert_eq!(engine.link_warnings(0), Some(0));
}

#[test]
fn test_backpressure_skips_only_full_recipient() {
    let engine = engine_with(EngineConfig {
        recv_hiwat: 200,
        ..EngineConfig::default()
    });
    let slow = consumer(&engine, Some(0x0800), ChannelFlags::RAW);
    let fast = consumer(&engine, Some(0x0800), ChannelFlags::RAW);

    let f = frame(ADDR, PEER, 0x0800, &[0u8; 100]);
    for _ in 0..4 {
        engine.receive(0, f.clone()).expect("receive");
        // the fast consumer keeps up
        assert_eq!(data_count(&fast), 1);
    }

    // 114 bytes queued is below the mark, 228 is not
    assert_eq!(data_count(&slow), 2);
    assert_eq!(engine.stats().skipped_backpressure, 2);
}

#[test]
fn test_exhaustion_skips_one_delivery_and_continues() {
    let engine = engine_with(EngineConfig {
        message_budget: 150,
        ..EngineConfig::default()
    });
    let first = consumer(&engine, Some(0x0800), ChannelFlags::RAW);
    let second = consumer(&engine, Some(0x0800), ChannelFlags::RAW);
    let small = consumer(&engine, Some(0x0806), ChannelFlags::RAW);

    engine
        .receive(0, frame(ADDR, PEER, 0x0800, &[0u8; 100]))
        .expect("receive");
    assert_eq!(engine.stats().delivered, 1);
    assert_eq!(engine.stats().skipped_exhausted, 1);

    // the budget still has room for a small frame
    engine
        .receive(0, frame(ADDR, PEER, 0x0806, &[0u8; 10]))
        .expect("receive");
    assert_eq!(data_count(&small), 1);

    assert_eq!(data_count(&first) + data_count(&second), 1);
    assert_eq!(engine.budget_used(), 0);
}

#[test]
fn test_exhausted_info_request_gets_no_reply() {
    let engine = engine_with(EngineConfig {
        message_budget: 0,
        ..EngineConfig::default()
    });
    let ep = engine.open();
    ep.request(Request::Info).expect("info");
    assert!(ep.try_read().is_none());
    assert_eq!(engine.stats().acks_dropped, 1);

    // ok acks need no buffer
    ep.request(Request::Attach { ppa: 0 }).expect("attach");
    assert_eq!(ep.try_read(), Some(Upstream::OkAck(Primitive::AttachReq)));
}

#[test]
fn test_concurrent_open_close_during_fan_out() {
    let engine = engine();
    let sniffer = consumer(&engine, Some(0), ChannelFlags::PROMISC | ChannelFlags::RAW);
    let stop = Arc::new(AtomicBool::new(false));

    let receiver = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let f = frame(MacAddr::BROADCAST, PEER, 0x0806, b"storm");
            while !stop.load(Ordering::Relaxed) {
                engine.receive(0, f.clone()).expect("receive");
            }
        })
    };

    let churners: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..200 {
                    let ep = consumer(&engine, Some(0x0806), ChannelFlags::RAW);
                    ep.drain();
                    ep.close().expect("close");
                }
            })
        })
        .collect();

    for churner in churners {
        churner.join().expect("churner panicked");
    }
    stop.store(true, Ordering::Relaxed);
    receiver.join().expect("receiver panicked");

    assert_eq!(engine.channel_count(), 1);
    assert_eq!(engine.members(0), vec![sniffer.id()]);
    sniffer.drain();
    assert_eq!(engine.budget_used(), 0);
}

#[test]
fn test_service_worker_end_to_end() {
    let engine = engine();
    let _worker = engine.spawn_service_worker().expect("spawn worker");
    let bridge = consumer(&engine, None, ChannelFlags::RAW | ChannelFlags::SERVICE);
    let arp = consumer(&engine, Some(0x0806), ChannelFlags::empty());

    arp.request(Request::UnitData {
        dest: DlsapAddr::new(MacAddr::BROADCAST, 0x0806),
        payload: Bytes::from_static(b"who-has"),
    })
    .expect("send");

    let got = bridge.read_timeout(Duration::from_secs(5));
    assert!(matches!(got, Some(Upstream::Frame(f)) if &f[14..] == b"who-has"));
}
