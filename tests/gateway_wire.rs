//! End-to-end wire scenarios: scripted byte input against a host reactor,
//! asserting the exact response bytes, plus the user-side protocol flow.

use std::sync::{Arc, Mutex};

use emc_core::{
    Command, DeviceDriver, DeviceFlags, Emitter, EmcConfig, Gateway, GatewayOptions, Mapper,
    Reactor, Ring, Role, Status, Stream,
};

type PacketLog = Arc<Mutex<Vec<(u8, Vec<u8>)>>>;

struct TestDriver {
    packets: PacketLog,
}

impl DeviceDriver for TestDriver {
    fn type_name(&self) -> &'static str {
        "test"
    }

    fn open(&mut self, _stream: &mut Stream, _args: &Command<'_>, _out: &mut Emitter) -> Status {
        Status::Okay
    }

    fn packet(&mut self, stream: &Stream, data: &[u8], _out: &mut Emitter) -> Status {
        self.packets
            .lock()
            .unwrap()
            .push((stream.channel, data.to_vec()));
        Status::Okay
    }
}

fn rw_flags() -> DeviceFlags {
    DeviceFlags {
        recv: true,
        send: true,
        ..DeviceFlags::default()
    }
}

/// A resumed, joined host reactor named `emc-test` with one unlimited
/// device `foo`. The join-time sync dump is discarded.
fn host_reactor() -> (Reactor, PacketLog) {
    let mut reactor = Reactor::new(Role::Host, Ring::Process).with_identity("emc-test", "generic");
    reactor
        .attach(Box::new(Gateway::new(
            &EmcConfig::default(),
            GatewayOptions::default(),
        )))
        .unwrap();
    let packets: PacketLog = Arc::new(Mutex::new(Vec::new()));
    let mut mapper = Mapper::new();
    mapper
        .register_device(
            "foo",
            rw_flags(),
            0,
            Box::new(TestDriver {
                packets: Arc::clone(&packets),
            }),
        )
        .unwrap();
    reactor.attach(Box::new(mapper)).unwrap();
    assert!(reactor.resume());
    reactor.join();
    reactor.drain_output();
    (reactor, packets)
}

fn exchange(reactor: &mut Reactor, input: &[u8]) -> String {
    reactor.feed(input);
    String::from_utf8(reactor.drain_output()).unwrap()
}

fn expected_info_line() -> String {
    let order = if cfg!(target_endian = "little") {
        "le"
    } else {
        "be"
    };
    format!(
        "]i emc 1.0 emc-test generic {}_{} FF\n",
        std::env::consts::ARCH,
        order
    )
}

#[test]
fn sync_on_connect() {
    let (mut reactor, _) = host_reactor();
    let out = exchange(&mut reactor, b"@\n");
    let expected = format!("{}]s+ dev\n]s+ foo -rw- test\n", expected_info_line());
    assert_eq!(out, expected);
}

#[test]
fn info_request() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?i\n"), expected_info_line());
}

#[test]
fn bad_parse() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?\n"), "]7F INVALID REQUEST.\n");
}

#[test]
fn unknown_request() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?zzzz\n"), "]FF COMMAND NOT FOUND.\n");
}

#[test]
fn open_and_close_stream() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(
        exchange(&mut reactor, b"?o * foo\n"),
        "]c+ 01 foo -rw- test\n"
    );
    assert_eq!(exchange(&mut reactor, b"?x 01\n"), "]c- 01\n");
    // the slot and the channel are free again
    assert_eq!(
        exchange(&mut reactor, b"?o 01 foo\n"),
        "]c+ 01 foo -rw- test\n"
    );
}

#[test]
fn zero_length_packet_dispatch() {
    let (mut reactor, packets) = host_reactor();
    exchange(&mut reactor, b"?o 05 foo\n");
    assert_eq!(exchange(&mut reactor, b"\xfa000"), "");
    assert_eq!(packets.lock().unwrap().as_slice(), &[(5, vec![])]);
}

#[test]
fn packet_body_dispatch() {
    let (mut reactor, packets) = host_reactor();
    exchange(&mut reactor, b"?o 05 foo\n");
    exchange(&mut reactor, b"\xfa001abcdefgh");
    assert_eq!(
        packets.lock().unwrap().as_slice(),
        &[(5, b"abcdefgh".to_vec())]
    );
}

#[test]
fn packet_reassembles_across_feeds() {
    let (mut reactor, packets) = host_reactor();
    exchange(&mut reactor, b"?o 05 foo\n");
    exchange(&mut reactor, b"\xfa0");
    exchange(&mut reactor, b"01abc");
    exchange(&mut reactor, b"defgh");
    assert_eq!(
        packets.lock().unwrap().as_slice(),
        &[(5, b"abcdefgh".to_vec())]
    );
}

#[test]
fn unopened_channel_drops_packets_silently() {
    let (mut reactor, packets) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"\xf9001whatever"), "");
    assert!(packets.lock().unwrap().is_empty());
}

#[test]
fn crlf_collapses_to_one_terminator() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?i\r\n"), expected_info_line());
    // and the swallowed LF does not turn into an empty comment commit
    assert_eq!(reactor.gateway_stats().unwrap().msg_recv, 1);
}

#[test]
fn filler_bytes_are_ignored() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"\xff\x7f?i\n"), expected_info_line());
}

#[test]
fn ping_echoes_cookie() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?g 1A2B\n"), "]g 1A2B\n");
    assert_eq!(exchange(&mut reactor, b"?g\n"), "]g\n");
}

#[test]
fn bye_acknowledges_and_closes() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?z\n"), "]00 READY.\n");
    assert!(!reactor.is_joined());
}

#[test]
fn bad_channel_argument() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?o zz foo\n"), "]FE BAD REQUEST.\n");
    assert_eq!(exchange(&mut reactor, b"?x 00\n"), "]FE BAD REQUEST.\n");
}

#[test]
fn unknown_device_is_not_found() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(
        exchange(&mut reactor, b"?o * nosuch\n"),
        "]FF COMMAND NOT FOUND.\n"
    );
}

#[test]
fn support_and_describe() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"?support\n"), "]s+ foo -rw- test\n");
    assert_eq!(
        exchange(&mut reactor, b"?describe foo\n"),
        "]s+ foo -rw- test\n"
    );
    assert_eq!(
        exchange(&mut reactor, b"?describe nope\n"),
        "]FF COMMAND NOT FOUND.\n"
    );
}

#[test]
fn oversize_message_is_dropped_and_recovered() {
    let (mut reactor, _) = host_reactor();
    let config = EmcConfig::default();
    let long = vec![b'#'; config.queue_size_max + 16];
    reactor.feed(&long);
    reactor.feed(b" tail\n");
    let stats = reactor.gateway_stats().unwrap();
    assert_eq!(stats.msg_drop, 1);
    // the next message still parses
    assert_eq!(exchange(&mut reactor, b"?i\n"), expected_info_line());
}

#[test]
fn comments_produce_no_response() {
    let (mut reactor, _) = host_reactor();
    assert_eq!(exchange(&mut reactor, b"# just a comment\n"), "");
    assert_eq!(reactor.gateway_stats().unwrap().msg_recv, 1);
}

// --- user-side flow ---

fn user_reactor() -> Reactor {
    let mut reactor = Reactor::new(Role::User, Ring::Network).with_identity("probe", "generic");
    reactor
        .attach(Box::new(Gateway::new(
            &EmcConfig::default(),
            GatewayOptions::default(),
        )))
        .unwrap();
    assert!(reactor.resume());
    reactor.join();
    reactor.drain_output();
    reactor
}

#[test]
fn user_requests_info_until_answered() {
    let mut reactor = user_reactor();
    // the info timer fires after twice the wait time
    reactor.sync(17.0);
    let out = String::from_utf8(reactor.drain_output()).unwrap();
    assert!(out.contains("?i\n"), "expected info request, got {out:?}");

    reactor.feed(b"]i emc 1.0 peer generic x86_64_le 100\n");
    assert_eq!(
        reactor.remote_identity(),
        Some(("peer".to_owned(), "generic".to_owned()))
    );

    // once answered, the info timer stays quiet
    reactor.sync(17.0);
    let out = String::from_utf8(reactor.drain_output()).unwrap();
    assert!(!out.contains("?i\n"));
}

#[test]
fn user_send_line_requires_healthy_link() {
    let mut reactor = user_reactor();
    assert!(!reactor.send_line("?g 1"));
    reactor.feed(b"]i emc 1.0 peer generic x86_64_le FF\n");
    assert!(reactor.send_line("?g 1"));
    let out = String::from_utf8(reactor.drain_output()).unwrap();
    assert_eq!(out, "?g 1\n");
}

#[test]
fn user_pings_after_silence_on_a_network_ring() {
    let mut reactor = user_reactor();
    reactor.feed(b"]i emc 1.0 peer generic x86_64_le FF\n");
    reactor.drain_output();
    // two ticks: the ping cookie derives from accumulated uptime
    reactor.sync(60.0);
    reactor.sync(69.0);
    let out = String::from_utf8(reactor.drain_output()).unwrap();
    assert!(out.contains("?g "), "expected ping, got {out:?}");
}

#[test]
fn inbound_bytes_suppress_the_ping() {
    let mut reactor = user_reactor();
    reactor.feed(b"]i emc 1.0 peer generic x86_64_le FF\n");
    reactor.drain_output();
    reactor.sync(100.0);
    reactor.feed(&[0xff]);
    reactor.sync(100.0);
    let out = String::from_utf8(reactor.drain_output()).unwrap();
    assert!(!out.contains("?g "), "ping should be suppressed, got {out:?}");
}

#[test]
fn user_trips_after_prolonged_silence() {
    let mut reactor = user_reactor();
    assert!(reactor.is_joined());
    reactor.sync(257.0);
    assert!(!reactor.is_joined());
}

#[test]
fn user_packet_send_with_padding() {
    let mut reactor = user_reactor();
    reactor.feed(b"]i emc 1.0 peer generic x86_64_le FF\n");
    reactor.drain_output();
    assert!(reactor.send_packet(5, b"abc"));
    let out = reactor.drain_output();
    assert_eq!(&out[..4], b"\xfa001");
    assert_eq!(&out[4..7], b"abc");
    assert_eq!(&out[7..], &[0u8; 5]);
}

#[test]
fn user_packet_roundtrip_to_host() {
    let mut user = user_reactor();
    user.feed(b"]i emc 1.0 emc-test generic x86_64_le FF\n");
    user.drain_output();
    assert!(user.send_packet(5, b"0123456789"));
    let wire = user.drain_output();

    let (mut host, packets) = host_reactor();
    exchange(&mut host, b"?o 05 foo\n");
    host.feed(&wire);
    let received = packets.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, 5);
    assert_eq!(received[0].1.len(), 16);
    assert_eq!(&received[0].1[..10], b"0123456789");
    assert!(received[0].1[10..].iter().all(|&b| b == 0));
}

#[test]
fn user_answers_malformed_response_with_error() {
    let mut reactor = user_reactor();
    reactor.feed(b"]i emc 1.0 peer generic x86_64_le FF\n");
    reactor.drain_output();
    // a malformed response line
    reactor.feed(b"]\n");
    let out = String::from_utf8(reactor.drain_output()).unwrap();
    assert_eq!(out, "]7F INVALID REQUEST.\n");
}

#[test]
fn user_closes_on_bye_response() {
    let mut reactor = user_reactor();
    reactor.feed(b"]i emc 1.0 peer generic x86_64_le FF\n");
    reactor.drain_output();
    reactor.feed(b"]z\n");
    assert!(!reactor.is_joined());
}
