use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use emc_core::{
    Command, DeviceDriver, DeviceFlags, Emitter, EmcConfig, Gateway, GatewayOptions, Mapper,
    Reactor, Ring, Role, Status, Stream,
};

struct Sink;

impl DeviceDriver for Sink {
    fn type_name(&self) -> &'static str {
        "sink"
    }

    fn open(&mut self, _stream: &mut Stream, _args: &Command<'_>, _out: &mut Emitter) -> Status {
        Status::Okay
    }

    fn packet(&mut self, _stream: &Stream, data: &[u8], _out: &mut Emitter) -> Status {
        black_box(data);
        Status::Okay
    }
}

fn host_reactor() -> Reactor {
    let mut reactor = Reactor::new(Role::Host, Ring::Process).with_identity("bench", "generic");
    reactor
        .attach(Box::new(Gateway::new(
            &EmcConfig::default(),
            GatewayOptions::default(),
        )))
        .unwrap();
    let mut mapper = Mapper::new();
    mapper
        .register_device("sink", DeviceFlags::default(), 0, Box::new(Sink))
        .unwrap();
    reactor.attach(Box::new(mapper)).unwrap();
    reactor.resume();
    reactor.join();
    reactor.drain_output();
    reactor
}

fn bench_comment_lines(c: &mut Criterion) {
    let mut reactor = host_reactor();
    let input = "# telemetry sample 0123456789 abcdef\n"
        .repeat(64)
        .into_bytes();

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("comment_lines", |b| {
        b.iter(|| {
            reactor.feed(black_box(&input));
            reactor.drain_output();
        })
    });
    group.finish();
}

fn bench_packets(c: &mut Criterion) {
    let mut reactor = host_reactor();
    reactor.feed(b"?o 05 sink\n");
    reactor.drain_output();

    let mut input = Vec::new();
    for _ in 0..64 {
        input.extend_from_slice(b"\xfa004");
        input.extend_from_slice(&[0xAAu8; 32]);
    }

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("packets", |b| {
        b.iter(|| {
            reactor.feed(black_box(&input));
            reactor.drain_output();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_comment_lines, bench_packets);
criterion_main!(benches);
