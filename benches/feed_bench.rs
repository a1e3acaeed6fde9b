use criterion::{black_box, criterion_group, criterion_main, Criterion};
use liveboard::backlog::Backlog;
use liveboard::parser;
use liveboard::protocol::{self, MessageType, SpliceMessage};
use liveboard::store::{PubSub, Store, StoreConfig};

fn bench_append_encode(c: &mut Criterion) {
    c.bench_function("append_encode", |b| {
        b.iter(|| {
            black_box(
                protocol::encode(MessageType::Append, &(black_box(101u64), black_box(33u32)))
                    .unwrap(),
            );
        })
    });
}

fn bench_splice_roundtrip(c: &mut Criterion) {
    let msg = SpliceMessage {
        id: 101,
        start: 12,
        len: 40,
        text: "the quick brown fox jumps over the lazy dog".into(),
    };

    c.bench_function("splice_roundtrip", |b| {
        b.iter(|| {
            let frame = protocol::encode(MessageType::Splice, &msg).unwrap();
            let (_, payload) = protocol::split(&frame).unwrap();
            black_box(protocol::decode::<SpliceMessage>(payload).unwrap());
        })
    });
}

fn bench_parse_body(c: &mut Criterion) {
    let body = ">>1000 >>1001 check this out\n#flip #3d6\nmore text on another line";
    let resolve = |_: u64| Some(42u64);

    c.bench_function("parse_body_final", |b| {
        b.iter(|| {
            black_box(parser::parse_body(
                black_box(body),
                black_box(77),
                &resolve,
                true,
            ));
        })
    });
}

fn bench_backlog_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut log = Backlog::load(store, 1).unwrap();
    let msg = "03[101,104]";

    c.bench_function("backlog_append", |b| {
        b.iter(|| {
            black_box(log.append(black_box(msg)).unwrap());
        })
    });
}

fn bench_publish_fanout(c: &mut Criterion) {
    let pubsub = PubSub::new();
    // 100 subscribers on one channel
    let receivers: Vec<_> = (0..100).map(|_| pubsub.subscribe("thread:1")).collect();

    c.bench_function("publish_100_subscribers", |b| {
        b.iter(|| {
            black_box(pubsub.publish(black_box("thread:1"), black_box("03[101,104]")));
        })
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_append_encode,
    bench_splice_roundtrip,
    bench_parse_body,
    bench_backlog_append,
    bench_publish_fanout
);
criterion_main!(benches);
