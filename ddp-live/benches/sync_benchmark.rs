use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use ddp_live::ejson::{FieldChanges, Fields, Value};
use ddp_live::replica::{diff_ordered, ChannelObserver, ReplicaStore};
use ddp_live::server::MergeBox;
use ddp_live::Message;

fn doc(i: usize) -> Fields {
    [
        ("name".to_string(), Value::from(format!("user-{i}"))),
        ("score".to_string(), Value::from(i as i64)),
        ("joined".to_string(), Value::Date(1_700_000_000_000 + i as i64)),
    ]
    .into()
}

fn bench_added_encode(c: &mut Criterion) {
    let msg = Message::Added {
        collection: "users".into(),
        id: "u1".into(),
        fields: doc(1),
    };

    c.bench_function("added_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_changed_decode(c: &mut Criterion) {
    let changes: FieldChanges = [
        ("name".to_string(), Some(Value::from("renamed"))),
        ("score".to_string(), None),
    ]
    .into();
    let encoded = Message::Changed {
        collection: "users".into(),
        id: "u1".into(),
        fields: changes,
    }
    .encode()
    .unwrap();

    c.bench_function("changed_decode", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_diff_ordered_1k(c: &mut Criterion) {
    let old: Vec<(String, Fields)> = (0..1000).map(|i| (format!("d{i}"), doc(i))).collect();
    let mut new = old.clone();
    new.retain(|(id, _)| !id.ends_with('7'));
    new.swap(10, 500);
    for (_, fields) in new.iter_mut().step_by(50) {
        fields.insert("score".to_string(), Value::from(-1));
    }

    c.bench_function("diff_ordered_1k", |b| {
        b.iter(|| {
            black_box(diff_ordered(black_box(&old), black_box(&new)));
        })
    });
}

fn bench_pause_resume_1k_writes(c: &mut Criterion) {
    c.bench_function("pause_resume_1k_writes", |b| {
        b.iter(|| {
            let mut store = ReplicaStore::new("users");
            let (observer, mut rx) = ChannelObserver::new();
            store.observe(Box::new(observer));
            for i in 0..100 {
                store.insert(&format!("u{i}"), doc(i)).unwrap();
            }
            store.pause_observers();
            for round in 0..10 {
                for i in 0..100 {
                    let changes: FieldChanges = [("score".to_string(), Some(Value::from(round)))].into();
                    store.update_fields(&format!("u{i}"), &changes).unwrap();
                }
            }
            store.resume_observers();
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            black_box(count);
        })
    });
}

fn bench_merge_box_overlap(c: &mut Criterion) {
    c.bench_function("merge_box_two_subs_1k_docs", |b| {
        b.iter(|| {
            let mut merge = MergeBox::new();
            let mut out = Vec::new();
            for i in 0..1000 {
                let id = format!("u{i}");
                merge.added("a", "users", &id, doc(i), &mut out);
                merge.added("b", "users", &id, doc(i), &mut out);
            }
            for i in 0..1000 {
                merge.removed("a", "users", &format!("u{i}"), &mut out).unwrap();
            }
            black_box(out.len());
        })
    });
}

criterion_group!(
    benches,
    bench_added_encode,
    bench_changed_decode,
    bench_diff_ordered_1k,
    bench_pause_resume_1k_writes,
    bench_merge_box_overlap,
);

criterion_main!(benches);
