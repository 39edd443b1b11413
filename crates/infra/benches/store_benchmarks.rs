use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use signalhub_core::{AttrValue, BatchId, CanonicalEntity, EntityKey, EntityType, JobId, Provenance, SourceId, Watermark};
use signalhub_infra::store::{CommitBatch, EntityStore, InMemoryStore};
use std::collections::BTreeMap;

fn customers(source_id: &SourceId, batch_id: BatchId, from: usize, n: usize, tenure: i64) -> Vec<CanonicalEntity> {
    (from..from + n)
        .map(|i| CanonicalEntity {
            entity_type: EntityType::Customer,
            entity_key: EntityKey::new(format!("C{i:06}")).unwrap(),
            attributes: BTreeMap::from([
                ("tenure".to_string(), AttrValue::Int(tenure)),
                ("monthly_charges".to_string(), AttrValue::Float(42.5)),
                ("contract".to_string(), AttrValue::Text("Month-to-month".to_string())),
            ]),
            extensions: BTreeMap::new(),
            valid_from: Utc::now(),
            valid_to: None,
            provenance: Provenance {
                source_id: source_id.clone(),
                batch_id,
                record_ref: format!("row:{i}"),
            },
        })
        .collect()
}

fn batch(source_id: &SourceId, seq: u64, entities: Vec<CanonicalEntity>) -> CommitBatch {
    CommitBatch {
        job_id: JobId::new(),
        source_id: source_id.clone(),
        watermark_start: Watermark::from_offset(seq),
        watermark_end: Watermark::from_offset(seq + 1),
        entities,
        quarantined: Vec::new(),
    }
}

fn bench_commit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_batch");
    let source_id = SourceId::new("bench").unwrap();

    for batch_size in [100usize, 1_000, 5_000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("fresh_entities", batch_size), batch_size, |b, &size| {
            b.iter_batched(
                || {
                    let store = InMemoryStore::new();
                    let entities = customers(&source_id, BatchId::new(), 0, size, 1);
                    (store, batch(&source_id, 0, entities))
                },
                |(store, batch)| black_box(store.commit_batch(batch).unwrap()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_snapshot_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_snapshot");
    let source_id = SourceId::new("bench").unwrap();

    for versions_per_key in [1i64, 5, 20].iter() {
        // 1k customers, each with `versions_per_key` versions.
        let store = InMemoryStore::new();
        for v in 0..*versions_per_key {
            let entities = customers(&source_id, BatchId::new(), 0, 1_000, v + 1);
            store.commit_batch(batch(&source_id, v as u64, entities)).unwrap();
        }

        group.bench_with_input(
            BenchmarkId::new("current", versions_per_key),
            versions_per_key,
            |b, _| b.iter(|| black_box(store.read_snapshot(Utc::now()).unwrap().len())),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_commit_throughput, bench_snapshot_reads);
criterion_main!(benches);
