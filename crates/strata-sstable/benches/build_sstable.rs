use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use strata_core::types::ValueType;
use strata_sstable::{BlockBuilder, SSTableOptions, SSTableWriter};
use tempfile::TempDir;

fn bench_block_builder(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_builder");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("add_10k_prefix_compressed", |b| {
        let value = vec![b'x'; 100];
        b.iter(|| {
            let mut builder = BlockBuilder::new(16);
            for i in 0..10_000 {
                let key = format!("key{i:08}");
                builder.add(key.as_bytes(), &value);
                if builder.current_size_estimate() > 4096 {
                    builder.finish();
                    builder.reset();
                }
            }
        })
    });

    group.finish();
}

fn bench_sstable_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("sstable_write");
    group.throughput(Throughput::Elements(10_000));
    group.sample_size(20);

    group.bench_function("write_10k_entries", |b| {
        let dir = TempDir::new().unwrap();
        let value = vec![b'x'; 100];
        let mut run = 0u64;
        b.iter(|| {
            run += 1;
            let path = dir.path().join(format!("bench-{run}.sst"));
            let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
            for i in 0..10_000u64 {
                let key = format!("key{i:08}");
                writer.add(key.as_bytes(), &value, i + 1, ValueType::Value).unwrap();
            }
            writer.finish().unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_block_builder, bench_sstable_write);
criterion_main!(benches);
