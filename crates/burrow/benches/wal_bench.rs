//! Benchmarks for the write-ahead log.
//!
//! Run with: cargo bench --package burrow

use burrow::{Labels, RefSample, RefSeries, SegmentWal, WalOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Duration;
use tempfile::TempDir;

fn bench_options() -> WalOptions {
    WalOptions {
        segment_size: 64 * 1024 * 1024,
        // Let the benchmark measure the write path, not fdatasync latency.
        flush_interval: Duration::from_secs(3600),
    }
}

fn sample_batch(base: i64, count: usize) -> Vec<RefSample> {
    (0..count)
        .map(|i| RefSample {
            series_ref: (i % 100) as u64,
            t: base + i as i64 * 1000,
            v: 0.5 + (i as f64 * 0.1).sin(),
        })
        .collect()
}

fn bench_log_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_log_samples");
    for batch_size in [100usize, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("batch_{batch_size}"), |b| {
            let dir = TempDir::new().unwrap();
            let wal = SegmentWal::open(dir.path(), bench_options()).unwrap();
            let batch = sample_batch(0, batch_size);
            b.iter(|| wal.log_samples(black_box(&batch)).unwrap());
        });
    }
    group.finish();
}

fn bench_log_series(c: &mut Criterion) {
    c.bench_function("wal_log_series_100", |b| {
        let dir = TempDir::new().unwrap();
        let wal = SegmentWal::open(dir.path(), bench_options()).unwrap();
        let batch: Vec<RefSeries> = (0..100u64)
            .map(|r| RefSeries {
                series_ref: r,
                labels: Labels::from_pairs([
                    ("__name__", "http_requests_total".to_string()),
                    ("instance", format!("host-{r}:9100")),
                ])
                .unwrap(),
            })
            .collect();
        b.iter(|| wal.log_series(black_box(&batch)).unwrap());
    });
}

fn bench_replay(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    {
        let wal = SegmentWal::open(dir.path(), bench_options()).unwrap();
        for i in 0..100 {
            wal.log_samples(&sample_batch(i * 1_000_000, 1000)).unwrap();
        }
        wal.close().unwrap();
    }

    c.bench_function("wal_replay_100k_samples", |b| {
        b.iter(|| {
            let wal = SegmentWal::open(dir.path(), bench_options()).unwrap();
            let mut total = 0usize;
            wal.reader(0)
                .read(
                    |_| Ok(()),
                    |samples| {
                        total += samples.len();
                        Ok(())
                    },
                    |_| Ok(()),
                )
                .unwrap();
            black_box(total)
        });
    });
}

criterion_group!(benches, bench_log_samples, bench_log_series, bench_replay);
criterion_main!(benches);
