//! Integration tests for the block index writer and reader.

use burrow::index::chunk_ref;
use burrow::{
    ChunkMeta, IndexReader, IndexWriter, Labels, ListPostings, Postings, StoreError,
};
use std::fs;
use tempfile::TempDir;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    Labels::from_pairs(pairs.iter().map(|&(n, v)| (n, v))).unwrap()
}

fn chunk(segment: u32, offset: u32, min_time: i64, max_time: i64) -> ChunkMeta {
    ChunkMeta {
        chunk_ref: chunk_ref(segment, offset),
        min_time,
        max_time,
        encoding: 1,
        data: vec![0xAB; 16],
    }
}

fn collect(mut p: impl Postings) -> Vec<u64> {
    let mut out = Vec::new();
    while let Some(v) = p.next() {
        out.push(v);
    }
    out
}

/// Builds the three-series block from the postings lookup scenario.
fn build_sample_index(dir: &TempDir) {
    let mut w = IndexWriter::new(dir.path()).unwrap();
    w.add_series(
        1,
        labels(&[("__name__", "a"), ("foo", "bar")]),
        vec![chunk(0, 8, 0, 1000)],
    )
    .unwrap();
    w.add_series(
        2,
        labels(&[("__name__", "a"), ("foo", "baz")]),
        vec![chunk(0, 128, 0, 1000)],
    )
    .unwrap();
    w.add_series(3, labels(&[("__name__", "b")]), vec![chunk(1, 8, 500, 2000)])
        .unwrap();

    w.write_label_index(&["foo"], &["bar", "baz"]).unwrap();

    w.write_postings("__name__", "a", ListPostings::new(vec![1, 2]))
        .unwrap();
    w.write_postings("__name__", "b", ListPostings::new(vec![3]))
        .unwrap();
    w.write_postings("foo", "bar", ListPostings::new(vec![1]))
        .unwrap();
    w.close().unwrap();
}

#[test]
fn test_postings_lookup_and_series() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);

    let r = IndexReader::open(dir.path()).unwrap();

    let offsets = collect(r.postings("__name__", "a").unwrap());
    assert_eq!(offsets.len(), 2);
    assert!(offsets[0] < offsets[1], "postings must be ascending");

    for &off in &offsets {
        let (lset, chunks) = r.series(off).unwrap();
        assert_eq!(lset.get("__name__"), Some("a"));
        assert_eq!(chunks.len(), 1);
    }

    let bar = collect(r.postings("foo", "bar").unwrap());
    assert_eq!(bar.len(), 1);
    let (lset, _) = r.series(bar[0]).unwrap();
    assert_eq!(lset, labels(&[("__name__", "a"), ("foo", "bar")]));

    // Absent pairs yield an empty iterator, not an error.
    assert!(collect(r.postings("nope", "nope").unwrap()).is_empty());
}

#[test]
fn test_series_chunk_meta_roundtrip() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);

    let r = IndexReader::open(dir.path()).unwrap();
    let offsets = collect(r.postings("__name__", "b").unwrap());
    let (lset, chunks) = r.series(offsets[0]).unwrap();
    assert_eq!(lset, labels(&[("__name__", "b")]));
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_ref, chunk_ref(1, 8));
    assert_eq!(chunks[0].min_time, 500);
    assert_eq!(chunks[0].max_time, 2000);
}

#[test]
fn test_label_values_enumeration() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);

    let r = IndexReader::open(dir.path()).unwrap();
    let tuples = r.label_values(&["foo"]).unwrap();
    assert_eq!(tuples.len(), 2);
    assert_eq!(tuples.at(0).unwrap(), vec!["bar"]);
    assert_eq!(tuples.at(1).unwrap(), vec!["baz"]);
    assert!(tuples.at(2).is_err());

    // Unknown name tuples are an empty view, not an error.
    let absent = r.label_values(&["missing"]).unwrap();
    assert_eq!(absent.len(), 0);

    assert_eq!(r.label_indices(), vec![vec!["foo".to_string()]]);
}

#[test]
fn test_metric_name_postings_cover_all_series() {
    let dir = TempDir::new().unwrap();
    {
        let mut w = IndexWriter::new(dir.path()).unwrap();
        let by_name: Vec<(u64, &str)> = vec![(10, "up"), (11, "up"), (12, "down")];
        for &(r, name) in &by_name {
            w.add_series(r, labels(&[("__name__", name)]), vec![]).unwrap();
        }
        w.write_postings("__name__", "up", ListPostings::new(vec![10, 11]))
            .unwrap();
        w.write_postings("__name__", "down", ListPostings::new(vec![12]))
            .unwrap();
        w.close().unwrap();
    }

    let r = IndexReader::open(dir.path()).unwrap();
    for (name, want) in [("up", 2usize), ("down", 1usize)] {
        let offsets = collect(r.postings("__name__", name).unwrap());
        assert_eq!(offsets.len(), want);
        for off in offsets {
            let (lset, _) = r.series(off).unwrap();
            assert_eq!(lset.get("__name__"), Some(name));
        }
    }
}

#[test]
fn test_postings_sorted_by_offset_not_ref() {
    let dir = TempDir::new().unwrap();
    {
        let mut w = IndexWriter::new(dir.path()).unwrap();
        // Ref order is the reverse of label-set order, so the series offsets
        // must be re-sorted when the postings are written.
        w.add_series(10, labels(&[("__name__", "z")]), vec![]).unwrap();
        w.add_series(20, labels(&[("__name__", "a")]), vec![]).unwrap();
        w.write_postings("kind", "both", ListPostings::new(vec![10, 20]))
            .unwrap();
        w.close().unwrap();
    }

    let r = IndexReader::open(dir.path()).unwrap();
    let offsets = collect(r.postings("kind", "both").unwrap());
    assert_eq!(offsets.len(), 2);
    assert!(offsets[0] < offsets[1]);
    let (first, _) = r.series(offsets[0]).unwrap();
    let (second, _) = r.series(offsets[1]).unwrap();
    // Label-set order: "a" sorts before "z".
    assert_eq!(first.get("__name__"), Some("a"));
    assert_eq!(second.get("__name__"), Some("z"));
}

#[test]
fn test_reader_idempotent_across_opens() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);

    let r1 = IndexReader::open(dir.path()).unwrap();
    let r2 = IndexReader::open(dir.path()).unwrap();

    for (name, value) in [("__name__", "a"), ("__name__", "b"), ("foo", "bar")] {
        let a = collect(r1.postings(name, value).unwrap());
        let b = collect(r2.postings(name, value).unwrap());
        assert_eq!(a, b);
        for off in a {
            assert_eq!(r1.series(off).unwrap(), r2.series(off).unwrap());
        }
    }
    assert_eq!(r1.label_indices(), r2.label_indices());
}

#[test]
fn test_views_outlive_reader() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);

    let r = IndexReader::open(dir.path()).unwrap();
    let postings = r.postings("__name__", "a").unwrap();
    let tuples = r.label_values(&["foo"]).unwrap();
    drop(r);

    // The mmap stays alive through the views' shared reference.
    assert_eq!(collect(postings).len(), 2);
    assert_eq!(tuples.at(0).unwrap(), vec!["bar"]);
}

#[test]
fn test_empty_index_roundtrip() {
    let dir = TempDir::new().unwrap();
    IndexWriter::new(dir.path()).unwrap().close().unwrap();

    let r = IndexReader::open(dir.path()).unwrap();
    assert!(collect(r.postings("a", "b").unwrap()).is_empty());
    assert_eq!(r.label_values(&["a"]).unwrap().len(), 0);
    assert!(r.label_indices().is_empty());
}

#[test]
fn test_open_rejects_bad_magic_and_version() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);
    let path = dir.path().join("index");
    let clean = fs::read(&path).unwrap();

    let mut bad_magic = clean.clone();
    bad_magic[0] = 0x00;
    fs::write(&path, &bad_magic).unwrap();
    assert!(matches!(
        IndexReader::open(dir.path()),
        Err(StoreError::InvalidMagic { .. })
    ));

    let mut bad_version = clean.clone();
    bad_version[4] = 9;
    fs::write(&path, &bad_version).unwrap();
    assert!(matches!(
        IndexReader::open(dir.path()),
        Err(StoreError::UnsupportedFormat(9))
    ));
}

#[test]
fn test_open_rejects_corrupt_toc() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);
    let path = dir.path().join("index");

    let mut data = fs::read(&path).unwrap();
    let n = data.len();
    // Flip a byte inside the TOC offsets; the trailing CRC catches it.
    data[n - 20] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    assert!(matches!(
        IndexReader::open(dir.path()),
        Err(StoreError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_series_record_checksum_verified() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);
    let path = dir.path().join("index");

    let r = IndexReader::open(dir.path()).unwrap();
    let offsets = collect(r.postings("__name__", "a").unwrap());
    drop(r);

    // Corrupt a byte inside the first series record body.
    let mut data = fs::read(&path).unwrap();
    let target = offsets[0] as usize + 2;
    data[target] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let r = IndexReader::open(dir.path()).unwrap();
    assert!(matches!(
        r.series(offsets[0]),
        Err(StoreError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_series_out_of_range_offset() {
    let dir = TempDir::new().unwrap();
    build_sample_index(&dir);

    let r = IndexReader::open(dir.path()).unwrap();
    assert!(matches!(
        r.series(1 << 40),
        Err(StoreError::InvalidOffset(_))
    ));
    assert!(matches!(
        r.lookup_symbol(1 << 40),
        Err(StoreError::InvalidOffset(_))
    ));
}

#[test]
fn test_multi_name_label_index() {
    let dir = TempDir::new().unwrap();
    {
        let mut w = IndexWriter::new(dir.path()).unwrap();
        w.add_series(
            1,
            labels(&[("job", "node"), ("zone", "eu")]),
            vec![],
        )
        .unwrap();
        w.add_series(
            2,
            labels(&[("job", "node"), ("zone", "us")]),
            vec![],
        )
        .unwrap();
        w.write_label_index(&["job", "zone"], &["node", "eu", "node", "us"])
            .unwrap();
        w.close().unwrap();
    }

    let r = IndexReader::open(dir.path()).unwrap();
    let tuples = r.label_values(&["job", "zone"]).unwrap();
    assert_eq!(tuples.len(), 2);
    assert_eq!(tuples.at(0).unwrap(), vec!["node", "eu"]);
    assert_eq!(tuples.at(1).unwrap(), vec!["node", "us"]);
    assert_eq!(
        r.label_indices(),
        vec![vec!["job".to_string(), "zone".to_string()]]
    );
}
