//! Memory-mapped reader over an immutable block index file.

use super::{
    ChunkMeta, Toc, INDEX_FILE_NAME, INDEX_FORMAT_V1, INDEX_HEADER_SIZE, INDEX_MAGIC, KEY_SEP,
    TOC_LEN,
};
use crate::encoding::{checksum, Decbuf};
use crate::error::{Result, StoreError};
use crate::fileutil;
use crate::labels::{Label, Labels};
use crate::postings::Postings;
use memmap2::Mmap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Read access to a serialized block index.
///
/// The file is memory-mapped at open; all lookups are read-only against the
/// map and safe to run from any number of threads. Returned iterators and
/// tuple views hold a reference to the map, so the file stays mapped until
/// the reader and everything borrowed from it are dropped.
pub struct IndexReader {
    b: Arc<Mmap>,
    #[allow(dead_code)]
    toc: Toc,
    /// Joined label-name tuple -> label index section offset.
    labels: HashMap<Vec<u8>, u64>,
    /// Joined (name, value) pair -> postings section offset.
    postings: HashMap<Vec<u8>, u64>,
}

impl IndexReader {
    /// Memory-maps the `index` file in `dir` and loads its lookup tables.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mmap = fileutil::open_mmap(&dir.as_ref().join(INDEX_FILE_NAME))?;
        let b = Arc::new(mmap);

        if b.len() < INDEX_HEADER_SIZE + TOC_LEN {
            return Err(StoreError::InvalidSize("index header"));
        }
        let magic = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        if magic != INDEX_MAGIC {
            return Err(StoreError::InvalidMagic {
                expected: INDEX_MAGIC,
                actual: magic,
            });
        }
        if b[4] != INDEX_FORMAT_V1 {
            return Err(StoreError::UnsupportedFormat(b[4]));
        }

        let toc = read_toc(&b)?;
        let labels = read_offset_table(&b, toc.label_indices_table)?;
        let postings = read_offset_table(&b, toc.postings_table)?;

        Ok(Self {
            b,
            toc,
            labels,
            postings,
        })
    }

    /// Returns the sorted value tuples indexed for a tuple of label names.
    ///
    /// An unknown name tuple yields an empty view, not an error: an empty
    /// block is a valid state.
    pub fn label_values(&self, names: &[&str]) -> Result<StringTuples> {
        let key = join_keys(names);
        let Some(&off) = self.labels.get(&key) else {
            return Ok(StringTuples {
                b: Arc::clone(&self.b),
                start: 0,
                end: 0,
                tuple_len: 0,
            });
        };

        let (start, end) = self.sized_region(off)?;
        let mut d = Decbuf::new(&self.b[start..end]);
        let tuple_len = d.uvarint() as usize;
        d.check("label index size")?;
        let body_start = end - d.len();
        if tuple_len == 0 || (end - body_start) % (4 * tuple_len) != 0 {
            return Err(StoreError::InvalidSize("label index section"));
        }

        Ok(StringTuples {
            b: Arc::clone(&self.b),
            start: body_start,
            end,
            tuple_len,
        })
    }

    /// Returns the postings iterator for one label pair.
    ///
    /// An unknown pair yields an empty iterator, not an error.
    pub fn postings(&self, name: &str, value: &str) -> Result<SectionPostings> {
        let key = join_keys(&[name, value]);
        let Some(&off) = self.postings.get(&key) else {
            return Ok(SectionPostings {
                b: Arc::clone(&self.b),
                cur: 0,
                end: 0,
            });
        };

        let (start, end) = self.sized_region(off)?;
        if (end - start) % 4 != 0 {
            return Err(StoreError::InvalidSize("postings entry"));
        }
        Ok(SectionPostings {
            b: Arc::clone(&self.b),
            cur: start,
            end,
        })
    }

    /// Reads the series record at `offset`, resolving symbol references.
    ///
    /// Chunk metas carry only what the index stores: reference and time
    /// range; payload and encoding live in the chunk files.
    pub fn series(&self, offset: u64) -> Result<(Labels, Vec<ChunkMeta>)> {
        let off = offset as usize;
        if off >= self.b.len() {
            return Err(StoreError::InvalidOffset(offset));
        }

        let mut d = Decbuf::new(&self.b[off..]);
        let len = d.uvarint() as usize;
        let body = d.bytes(len).to_vec();
        let expected = d.be32();
        d.check("series record frame")?;
        let actual = checksum(&body);
        if actual != expected {
            return Err(StoreError::ChecksumMismatch { expected, actual });
        }

        let mut d = Decbuf::new(&body);
        let n_labels = d.uvarint() as usize;
        d.check("series label count")?;
        let mut labels = Vec::with_capacity(n_labels);
        for _ in 0..n_labels {
            let name_sym = d.uvarint();
            let value_sym = d.uvarint();
            d.check("series symbol offset")?;
            let name = lookup_symbol(&self.b, name_sym)?;
            let value = lookup_symbol(&self.b, value_sym)?;
            labels.push(Label::new(name, value));
        }

        let n_chunks = d.uvarint() as usize;
        d.check("series chunk count")?;
        let mut chunks = Vec::with_capacity(n_chunks);
        for _ in 0..n_chunks {
            let min_time = d.varint();
            let max_time = d.varint();
            let chunk_ref = d.uvarint();
            d.skip(4); // chunk checksum, verified against the chunk file
            d.check("series chunk meta")?;
            chunks.push(ChunkMeta {
                chunk_ref,
                min_time,
                max_time,
                encoding: 0,
                data: Vec::new(),
            });
        }

        Ok((Labels::from_sorted(labels), chunks))
    }

    /// Lists the label name tuples for which value indices exist.
    pub fn label_indices(&self) -> Vec<Vec<String>> {
        let mut res: Vec<Vec<String>> = self
            .labels
            .keys()
            .map(|key| {
                key.split(|&b| b == KEY_SEP)
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect()
            })
            .collect();
        res.sort();
        res
    }

    /// Resolves a symbol reference to its string.
    pub fn lookup_symbol(&self, offset: u64) -> Result<String> {
        lookup_symbol(&self.b, offset)
    }

    /// Locates the body of a length-prefixed section at `off` and verifies
    /// its trailing checksum.
    fn sized_region(&self, off: u64) -> Result<(usize, usize)> {
        let off = off as usize;
        if off >= self.b.len() {
            return Err(StoreError::InvalidOffset(off as u64));
        }
        let mut d = Decbuf::new(&self.b[off..]);
        let len = d.uvarint() as usize;
        d.check("section length")?;

        let start = off + (self.b.len() - off - d.len());
        let end = start + len;
        if end + 4 > self.b.len() {
            return Err(StoreError::InvalidSize("section content"));
        }
        let expected = u32::from_be_bytes([
            self.b[end],
            self.b[end + 1],
            self.b[end + 2],
            self.b[end + 3],
        ]);
        let actual = checksum(&self.b[start..end]);
        if actual != expected {
            return Err(StoreError::ChecksumMismatch { expected, actual });
        }
        Ok((start, end))
    }
}

/// Resolves a symbol at `offset` in the mapped file, bounds-checked.
fn lookup_symbol(b: &[u8], offset: u64) -> Result<String> {
    let off = offset as usize;
    if off >= b.len() {
        return Err(StoreError::InvalidOffset(offset));
    }
    let mut d = Decbuf::new(&b[off..]);
    let s = d.uvarint_str();
    d.check("symbol")
        .map_err(|_| StoreError::InvalidOffset(offset))?;
    Ok(s)
}

/// Joins tuple elements with the non-UTF-8 separator byte.
fn join_keys(keys: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.iter().map(|k| k.len() + 1).sum());
    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            out.push(KEY_SEP);
        }
        out.extend_from_slice(k.as_bytes());
    }
    out
}

/// Reads the table of contents from the end of the file.
fn read_toc(b: &[u8]) -> Result<Toc> {
    let start = b.len() - TOC_LEN;
    let data = &b[start..];

    let expected = u32::from_be_bytes([data[48], data[49], data[50], data[51]]);
    let actual = checksum(&data[..48]);
    if actual != expected {
        return Err(StoreError::ChecksumMismatch { expected, actual });
    }

    let mut d = Decbuf::new(data);
    let toc = Toc {
        symbols: d.be64(),
        series: d.be64(),
        label_indices: d.be64(),
        label_indices_table: d.be64(),
        postings: d.be64(),
        postings_table: d.be64(),
    };
    d.check("read TOC")?;

    for off in [
        toc.symbols,
        toc.series,
        toc.label_indices,
        toc.label_indices_table,
        toc.postings,
        toc.postings_table,
    ] {
        if off as usize > b.len() {
            return Err(StoreError::InvalidOffset(off));
        }
    }
    Ok(toc)
}

/// Decodes an offset table into a map keyed by the joined tuple strings.
fn read_offset_table(b: &[u8], off: u64) -> Result<HashMap<Vec<u8>, u64>> {
    // A table that was never written has a zeroed TOC slot.
    if off == 0 {
        return Ok(HashMap::new());
    }
    let off = off as usize;
    if off + 8 > b.len() {
        return Err(StoreError::InvalidOffset(off as u64));
    }

    let mut d = Decbuf::new(&b[off..]);
    let count = d.be32();
    let body_len = d.be32() as usize;
    d.check("offset table header")?;

    let body_start = off + 8;
    let body_end = body_start + body_len;
    if body_end + 4 > b.len() {
        return Err(StoreError::InvalidSize("offset table body"));
    }
    let body = &b[body_start..body_end];
    let expected = u32::from_be_bytes([b[body_end], b[body_end + 1], b[body_end + 2], b[body_end + 3]]);
    let actual = checksum(body);
    if actual != expected {
        return Err(StoreError::ChecksumMismatch { expected, actual });
    }

    let mut res = HashMap::new();
    let mut d = Decbuf::new(body);
    for _ in 0..count {
        let key_count = d.uvarint() as usize;
        let mut key = Vec::new();
        for i in 0..key_count {
            if i > 0 {
                key.push(KEY_SEP);
            }
            key.extend_from_slice(d.uvarint_str().as_bytes());
        }
        let offset = d.uvarint();
        d.check("offset table entry")?;
        res.insert(key, offset);
    }
    Ok(res)
}

/// A lazy, indexable view over the value tuples of a label index section.
///
/// Tuples are decoded on access; each element resolves a symbol reference
/// through the shared memory map.
pub struct StringTuples {
    b: Arc<Mmap>,
    start: usize,
    end: usize,
    tuple_len: usize,
}

impl StringTuples {
    /// Total number of tuples.
    pub fn len(&self) -> usize {
        if self.tuple_len == 0 {
            0
        } else {
            (self.end - self.start) / (4 * self.tuple_len)
        }
    }

    /// Returns true if the view holds no tuples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the `i`-th tuple.
    pub fn at(&self, i: usize) -> Result<Vec<String>> {
        let base = self.start + i * 4 * self.tuple_len;
        if self.tuple_len == 0 || base + 4 * self.tuple_len > self.end {
            return Err(StoreError::InvalidSize("string tuple index"));
        }
        let mut res = Vec::with_capacity(self.tuple_len);
        for k in 0..self.tuple_len {
            let p = base + 4 * k;
            let sym = u32::from_be_bytes([self.b[p], self.b[p + 1], self.b[p + 2], self.b[p + 3]]);
            res.push(lookup_symbol(&self.b, sym as u64)?);
        }
        Ok(res)
    }
}

/// Postings decoded lazily from a big-endian u32 section of the map.
pub struct SectionPostings {
    b: Arc<Mmap>,
    cur: usize,
    end: usize,
}

impl SectionPostings {
    fn value_at(&self, pos: usize) -> u64 {
        u32::from_be_bytes([self.b[pos], self.b[pos + 1], self.b[pos + 2], self.b[pos + 3]])
            as u64
    }
}

impl Postings for SectionPostings {
    fn next(&mut self) -> Option<u64> {
        if self.cur + 4 > self.end {
            return None;
        }
        let v = self.value_at(self.cur);
        self.cur += 4;
        Some(v)
    }

    fn seek(&mut self, v: u64) -> Option<u64> {
        while self.cur + 4 <= self.end && self.value_at(self.cur) < v {
            self.cur += 4;
        }
        if self.cur + 4 > self.end {
            return None;
        }
        Some(self.value_at(self.cur))
    }
}
