//! Staged writer producing an immutable block index file.

use super::{
    ChunkMeta, Stage, Toc, INDEX_FILE_NAME, INDEX_FORMAT_V1, INDEX_MAGIC, MAX_INDEX_SIZE,
};
use crate::encoding::Encbuf;
use crate::error::{IoResultExt, Result, StoreError};
use crate::fileutil;
use crate::labels::Labels;
use crate::postings::Postings;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Buffer size of the index file writer.
const WRITE_BUFFER_SIZE: usize = 1 << 22;

struct SeriesEntry {
    labels: Labels,
    chunks: Vec<ChunkMeta>,
    /// Byte offset of the series record, filled in when the section is
    /// flushed; postings refer to series by this offset.
    offset: u32,
}

struct TableEntry {
    keys: Vec<String>,
    offset: u64,
}

/// Serializes the index for one block of series data.
///
/// The write methods must be called in stage order: populate with
/// [`IndexWriter::add_series`], then [`IndexWriter::write_label_index`],
/// then [`IndexWriter::write_postings`], then [`IndexWriter::close`].
/// Moving to a later stage flushes the prior sections in their canonical
/// order; calls against an earlier stage fail with
/// [`StoreError::StageOrder`].
pub struct IndexWriter {
    w: BufWriter<File>,
    dir: PathBuf,
    /// Running byte position, tracked independently of the buffered writer.
    pos: u64,
    stage: Stage,
    toc: Toc,

    // Reusable encoding buffers: frame headers go through `buf1`, section
    // bodies through `buf2`.
    buf1: Encbuf,
    buf2: Encbuf,

    series: HashMap<u64, SeriesEntry>,
    symbols: HashMap<String, u32>,
    label_indexes: Vec<TableEntry>,
    postings: Vec<TableEntry>,
}

impl IndexWriter {
    /// Creates the `index` file in `dir` and writes the file header.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(INDEX_FILE_NAME))
            .context("create index file")?;
        fileutil::sync_dir(&dir)?;

        let mut w = Self {
            w: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            dir,
            pos: 0,
            stage: Stage::Populate,
            toc: Toc::default(),
            buf1: Encbuf::with_capacity(1 << 12),
            buf2: Encbuf::with_capacity(1 << 16),
            series: HashMap::new(),
            symbols: HashMap::new(),
            label_indexes: Vec::new(),
            postings: Vec::new(),
        };

        w.buf1.reset();
        w.buf1.put_be32(INDEX_MAGIC);
        w.buf1.put_byte(INDEX_FORMAT_V1);
        write_tracked(&mut w.w, &mut w.pos, &[w.buf1.get()])?;
        Ok(w)
    }

    /// Registers a series with its chunk metadata.
    ///
    /// All label names and values are interned into the block's symbol
    /// table. Re-adding a reference fails with
    /// [`StoreError::DuplicateSeries`].
    pub fn add_series(
        &mut self,
        series_ref: u64,
        labels: Labels,
        chunks: Vec<ChunkMeta>,
    ) -> Result<()> {
        self.ensure_stage(Stage::Populate)?;
        if self.series.contains_key(&series_ref) {
            return Err(StoreError::DuplicateSeries(series_ref));
        }
        for l in &labels {
            self.symbols.insert(l.name.clone(), 0);
            self.symbols.insert(l.value.clone(), 0);
        }
        self.series.insert(
            series_ref,
            SeriesEntry {
                labels,
                chunks,
                offset: 0,
            },
        );
        Ok(())
    }

    /// Serializes an index from a tuple of label names to its value tuples.
    ///
    /// `values` holds tuples of `names.len()` flattened strings. May be
    /// called repeatedly with disjoint name tuples.
    pub fn write_label_index(&mut self, names: &[&str], values: &[&str]) -> Result<()> {
        self.ensure_stage(Stage::LabelIndex)?;
        if names.is_empty() || values.len() % names.len() != 0 {
            return Err(StoreError::InvalidSize("label index value tuples"));
        }

        let mut tuples: Vec<&[&str]> = values.chunks(names.len()).collect();
        tuples.sort();

        self.label_indexes.push(TableEntry {
            keys: names.iter().map(|n| n.to_string()).collect(),
            offset: self.pos,
        });

        self.buf2.reset();
        self.buf2.put_uvarint(names.len() as u64);
        for tuple in tuples {
            for v in tuple {
                let sym = self
                    .symbols
                    .get(*v)
                    .copied()
                    .ok_or_else(|| StoreError::UnknownSymbol(v.to_string()))?;
                self.buf2.put_be32(sym);
            }
        }

        self.buf1.reset();
        self.buf1.put_uvarint(self.buf2.len() as u64);
        self.buf2.put_crc32c();
        write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get(), self.buf2.get()])
    }

    /// Writes the postings list for one label pair.
    ///
    /// `postings` yields the series refs passed to
    /// [`IndexWriter::add_series`]; they are translated to series offsets
    /// and stored sorted ascending.
    pub fn write_postings(
        &mut self,
        name: &str,
        value: &str,
        mut postings: impl Postings,
    ) -> Result<()> {
        self.ensure_stage(Stage::Postings)?;

        self.postings.push(TableEntry {
            keys: vec![name.to_string(), value.to_string()],
            offset: self.pos,
        });

        // Series order inside the block is label-set order, so the incoming
        // refs do not imply offset order; sort the translated offsets.
        let mut offsets = Vec::new();
        while let Some(r) = postings.next() {
            let entry = self
                .series
                .get(&r)
                .ok_or(StoreError::MissingSeriesRef(r))?;
            offsets.push(entry.offset);
        }
        offsets.sort_unstable();

        self.buf2.reset();
        for offset in offsets {
            self.buf2.put_be32(offset);
        }

        self.buf1.reset();
        self.buf1.put_uvarint(self.buf2.len() as u64);
        self.buf2.put_crc32c();
        write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get(), self.buf2.get()])
    }

    /// Flushes the remaining sections and the TOC, then fsyncs the file and
    /// its parent directory.
    pub fn close(mut self) -> Result<()> {
        self.ensure_stage(Stage::Done)?;
        let file = self.w.into_inner().map_err(|e| StoreError::IoOp {
            op: "flush index file",
            source: e.into_error(),
        })?;
        file.sync_all().context("fsync index file")?;
        drop(file);
        fileutil::sync_dir(&self.dir)
    }

    /// Advances through intermediate stages up to `target`, flushing each
    /// completed section along the way. Rewinding is an error.
    fn ensure_stage(&mut self, target: Stage) -> Result<()> {
        if self.stage > target {
            return Err(StoreError::StageOrder {
                current: self.stage.name(),
                requested: target.name(),
            });
        }
        while self.stage < target {
            match self.stage {
                Stage::Populate => {
                    self.toc.symbols = self.pos;
                    self.write_symbols()?;
                    self.toc.series = self.pos;
                    self.write_series()?;
                    self.toc.label_indices = self.pos;
                    self.stage = Stage::LabelIndex;
                }
                Stage::LabelIndex => {
                    self.toc.label_indices_table = self.pos;
                    let entries = std::mem::take(&mut self.label_indexes);
                    self.write_offset_table(&entries)?;
                    self.toc.postings = self.pos;
                    self.stage = Stage::Postings;
                }
                Stage::Postings => {
                    self.toc.postings_table = self.pos;
                    let entries = std::mem::take(&mut self.postings);
                    self.write_offset_table(&entries)?;
                    self.write_toc()?;
                    self.stage = Stage::Done;
                }
                Stage::Done => {}
            }
        }
        Ok(())
    }

    /// Writes the sorted symbol table and records each symbol's offset.
    fn write_symbols(&mut self) -> Result<()> {
        let mut symbols: Vec<String> = self.symbols.keys().cloned().collect();
        symbols.sort();

        const HEADER_SIZE: u32 = 8;

        self.buf2.reset();
        for s in &symbols {
            let offset = self.pos as u32 + HEADER_SIZE + self.buf2.len() as u32;
            self.symbols.insert(s.clone(), offset);
            self.buf2.put_uvarint_str(s);
        }

        self.buf1.reset();
        self.buf1.put_be32(symbols.len() as u32);
        self.buf1.put_be32(self.buf2.len() as u32);
        self.buf2.put_crc32c();
        write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get(), self.buf2.get()])
    }

    /// Writes all series records in label-set order, assigning the offsets
    /// postings lists refer to.
    fn write_series(&mut self) -> Result<()> {
        let mut refs: Vec<u64> = self.series.keys().copied().collect();
        refs.sort_by(|a, b| self.series[a].labels.cmp(&self.series[b].labels));

        self.buf1.reset();
        self.buf1.put_be32(refs.len() as u32);
        write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get()])?;

        for r in refs {
            let offset = self.pos as u32;
            {
                let entry = &self.series[&r];
                self.buf2.reset();
                self.buf2.put_uvarint(entry.labels.len() as u64);
                for l in &entry.labels {
                    let name_sym = self.symbols.get(&l.name).copied().unwrap_or(0);
                    let value_sym = self.symbols.get(&l.value).copied().unwrap_or(0);
                    self.buf2.put_uvarint32(name_sym);
                    self.buf2.put_uvarint32(value_sym);
                }

                self.buf2.put_uvarint(entry.chunks.len() as u64);
                for c in &entry.chunks {
                    self.buf2.put_varint(c.min_time);
                    self.buf2.put_varint(c.max_time);
                    self.buf2.put_uvarint(c.chunk_ref);
                    self.buf2.put_be32(c.checksum());
                }
            }

            self.buf1.reset();
            self.buf1.put_uvarint(self.buf2.len() as u64);
            self.buf2.put_crc32c();
            write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get(), self.buf2.get()])?;

            if let Some(entry) = self.series.get_mut(&r) {
                entry.offset = offset;
            }
        }
        Ok(())
    }

    fn write_offset_table(&mut self, entries: &[TableEntry]) -> Result<()> {
        self.buf2.reset();
        for e in entries {
            self.buf2.put_uvarint(e.keys.len() as u64);
            for k in &e.keys {
                self.buf2.put_uvarint_str(k);
            }
            self.buf2.put_uvarint(e.offset);
        }

        self.buf1.reset();
        self.buf1.put_be32(entries.len() as u32);
        self.buf1.put_be32(self.buf2.len() as u32);
        self.buf2.put_crc32c();
        write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get(), self.buf2.get()])
    }

    fn write_toc(&mut self) -> Result<()> {
        self.buf1.reset();
        self.buf1.put_be64(self.toc.symbols);
        self.buf1.put_be64(self.toc.series);
        self.buf1.put_be64(self.toc.label_indices);
        self.buf1.put_be64(self.toc.label_indices_table);
        self.buf1.put_be64(self.toc.postings);
        self.buf1.put_be64(self.toc.postings_table);
        self.buf1.put_crc32c();
        write_tracked(&mut self.w, &mut self.pos, &[self.buf1.get()])
    }
}

/// Appends buffers to the index file, tracking the byte position and
/// enforcing the 4 GiB cap before any boundary byte is written.
fn write_tracked(w: &mut BufWriter<File>, pos: &mut u64, bufs: &[&[u8]]) -> Result<()> {
    for b in bufs {
        if *pos + b.len() as u64 > MAX_INDEX_SIZE {
            return Err(StoreError::FileTooLarge);
        }
        w.write_all(b).context("write index section")?;
        *pos += b.len() as u64;
    }
    Ok(())
}
