//! Segmented write-ahead log for series data.
//!
//! The WAL records every live series creation, sample append and tombstone
//! so the in-memory head can be reconstructed after a crash. It is a
//! directory of monotonically numbered, preallocated segment files, each
//! holding a stream of CRC-guarded entries:
//!
//! ```text
//! segment file:  magic (u32 BE) | version (u8) | 3 reserved bytes
//!                entry*
//! entry:         type (u8) | flag (u8) | len (u32 BE)
//!                payload (len bytes) | crc32c (u32 BE)
//! ```
//!
//! The checksum covers the entry header and payload. Replay walks the
//! segments in order, verifies every frame and truncates the log back to the
//! last fully written entry when it finds a torn tail, so a crash mid-write
//! never poisons the log.

mod reader;
mod record;

pub use reader::WalReader;
pub use record::{RefSample, RefSeries, Stone, TimeRange, WalEntryType};

use crate::encoding::{checksum, checksum_append, Encbuf};
use crate::error::{IoResultExt, Result, StoreError};
use crate::fileutil::{self, DirLock};
use crate::postings::Postings;
use parking_lot::Mutex;
use reader::{Frame, FrameReader};
use record::FLAG_SIMPLE;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Magic number at the head of every WAL segment file.
pub const WAL_MAGIC: u32 = 0x43AF_00EF;

/// WAL segment file format version.
pub const WAL_FORMAT_VERSION: u8 = 1;

/// Default maximum segment size (256 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

/// Size of the fixed segment file header.
pub(crate) const SEGMENT_HEADER_SIZE: u64 = 8;

/// Size of an entry frame header: type, flag and payload length.
pub(crate) const ENTRY_HEADER_SIZE: u64 = 6;

/// Buffer size of the tail segment writer.
const TAIL_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for a [`SegmentWal`].
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Maximum size of a segment file; writing past it cuts a new segment.
    pub segment_size: u64,
    /// Interval of the background flush task. Zero makes every log call
    /// flush and fdatasync synchronously before returning.
    pub flush_interval: Duration,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Metadata the WAL keeps per segment file.
#[derive(Debug)]
pub(crate) struct SegmentMeta {
    pub(crate) seq: u64,
    pub(crate) path: PathBuf,
    /// Maximum sample timestamp written to or replayed from this segment.
    pub(crate) maxt: i64,
}

/// The buffered write handle onto the newest segment.
pub(crate) struct TailWriter {
    pub(crate) w: BufWriter<File>,
    /// Byte position the next entry will be written at.
    pub(crate) written: u64,
}

impl TailWriter {
    pub(crate) fn new(file: File, written: u64) -> Self {
        Self {
            w: BufWriter::with_capacity(TAIL_BUFFER_SIZE, file),
            written,
        }
    }
}

/// Mutable WAL state guarded by the writer mutex.
pub(crate) struct WalInner {
    pub(crate) dir: PathBuf,
    pub(crate) segments: Vec<SegmentMeta>,
    pub(crate) tail: Option<TailWriter>,
    segment_size: u64,
    /// Scratch buffer reused across entry encodings.
    buf: Encbuf,
}

impl WalInner {
    /// Flushes, fdatasyncs and truncates a retired tail to its write cursor.
    fn finalize(tail: TailWriter) -> Result<()> {
        let written = tail.written;
        let file = tail.w.into_inner().map_err(|e| StoreError::IoOp {
            op: "flush WAL tail",
            source: e.into_error(),
        })?;
        file.sync_data().context("fdatasync WAL segment")?;
        file.set_len(written).context("truncate WAL segment")?;
        Ok(())
    }

    /// Allocates the next segment file and returns a tail positioned after
    /// its header. The previous tail must already be finalized.
    fn cut(&mut self) -> Result<TailWriter> {
        let (seq, path) = fileutil::next_sequence_file(&self.dir)?;
        let mut file = fileutil::create_preallocated(&path, self.segment_size)?;
        fileutil::sync_dir(&self.dir)?;

        let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
        header[..4].copy_from_slice(&WAL_MAGIC.to_be_bytes());
        header[4] = WAL_FORMAT_VERSION;
        file.write_all(&header).context("write segment header")?;

        debug!(segment = seq, "cut new WAL segment");
        self.segments.push(SegmentMeta { seq, path, maxt: 0 });
        Ok(TailWriter::new(file, SEGMENT_HEADER_SIZE))
    }

    /// Appends one framed entry, cutting to a new segment if the entry would
    /// cross the segment boundary. An entry larger than a whole segment is
    /// still written into the current segment so no segment stays empty.
    fn append_entry(
        &mut self,
        etype: WalEntryType,
        flag: u8,
        payload: &[u8],
        maxt: Option<i64>,
    ) -> Result<()> {
        let size = ENTRY_HEADER_SIZE + payload.len() as u64 + 4;

        let mut tail = match self.tail.take() {
            Some(t)
                if t.written <= self.segment_size
                    && (t.written + size <= self.segment_size || size > self.segment_size) =>
            {
                t
            }
            t => {
                if let Some(t) = t {
                    Self::finalize(t)?;
                }
                self.cut()?
            }
        };

        write_frame(&mut tail.w, etype, flag, payload).context("write WAL entry")?;
        tail.written += size;
        self.tail = Some(tail);

        if let (Some(maxt), Some(seg)) = (maxt, self.segments.last_mut()) {
            if seg.maxt < maxt {
                seg.maxt = maxt;
            }
        }
        Ok(())
    }
}

/// Writes one entry frame: header, payload and the checksum over both.
pub(crate) fn write_frame<W: Write>(
    w: &mut W,
    etype: WalEntryType,
    flag: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
    header[0] = etype as u8;
    header[1] = flag;
    header[2..6].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    let crc = checksum_append(checksum(&header), payload);

    w.write_all(&header)?;
    w.write_all(payload)?;
    w.write_all(&crc.to_be_bytes())
}

/// A durable, append-only log of series, samples and tombstones.
///
/// All mutating operations are serialized through one internal mutex; a
/// background task flushes and fdatasyncs the tail segment every
/// `flush_interval`, or every log call syncs synchronously when the interval
/// is zero. The log must be fully replayed through [`SegmentWal::reader`]
/// before new entries are appended.
pub struct SegmentWal {
    inner: Arc<Mutex<WalInner>>,
    flush_interval: Duration,
    failed_syncs: Arc<AtomicU64>,
    stop_tx: Option<Sender<()>>,
    flusher: Option<JoinHandle<()>>,
    _lock: DirLock,
}

impl SegmentWal {
    /// Opens or creates a write-ahead log in `dir`.
    ///
    /// Existing segment headers are validated; the directory is locked for
    /// exclusive ownership via a `lock` file.
    pub fn open(dir: impl AsRef<Path>, options: WalOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create WAL dir")?;
        let lock = DirLock::acquire(&dir)?;

        let mut segments = Vec::new();
        for (seq, path) in fileutil::sequence_files(&dir)? {
            validate_segment_header(&path)?;
            segments.push(SegmentMeta { seq, path, maxt: 0 });
        }

        let inner = Arc::new(Mutex::new(WalInner {
            dir,
            segments,
            tail: None,
            segment_size: options.segment_size,
            buf: Encbuf::with_capacity(64 * 1024),
        }));
        let failed_syncs = Arc::new(AtomicU64::new(0));

        let (stop_tx, flusher) = if options.flush_interval > Duration::ZERO {
            let (tx, rx) = mpsc::channel::<()>();
            let inner = Arc::clone(&inner);
            let failed = Arc::clone(&failed_syncs);
            let interval = options.flush_interval;
            let handle = thread::spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = sync_tail(&inner) {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "background WAL sync failed");
                        }
                    }
                    // Stop signal or sender dropped on close.
                    _ => return,
                }
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            inner,
            flush_interval: options.flush_interval,
            failed_syncs,
            stop_tx,
            flusher,
            _lock: lock,
        })
    }

    /// Logs a batch of new series records. Refs must be ascending within and
    /// across batches.
    pub fn log_series(&self, series: &[RefSeries]) -> Result<()> {
        if series.is_empty() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            let mut buf = std::mem::take(&mut inner.buf);
            buf.reset();
            record::encode_series(&mut buf, series);
            let res = inner.append_entry(WalEntryType::Series, FLAG_SIMPLE, buf.get(), None);
            inner.buf = buf;
            res?;
        }
        self.maybe_sync()
    }

    /// Logs a batch of samples.
    pub fn log_samples(&self, samples: &[RefSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            let mut buf = std::mem::take(&mut inner.buf);
            buf.reset();
            let maxt = record::encode_samples(&mut buf, samples);
            let res = inner.append_entry(WalEntryType::Samples, FLAG_SIMPLE, buf.get(), Some(maxt));
            inner.buf = buf;
            res?;
        }
        self.maybe_sync()
    }

    /// Logs a batch of tombstones.
    pub fn log_deletes(&self, stones: &[Stone]) -> Result<()> {
        if stones.is_empty() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            let mut buf = std::mem::take(&mut inner.buf);
            buf.reset();
            record::encode_deletes(&mut buf, stones);
            let res = inner.append_entry(WalEntryType::Deletes, FLAG_SIMPLE, buf.get(), None);
            inner.buf = buf;
            res?;
        }
        self.maybe_sync()
    }

    fn maybe_sync(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            self.sync()
        } else {
            Ok(())
        }
    }

    /// Flushes buffered writes and fdatasyncs the tail segment.
    ///
    /// The disk sync happens after the writer mutex is released so other
    /// writers are not blocked on I/O.
    pub fn sync(&self) -> Result<()> {
        sync_tail(&self.inner)
    }

    /// Returns a replay handle over a snapshot of the current segment list.
    ///
    /// The log must be fully consumed through the reader before new entries
    /// are appended.
    pub fn reader(&self, mint: i64) -> WalReader {
        let inner = self.inner.lock();
        let segments = inner
            .segments
            .iter()
            .map(|s| (s.seq, s.path.clone()))
            .collect();
        WalReader::new(Arc::clone(&self.inner), segments, mint)
    }

    /// Drops segments whose data is entirely obsolete.
    ///
    /// Segments whose maximum sample timestamp is below `mint` are removed;
    /// the oldest of them is first rewritten to hold only the series records
    /// whose refs appear in `keep` so every live series stays discoverable
    /// from a prefix of the log. `keep` must be sorted ascending.
    pub fn truncate(&self, mint: i64, mut keep: impl Postings) -> Result<()> {
        let mut inner = self.inner.lock();
        let candidates: Vec<usize> = inner
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.maxt < mint)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        // Retire the write handle if the tail itself is obsolete; the next
        // append cuts a fresh segment.
        if candidates.contains(&(inner.segments.len() - 1)) {
            if let Some(t) = inner.tail.take() {
                WalInner::finalize(t)?;
            }
        }

        let dst_path = inner.segments[candidates[0]].path.clone();
        let tmp_path = dst_path.with_extension("tmp");

        {
            let file = File::create(&tmp_path).context("create compacted segment")?;
            let mut out = BufWriter::new(file);
            let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
            header[..4].copy_from_slice(&WAL_MAGIC.to_be_bytes());
            header[4] = WAL_FORMAT_VERSION;
            out.write_all(&header).context("write segment header")?;

            let mut buf = Encbuf::new();
            for &ci in &candidates {
                let path = inner.segments[ci].path.clone();
                let mut fr = FrameReader::open(&path)?;
                loop {
                    match fr.next()? {
                        Frame::End => break,
                        Frame::Corrupt { reason } => {
                            warn!(path = %path.display(), reason, "skipping corrupt WAL tail during truncation");
                            break;
                        }
                        Frame::Entry { etype, payload, .. } => {
                            if etype != WalEntryType::Series {
                                continue;
                            }
                            let series = record::decode_series(&payload)?;
                            let active: Vec<RefSeries> = series
                                .into_iter()
                                .filter(|s| keep.seek(s.series_ref) == Some(s.series_ref))
                                .collect();
                            if active.is_empty() {
                                continue;
                            }
                            buf.reset();
                            record::encode_series(&mut buf, &active);
                            write_frame(&mut out, WalEntryType::Series, FLAG_SIMPLE, buf.get())
                                .context("write compacted series")?;
                        }
                    }
                }
            }

            let file = out.into_inner().map_err(|e| StoreError::IoOp {
                op: "flush compacted segment",
                source: e.into_error(),
            })?;
            file.sync_data().context("fdatasync compacted segment")?;
        }

        fs::rename(&tmp_path, &dst_path).context("rename compacted segment")?;
        for &ci in &candidates[1..] {
            fs::remove_file(&inner.segments[ci].path).context("remove WAL segment")?;
        }
        fileutil::sync_dir(&inner.dir)?;
        debug!(
            compacted = 1,
            removed = candidates.len() - 1,
            "truncated WAL"
        );

        // Update in-memory state: removed segments disappear, the compacted
        // one holds no samples anymore.
        let removed: Vec<usize> = candidates[1..].to_vec();
        inner.segments[candidates[0]].maxt = 0;
        let segments = std::mem::take(&mut inner.segments);
        inner.segments = segments
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(_, s)| s)
            .collect();
        Ok(())
    }

    /// Returns how many background sync attempts have failed so far.
    pub fn failed_syncs(&self) -> u64 {
        self.failed_syncs.load(Ordering::Relaxed)
    }

    /// Returns the number of live segment files.
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Stops the background flusher, syncs all data and closes the tail.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        // Dropping the sender disconnects the flusher; block until it exits.
        drop(self.stop_tx.take());
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock();
        if let Some(tail) = inner.tail.take() {
            WalInner::finalize(tail)?;
        }
        Ok(())
    }
}

impl Drop for SegmentWal {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(error = %e, "failed to close WAL");
        }
    }
}

/// Flushes the tail under the mutex, then fdatasyncs on a cloned handle
/// after releasing it.
fn sync_tail(inner: &Mutex<WalInner>) -> Result<()> {
    let file = {
        let mut guard = inner.lock();
        match guard.tail.as_mut() {
            Some(tail) => {
                tail.w.flush().context("flush WAL tail")?;
                Some(tail.w.get_ref().try_clone().context("clone tail handle")?)
            }
            None => None,
        }
    };
    if let Some(file) = file {
        file.sync_data().context("fdatasync WAL tail")?;
    }
    Ok(())
}

/// Checks the magic number and format version of a segment file.
fn validate_segment_header(path: &Path) -> Result<()> {
    let mut file = File::open(path).context("open WAL segment")?;
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    file.read_exact(&mut header).context("read segment header")?;
    check_segment_header(&header)
}

pub(crate) fn check_segment_header(header: &[u8; SEGMENT_HEADER_SIZE as usize]) -> Result<()> {
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != WAL_MAGIC {
        return Err(StoreError::InvalidMagic {
            expected: WAL_MAGIC,
            actual: magic,
        });
    }
    if header[4] != WAL_FORMAT_VERSION {
        return Err(StoreError::UnsupportedFormat(header[4]));
    }
    Ok(())
}

/// A WAL that drops everything, for running without durability.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopWal;

impl NopWal {
    /// Does nothing.
    pub fn log_series(&self, _series: &[RefSeries]) -> Result<()> {
        Ok(())
    }

    /// Does nothing.
    pub fn log_samples(&self, _samples: &[RefSample]) -> Result<()> {
        Ok(())
    }

    /// Does nothing.
    pub fn log_deletes(&self, _stones: &[Stone]) -> Result<()> {
        Ok(())
    }

    /// Does nothing.
    pub fn truncate(&self, _mint: i64, _keep: impl Postings) -> Result<()> {
        Ok(())
    }

    /// Does nothing.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}
