//! WAL replay: frame-by-frame segment reading with corruption recovery.

use super::record::{self, RefSample, RefSeries, Stone, WalEntryType};
use super::{
    check_segment_header, TailWriter, WalInner, ENTRY_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use crate::encoding::{checksum, checksum_append};
use crate::error::{IoResultExt, Result};
use crate::fileutil;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// One step of a segment frame walk.
pub(crate) enum Frame {
    /// A fully verified entry.
    Entry {
        etype: WalEntryType,
        #[allow(dead_code)]
        flag: u8,
        payload: Vec<u8>,
    },
    /// Clean end of the segment: end of file or preallocated zero space.
    End,
    /// A torn or corrupt frame; the walk cannot continue.
    Corrupt { reason: &'static str },
}

/// Sequential reader over the frames of one segment file.
pub(crate) struct FrameReader {
    r: BufReader<File>,
    offset: u64,
}

impl FrameReader {
    /// Opens a segment, validates its header and positions after it.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).context("open WAL segment")?;
        let mut r = BufReader::new(file);
        let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
        r.read_exact(&mut header).context("read segment header")?;
        check_segment_header(&header)?;
        Ok(Self {
            r,
            offset: SEGMENT_HEADER_SIZE,
        })
    }

    /// Byte offset of the next frame, i.e. the end of the last valid one.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads and verifies the next frame.
    ///
    /// Only I/O failures are errors; torn writes and bad checksums are
    /// reported as [`Frame::Corrupt`] so the caller can repair the log.
    pub(crate) fn next(&mut self) -> Result<Frame> {
        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        let n = read_full(&mut self.r, &mut header).context("read entry header")?;
        if n == 0 || header[0] == 0 {
            // End of file, or the zeroed preallocated region of the tail.
            return Ok(Frame::End);
        }
        if n < header.len() {
            return Ok(Frame::Corrupt {
                reason: "torn entry header",
            });
        }

        let Some(etype) = WalEntryType::from_u8(header[0]) else {
            return Ok(Frame::Corrupt {
                reason: "invalid entry type",
            });
        };
        let flag = header[1];
        let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

        let mut payload = Vec::new();
        let got = (&mut self.r)
            .take(len as u64)
            .read_to_end(&mut payload)
            .context("read entry payload")?;
        if got < len {
            return Ok(Frame::Corrupt {
                reason: "torn entry body",
            });
        }

        let mut crc_bytes = [0u8; 4];
        if read_full(&mut self.r, &mut crc_bytes).context("read entry checksum")? < 4 {
            return Ok(Frame::Corrupt {
                reason: "torn entry checksum",
            });
        }
        let expected = u32::from_be_bytes(crc_bytes);
        let actual = checksum_append(checksum(&header), &payload);
        if actual != expected {
            return Ok(Frame::Corrupt {
                reason: "checksum mismatch",
            });
        }

        self.offset += ENTRY_HEADER_SIZE + len as u64 + 4;
        Ok(Frame::Entry {
            etype,
            flag,
            payload,
        })
    }
}

/// Reads until `buf` is full or the reader hits EOF; returns bytes read.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Replays WAL entries in write order.
///
/// The reader walks a snapshot of the segment list taken when it was
/// created. Samples older than `mint` are dropped before delivery; deletes
/// are always delivered. When a torn tail is found the log is truncated back
/// to the last fully written entry, the writer resumes at that offset, and
/// replay reports success.
pub struct WalReader {
    inner: Arc<Mutex<WalInner>>,
    segments: Vec<(u64, PathBuf)>,
    mint: i64,
}

impl WalReader {
    pub(crate) fn new(
        inner: Arc<Mutex<WalInner>>,
        segments: Vec<(u64, PathBuf)>,
        mint: i64,
    ) -> Self {
        Self {
            inner,
            segments,
            mint,
        }
    }

    /// Reads every entry, dispatching each batch to the matching callback.
    ///
    /// Entries are delivered in the exact order they were written. Errors
    /// returned by a callback abort the replay.
    pub fn read<SF, MF, DF>(
        self,
        mut on_series: SF,
        mut on_samples: MF,
        mut on_deletes: DF,
    ) -> Result<()>
    where
        SF: FnMut(Vec<RefSeries>) -> Result<()>,
        MF: FnMut(Vec<RefSample>) -> Result<()>,
        DF: FnMut(Vec<Stone>) -> Result<()>,
    {
        let mut maxts: Vec<(u64, i64)> = Vec::new();

        for (i, (seq, path)) in self.segments.iter().enumerate() {
            let mut fr = FrameReader::open(path)?;
            let mut seg_maxt = 0i64;
            loop {
                let last_valid = fr.offset();
                match fr.next()? {
                    Frame::End => break,
                    Frame::Corrupt { reason } => {
                        warn!(
                            segment = seq,
                            offset = last_valid,
                            reason,
                            "WAL corruption detected; truncating"
                        );
                        maxts.push((*seq, seg_maxt));
                        self.repair(i, last_valid)?;
                        self.apply_maxts(&maxts);
                        return Ok(());
                    }
                    Frame::Entry { etype, payload, .. } => match etype {
                        WalEntryType::Series => on_series(record::decode_series(&payload)?)?,
                        WalEntryType::Samples => {
                            let samples = record::decode_samples(&payload)?;
                            let valid: Vec<RefSample> = samples
                                .into_iter()
                                .filter(|s| s.t >= self.mint)
                                .collect();
                            for s in &valid {
                                if seg_maxt < s.t {
                                    seg_maxt = s.t;
                                }
                            }
                            on_samples(valid)?;
                        }
                        WalEntryType::Deletes => on_deletes(record::decode_deletes(&payload)?)?,
                    },
                }
            }
            maxts.push((*seq, seg_maxt));
        }

        self.apply_maxts(&maxts);
        Ok(())
    }

    /// Truncates the corrupt segment to `offset`, removes all later segments
    /// and installs the writer tail at the truncated position.
    fn repair(&self, seg_idx: usize, offset: u64) -> Result<()> {
        let (seq, path) = &self.segments[seg_idx];

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context("open segment for repair")?;
        file.set_len(offset).context("truncate corrupt segment")?;
        file.sync_data().context("fdatasync repaired segment")?;
        file.seek(SeekFrom::Start(offset))
            .context("seek repaired segment")?;

        for (_, later) in &self.segments[seg_idx + 1..] {
            fs::remove_file(later).context("remove WAL segment")?;
        }

        let mut inner = self.inner.lock();
        fileutil::sync_dir(&inner.dir)?;
        inner.segments.retain(|s| s.seq <= *seq);
        inner.tail = Some(TailWriter::new(file, offset));
        Ok(())
    }

    /// Records the maximum delivered sample timestamp per segment; later
    /// used by truncation to find obsolete segments.
    fn apply_maxts(&self, maxts: &[(u64, i64)]) {
        let mut inner = self.inner.lock();
        for &(seq, maxt) in maxts {
            if let Some(seg) = inner.segments.iter_mut().find(|s| s.seq == seq) {
                if seg.maxt < maxt {
                    seg.maxt = maxt;
                }
            }
        }
    }
}
