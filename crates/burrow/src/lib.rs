//! Burrow - durability and lookup core of a local time-series database.
//!
//! This crate provides the two on-disk structures a TSDB head depends on:
//!
//! - [`SegmentWal`]: a segmented, CRC-guarded write-ahead log of series
//!   creations, sample appends and tombstones, with crash recovery and
//!   compacting truncation
//! - [`IndexWriter`] / [`IndexReader`]: the immutable per-block index file
//!   mapping label matchers to the chunks containing matching series,
//!   written once per block flush and read through a memory map
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow::{RefSample, RefSeries, SegmentWal, WalOptions};
//!
//! let wal = SegmentWal::open("data/wal", WalOptions::default())?;
//!
//! // Replay existing entries into the head before logging new ones.
//! wal.reader(0).read(
//!     |series| Ok(head.restore_series(series)),
//!     |samples| Ok(head.restore_samples(samples)),
//!     |stones| Ok(head.restore_deletes(stones)),
//! )?;
//!
//! wal.log_series(&[RefSeries { series_ref: 1, labels }])?;
//! wal.log_samples(&[RefSample { series_ref: 1, t: 1000, v: 0.5 }])?;
//! ```

#![deny(missing_docs)]

pub mod encoding;
pub mod error;
pub mod fileutil;
pub mod index;
pub mod labels;
pub mod postings;
pub mod wal;

pub use error::{Result, StoreError};
pub use index::{ChunkMeta, IndexReader, IndexWriter, SectionPostings, StringTuples};
pub use labels::{Label, Labels};
pub use postings::{EmptyPostings, ListPostings, Postings};
pub use wal::{
    NopWal, RefSample, RefSeries, SegmentWal, Stone, TimeRange, WalOptions, WalReader,
};
