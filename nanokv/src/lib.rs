//! NanoKV: a log-structured, append-only key-value store for small
//! NOR-flash partitions.
//!
//! # What storage do we need?
//!
//!  - Durable, power-fail-safe storage of short keys (<=15 bytes) mapped to
//!    short values (<=255 bytes), on a partition as small as a few hundred
//!    kilobytes.
//!  - Survive a power cut at any point during a write: a reader must always
//!    see either the old value or the new one, never a torn mix, and never
//!    data that fails its checksum.
//!  - Reclaim space without a writer ever stalling waiting for a whole-log
//!    compaction: [`Nanokv::set`] interleaves a few steps of garbage
//!    collection into every write it performs.
//!  - An auxiliary type-indexed record mode (TLV, see [`tlv`]) that keeps a
//!    bounded history of past revisions instead of just the latest one, for
//!    callers who want "what was this last set to" rather than "what is
//!    this now".
//!
//! # Flash system primitives
//!
//! The engine assumes nothing about the underlying flash device beyond what
//! [`Flash`] requires: byte-granular reads from anywhere in the partition,
//! alignment-granular programs that only ever clear bits (never set them)
//! until the next erase, and whole-sector erases that reset every bit back
//! to `1`. This matches ordinary NOR flash and is exactly the contract
//! `embedded-storage`'s `NorFlash`/`MultiwriteNorFlash` traits describe.
//!
//! # On-flash layout
//!
//! ```text
//! sector:  [ SectorHeader | Entry | Entry | ... | (erased tail) ]
//! ```
//!
//! A [`SectorHeader`](entry) carries a magic constant and a 16-bit
//! monotonic sequence number; the sector with the highest sequence number
//! (compared modulo 2^16, see [`entry::seq_is_newer`]) is the one currently
//! receiving writes. Each entry is a small header (state, key length, value
//! length), the key and value bytes, and a trailing CRC-16; see [`entry`]
//! for the exact byte layout and the five-state commit lattice that lets
//! `set` survive a power cut at any point.
//!
//! Disabling the accelerators in [`cache`] changes nothing about what `get`
//! returns, only how fast it returns it; garbage collection in [`gc`] (both
//! the bulk and incremental variants) never drops a key that was live when
//! the pass started.
#![no_std]

mod cache;
mod defaults;
mod engine;
mod entry;
mod error;
mod flash;
mod gc;
mod tlv;

pub use cache::CacheStats;
pub use defaults::{KvDefault, TlvDefault};
pub use engine::{Config, Nanokv, Usage, UsageReport};
pub use entry::{MAX_KEY_LEN, MAX_VALUE_LEN};
pub use error::Error;
pub use flash::Flash;
pub use tlv::{TlvEntryInfo, TlvHistoryEntry, TlvIter};
