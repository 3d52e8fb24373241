//! TLV (type-length-value) record mode (spec.md §4.8).
//!
//! A TLV record is just a KV entry with `key_len == 0`, whose first value
//! byte is the type tag (`value[0] == type`, `value[1..] == payload`). A
//! record with `val_len == 1` (type byte only, no payload) is a tombstone:
//! [`Nanokv::tlv_exists`]/[`Nanokv::tlv_get`] treat it as absent, but it
//! still occupies a history slot until GC reclaims it.
//!
//! Because every TLV record shares `key_len == 0`, resolving "the current
//! value of `ty`" the way plain KV resolves "the current value of `key`"
//! (scan for identical key bytes) would conflate every type in the store —
//! looking up type `0x20` would just as happily match the newest `0x10`
//! record, since they look identical to a key-only matcher. [`Nanokv::find_tlv`]
//! instead scopes that search to "same type tag", so reads/existence checks
//! never cross type boundaries.
//!
//! A TLV write never retires its predecessor the way a plain KV write
//! does: [`Nanokv::tlv_set`] always appends a brand new `VALID` record and
//! leaves every older revision of the type alone, so a type's whole
//! history stays walkable via [`Nanokv::tlv_get_history`] until GC (subject
//! to any registered retention policy) reclaims an old revision.

use crate::entry::{EntryHeader, HEADER_SIZE, MAX_KEY_LEN};
use crate::error::Error;
use crate::flash::Flash;
use crate::Nanokv;

const HISTORY_SCAN_CAP: usize = 32;

/// One retention policy: keep at most `keep_count` newest revisions of
/// `ty`; GC may reclaim anything older. `keep_count == 0` means "keep
/// nothing" (every revision but the live one is GC-eligible).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TlvRetention {
    pub ty: u8,
    pub keep_count: u16,
}

/// A retention policy resolved to a concrete flash address threshold,
/// snapshotted once per GC pass (bulk or incremental) before any record is
/// touched, so a policy change mid-pass can't see a half-migrated history.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TlvKeepInfo {
    pub ty: u8,
    pub threshold: u32,
}

/// A live TLV record as seen by the iterator: its type, payload length
/// (excluding the type byte), and the flash address of the payload itself
/// (not the entry header).
#[derive(Debug, Clone, Copy)]
pub struct TlvEntryInfo {
    pub ty: u8,
    pub len: u8,
    pub(crate) flash_addr: u32,
}

/// One historical revision of a TLV type, as returned by
/// [`Nanokv::tlv_get_history`]. `write_order` increases with recency (it's
/// the payload's flash address, which is monotonic within a GC epoch).
#[derive(Debug, Clone, Copy, Default)]
pub struct TlvHistoryEntry {
    pub ty: u8,
    pub len: u8,
    pub(crate) flash_addr: u32,
    pub write_order: u32,
}

/// A finite, non-restartable cursor over the ring's TLV records, in
/// on-flash order. Holds no borrow of the engine: advance it by passing it
/// back into [`Nanokv::tlv_iter_next`].
#[derive(Debug, Clone, Copy)]
pub struct TlvIter {
    sector_idx: u8,
    sector_offset: u32,
    finished: bool,
}

impl<F: Flash, const CACHE: usize, const RETENTION: usize> Nanokv<F, CACHE, RETENTION> {
    /// Find the most recent record (any state `VALID` or `PRE_DEL`) of
    /// `ty`, searching from the active sector backwards.
    pub(crate) fn find_tlv(&mut self, ty: u8) -> Result<Option<(u32, EntryHeader)>, Error> {
        let geometry = self.geometry;
        let count = geometry.sector_count();
        for i in 0..count {
            let idx = self.prev_sector(i);
            if !self.is_sector_valid(idx)? {
                continue;
            }
            let found = Self::find_in_sector(&mut self.flash, &geometry, idx, |flash, h, addr| {
                if !h.is_live() || h.key_len != 0 || h.val_len == 0 {
                    return Ok(false);
                }
                let mut tag = [0u8; 1];
                flash.read(addr + HEADER_SIZE as u32, &mut tag)?;
                Ok(tag[0] == ty)
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Appends a new revision of `ty` without ever retiring the previous
    /// one: every past revision stays `VALID` so [`Nanokv::tlv_get_history`]
    /// can walk the full chain. Only GC (respecting any registered
    /// retention policy) ever reclaims an old revision.
    fn tlv_commit(&mut self, ty: u8, payload: &[u8]) -> Result<(), Error> {
        let mut data = [0u8; crate::entry::MAX_VALUE_LEN];
        data[0] = ty;
        data[1..1 + payload.len()].copy_from_slice(payload);
        self.commit_entry(&[], &data[..1 + payload.len()], None, false)
    }

    /// Store `value` as the newest revision of TLV type `ty` (`1..=254`,
    /// `value.len() <= 254`). Older revisions persist (until GC or
    /// retention reclaims them) and remain visible via
    /// [`Nanokv::tlv_get_history`].
    pub fn tlv_set(&mut self, ty: u8, value: &[u8]) -> Result<(), Error> {
        if ty == 0 || value.is_empty() || value.len() > 254 {
            return Err(Error::Invalid);
        }
        self.tlv_commit(ty, value)
    }

    /// Read the live value of TLV type `ty` into `buf`, returning the
    /// number of bytes copied.
    pub fn tlv_get(&mut self, ty: u8, buf: &mut [u8]) -> Result<usize, Error> {
        if ty == 0 {
            return Err(Error::Invalid);
        }
        let (addr, header) = match self.find_tlv(ty)? {
            Some(found) if found.1.val_len > 1 => found,
            _ => return Err(Error::NotFound),
        };
        let len = (header.val_len as usize - 1).min(buf.len());
        self.flash.read(addr + HEADER_SIZE as u32 + 1, &mut buf[..len])?;
        Ok(len)
    }

    /// Write a tombstone for `ty`: it disappears from
    /// [`Nanokv::tlv_get`]/[`Nanokv::tlv_exists`], but the tombstone and
    /// prior revisions remain in history until GC reclaims them.
    pub fn tlv_delete(&mut self, ty: u8) -> Result<(), Error> {
        if ty == 0 {
            return Err(Error::Invalid);
        }
        self.tlv_commit(ty, &[])
    }

    pub fn tlv_exists(&mut self, ty: u8) -> bool {
        if ty == 0 {
            return false;
        }
        matches!(self.find_tlv(ty), Ok(Some((_, h))) if h.val_len > 1)
    }

    pub fn tlv_set_defaults(&mut self, defaults: &'static [crate::defaults::TlvDefault]) -> Result<(), Error> {
        self.tlv_defaults = Some(defaults);
        self.sync_version_for_tlv_defaults()
    }

    /// Read `ty`, falling back to its registered default if no live record
    /// exists.
    pub fn tlv_get_default(&mut self, ty: u8, buf: &mut [u8]) -> Result<usize, Error> {
        match self.tlv_get(ty, buf) {
            Ok(len) => Ok(len),
            Err(Error::NotFound) => {
                let def = self.find_tlv_default(ty).ok_or(Error::NotFound)?;
                let len = def.value.len().min(buf.len());
                buf[..len].copy_from_slice(&def.value[..len]);
                Ok(len)
            }
            Err(e) => Err(e),
        }
    }

    pub fn tlv_reset_type(&mut self, ty: u8) -> Result<(), Error> {
        let def = self.find_tlv_default(ty).ok_or(Error::NotFound)?;
        self.tlv_set(def.ty, def.value)
    }

    pub fn tlv_reset_all(&mut self) -> Result<(), Error> {
        let defaults = match self.tlv_defaults {
            Some(d) => d,
            None => return Ok(()),
        };
        for d in defaults {
            self.tlv_set(d.ty, d.value)?;
        }
        Ok(())
    }

    pub fn tlv_iter_init(&self) -> TlvIter {
        TlvIter {
            sector_idx: 0,
            sector_offset: self.geometry.align(crate::entry::SECTOR_HDR_SIZE as u32),
            finished: false,
        }
    }

    /// Advance `iter` to the next live TLV record in on-flash order
    /// (ascending sector index, then ascending offset within a sector).
    /// Visits both `VALID` and tombstone (`val_len == 1`) records, since
    /// history retrieval needs to see tombstones too; callers wanting only
    /// "currently set" types should check `info.len > 0`.
    pub fn tlv_iter_next(&mut self, iter: &mut TlvIter) -> Option<TlvEntryInfo> {
        if iter.finished {
            return None;
        }

        while iter.sector_idx < self.geometry.sector_count() {
            if !self.is_sector_valid(iter.sector_idx).unwrap_or(false) {
                iter.sector_idx += 1;
                iter.sector_offset = self.geometry.align(crate::entry::SECTOR_HDR_SIZE as u32);
                continue;
            }

            let sector = self.geometry.sector_addr(iter.sector_idx);
            let hdr_limit = self.geometry.sector_size() - self.geometry.align(HEADER_SIZE as u32);

            while iter.sector_offset <= hdr_limit {
                let addr = sector + iter.sector_offset;
                let mut hdr_buf = [0u8; HEADER_SIZE];
                if self.flash.read(addr, &mut hdr_buf).is_err() {
                    break;
                }
                let header = EntryHeader::from_bytes(hdr_buf);
                if header.is_erased() {
                    break;
                }

                iter.sector_offset +=
                    crate::entry::entry_size(header.key_len, header.val_len, self.geometry.align);

                if header.is_live() && header.key_len == 0 && header.val_len > 0 {
                    let mut tag = [0u8; 1];
                    if self.flash.read(addr + HEADER_SIZE as u32, &mut tag).is_ok() {
                        return Some(TlvEntryInfo {
                            ty: tag[0],
                            len: header.val_len - 1,
                            flash_addr: addr + HEADER_SIZE as u32 + 1,
                        });
                    }
                }
            }
            iter.sector_idx += 1;
            iter.sector_offset = self.geometry.align(crate::entry::SECTOR_HDR_SIZE as u32);
        }

        iter.finished = true;
        None
    }

    pub fn tlv_iter_read(&mut self, info: &TlvEntryInfo, buf: &mut [u8]) -> Result<usize, Error> {
        let len = (info.len as usize).min(buf.len());
        self.flash.read(info.flash_addr, &mut buf[..len])?;
        Ok(len)
    }

    /// Count and total payload-plus-overhead bytes of every live TLV record
    /// (tombstones included) currently on flash.
    pub fn tlv_stats(&mut self) -> (u16, u32) {
        let mut count = 0u16;
        let mut used = 0u32;
        let mut iter = self.tlv_iter_init();
        while let Some(info) = self.tlv_iter_next(&mut iter) {
            count += 1;
            used += 7 + info.len as u32;
        }
        (count, used)
    }

    pub fn tlv_has_data(&mut self) -> bool {
        let mut iter = self.tlv_iter_init();
        self.tlv_iter_next(&mut iter).is_some()
    }

    /// Collect up to `max` historical revisions of `ty`, newest first (an
    /// insertion sort over at most [`HISTORY_SCAN_CAP`] candidates, mirroring
    /// the original's fixed 32-entry scan buffer). Returns the number
    /// written into `out`.
    pub fn tlv_get_history(&mut self, ty: u8, out: &mut [TlvHistoryEntry]) -> Result<usize, Error> {
        if ty == 0 || out.is_empty() {
            return Err(Error::Invalid);
        }

        let mut tmp: heapless::Vec<TlvHistoryEntry, HISTORY_SCAN_CAP> = heapless::Vec::new();
        let mut iter = self.tlv_iter_init();
        while let Some(info) = self.tlv_iter_next(&mut iter) {
            if tmp.len() >= HISTORY_SCAN_CAP {
                break;
            }
            if info.ty == ty {
                let _ = tmp.push(TlvHistoryEntry {
                    ty,
                    len: info.len,
                    flash_addr: info.flash_addr,
                    write_order: info.flash_addr,
                });
            }
        }

        // Insertion sort, newest (highest write_order) first.
        for i in 1..tmp.len() {
            let item = tmp[i];
            let mut j = i;
            while j > 0 && tmp[j - 1].write_order < item.write_order {
                tmp[j] = tmp[j - 1];
                j -= 1;
            }
            tmp[j] = item;
        }

        let copy = tmp.len().min(out.len());
        out[..copy].copy_from_slice(&tmp[..copy]);
        Ok(copy)
    }

    pub fn tlv_read_history(&mut self, entry: &TlvHistoryEntry, buf: &mut [u8]) -> Result<usize, Error> {
        let len = (entry.len as usize).min(buf.len());
        self.flash.read(entry.flash_addr, &mut buf[..len])?;
        Ok(len)
    }

    /// Register (or update) a retention policy: GC keeps at most
    /// `keep_newest` revisions of `ty`. `ty == 0` is invalid (reserved).
    pub fn tlv_set_retention(&mut self, ty: u8, keep_newest: u16) -> Result<(), Error> {
        if ty == 0 {
            return Err(Error::Invalid);
        }
        if let Some(existing) = self.retention.iter_mut().find(|r| r.ty == ty) {
            existing.keep_count = keep_newest;
            return Ok(());
        }
        self.retention
            .push(TlvRetention { ty, keep_count: keep_newest })
            .map_err(|_| Error::Invalid)
    }

    pub fn tlv_clear_retention(&mut self, ty: u8) {
        if let Some(pos) = self.retention.iter().position(|r| r.ty == ty) {
            self.retention.remove(pos);
        }
    }

    fn find_tlv_keep_threshold(&mut self, ty: u8, keep: u16) -> Result<u32, Error> {
        let mut hist = [TlvHistoryEntry { ty, len: 0, flash_addr: 0, write_order: 0 }; HISTORY_SCAN_CAP];
        let count = self.tlv_get_history(ty, &mut hist)?;
        if count == 0 || count as u16 <= keep {
            return Ok(0);
        }
        Ok(hist[keep as usize].flash_addr - HEADER_SIZE as u32 - 1)
    }

    /// Snapshot every registered retention policy into a concrete
    /// flash-address threshold, before any GC pass touches a single
    /// record. Resolving thresholds lazily (inside the GC scan itself)
    /// would let a migration the scan has already performed shift where
    /// the "keep newest N" boundary falls mid-pass.
    pub(crate) fn prepare_tlv_keep_info(&mut self) -> Result<(), Error> {
        self.keep_info.clear();
        let retention = self.retention.clone();
        for r in retention.iter() {
            if r.keep_count == 0 {
                continue;
            }
            if self.keep_info.len() >= RETENTION {
                break;
            }
            let threshold = self.find_tlv_keep_threshold(r.ty, r.keep_count)?;
            let _ = self.keep_info.push(TlvKeepInfo { ty: r.ty, threshold });
        }
        Ok(())
    }

    pub(crate) fn should_migrate_tlv(&self, ty: u8, addr: u32) -> bool {
        match self.keep_info.iter().find(|k| k.ty == ty) {
            Some(k) if k.threshold != 0 => addr >= k.threshold,
            _ => true,
        }
    }

    fn sync_version_for_tlv_defaults(&mut self) -> Result<(), Error> {
        self.sync_version()
    }
}
