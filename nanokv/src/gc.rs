//! Bulk and incremental garbage collection (spec.md §4.5, §4.6).
//!
//! Both reclaim sectors by copying still-referenced entries forward into
//! the active sector and dropping everything else; they share the same
//! dedup bitmap and `migrate_entry` primitive, differing only in whether
//! they run to completion in one call (bulk) or a few entries at a time
//! across many calls (incremental).

use crate::entry::{entry_size, EntryHeader, EntryState, HEADER_SIZE, MAX_ENTRY_SIZE, MAX_KEY_LEN};
use crate::error::Error;
use crate::flash::Flash;
use crate::Nanokv;

/// In-progress incremental GC cursor: which sector is being drained, how
/// far into it, and the dedup bitmap accumulated so far.
pub(crate) struct GcState {
    pub active: bool,
    pub src_sector: u8,
    pub src_offset: u32,
    pub bitmap: [u8; 32],
}

impl GcState {
    pub fn new() -> Self {
        GcState {
            active: false,
            src_sector: 0,
            src_offset: 0,
            bitmap: [0; 32],
        }
    }
}

/// `key[..len] -> 8-bit` rolling hash (matches the original's
/// `hash = hash * 31 + key[i]`, truncated to a byte) used to index the
/// 256-bit dedup bitmap.
pub(crate) fn hash_key(key: &[u8]) -> u8 {
    let mut hash: u16 = 0;
    for &b in key {
        hash = hash.wrapping_mul(31).wrapping_add(b as u16);
    }
    (hash & 0xFF) as u8
}

pub(crate) fn bitmap_set(bitmap: &mut [u8; 32], bit: u8) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

pub(crate) fn bitmap_test(bitmap: &[u8; 32], bit: u8) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

/// Copy the entry at `src` (whose header is `header`) to the end of the
/// active sector. Returns [`Error::NoSpace`] if it doesn't fit in what's
/// left of the active sector; callers decide whether to switch sectors and
/// retry.
fn migrate_entry<F: Flash, const CACHE: usize, const RETENTION: usize>(
    nk: &mut Nanokv<F, CACHE, RETENTION>,
    src: u32,
    header: &EntryHeader,
) -> Result<(), Error> {
    let size = entry_size(header.key_len, header.val_len, nk.geometry.align);
    if nk.write_offset + size > nk.geometry.sector_size() {
        return Err(Error::NoSpace);
    }
    let mut buf = [0u8; MAX_ENTRY_SIZE];
    let sz = size as usize;
    nk.flash.read(src, &mut buf[..sz])?;

    let dest = nk.geometry.sector_addr(nk.active_sector) + nk.write_offset;
    nk.flash.write(dest, &buf[..sz])?;
    nk.write_offset += size;
    Ok(())
}

impl<F: Flash, const CACHE: usize, const RETENTION: usize> Nanokv<F, CACHE, RETENTION> {
    /// Is `addr`'s key already known-copied into the active sector this GC
    /// pass (exact match on collision, not just the hash)?
    fn already_migrated(
        &mut self,
        bitmap: &[u8; 32],
        key: &[u8],
        hash: u8,
    ) -> Result<bool, Error> {
        if !bitmap_test(bitmap, hash) {
            return Ok(false);
        }
        let geometry = self.geometry;
        let active = self.active_sector;
        let found = Self::find_in_sector(&mut self.flash, &geometry, active, |flash, h, addr| {
            if !h.is_live() || h.key_len as usize != key.len() {
                return Ok(false);
            }
            let mut tmp = [0u8; MAX_KEY_LEN];
            flash.read(addr + HEADER_SIZE as u32, &mut tmp[..key.len()])?;
            Ok(&tmp[..key.len()] == key)
        })?;
        Ok(found.is_some())
    }

    /// One entry worth of GC work, shared by the bulk and incremental
    /// passes: skip dead/in-progress states, honor TLV retention, dedup
    /// against what's already been copied, and migrate if still live.
    ///
    /// TLV entries never go through the key-dedup path below: every TLV
    /// record shares `key_len == 0`, so hashing/matching on "the key" would
    /// treat every live revision of every type as a duplicate of every
    /// other and silently drop all but one per GC pass. Identity for a TLV
    /// record is "is this revision still retention-eligible"
    /// ([`Nanokv::should_migrate_tlv`]), already checked above; once that
    /// passes it is always migrated.
    fn gc_visit_entry(
        &mut self,
        addr: u32,
        header: &EntryHeader,
        bitmap: &mut [u8; 32],
    ) -> Result<(), Error> {
        if header.is_tlv() {
            let mut ty = [0u8; 1];
            self.flash.read(addr + HEADER_SIZE as u32, &mut ty)?;
            if !self.should_migrate_tlv(ty[0], addr) {
                return Ok(());
            }
            return match migrate_entry(self, addr, header) {
                Ok(()) => Ok(()),
                Err(Error::NoSpace) => {
                    self.switch_to_next_sector()?;
                    *bitmap = [0u8; 32];
                    migrate_entry(self, addr, header)
                }
                Err(e) => Err(e),
            };
        }

        let mut key = [0u8; MAX_KEY_LEN];
        self.flash
            .read(addr + HEADER_SIZE as u32, &mut key[..header.key_len as usize])?;
        let key = &key[..header.key_len as usize];
        let hash = hash_key(key);

        if self.already_migrated(bitmap, key, hash)? {
            return Ok(());
        }

        match migrate_entry(self, addr, header) {
            Ok(()) => {}
            Err(Error::NoSpace) => {
                self.switch_to_next_sector()?;
                *bitmap = [0u8; 32];
                migrate_entry(self, addr, header)?;
            }
            Err(e) => return Err(e),
        }
        bitmap_set(bitmap, hash);
        Ok(())
    }

    /// Bulk-compact the whole ring into a fresh active sector in one call:
    /// switch to a new sector, then walk every other sector oldest-first,
    /// copying forward only the newest live revision of each key.
    pub(crate) fn do_compact(&mut self) -> Result<(), Error> {
        self.prepare_tlv_keep_info()?;
        self.switch_to_next_sector()?;

        let mut bitmap = [0u8; 32];
        let count = self.geometry.sector_count();

        for s in 1..count {
            let idx = self.prev_sector(s);
            if !self.is_sector_valid(idx)? {
                continue;
            }

            let sector = self.geometry.sector_addr(idx);
            let mut offset = self.geometry.align(crate::entry::SECTOR_HDR_SIZE as u32);

            loop {
                if offset > self.geometry.sector_size() - self.geometry.align(HEADER_SIZE as u32) {
                    break;
                }
                let mut hdr_buf = [0u8; HEADER_SIZE];
                self.flash.read(sector + offset, &mut hdr_buf)?;
                let header = EntryHeader::from_bytes(hdr_buf);
                if header.is_erased() {
                    break;
                }
                let size = entry_size(header.key_len, header.val_len, self.geometry.align);

                if EntryState::from_u16(header.state) == Some(EntryState::Valid) && header.val_len > 0 {
                    self.gc_visit_entry(sector + offset, &header, &mut bitmap)?;
                }
                offset += size;
            }
        }
        Ok(())
    }

    pub(crate) fn count_free_sectors(&mut self) -> Result<u8, Error> {
        let mut count = 0;
        for i in 0..self.geometry.sector_count() {
            if !self.is_sector_valid(i)? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub(crate) fn should_start_gc(&mut self) -> Result<bool, Error> {
        if self.gc.active {
            return Ok(false);
        }
        Ok(self.count_free_sectors()? < 1)
    }

    /// Pick the oldest (lowest-sequence) non-active sector as the next GC
    /// source. Returns `false` if there's nothing to reclaim (every sector
    /// is already erased/invalid).
    pub(crate) fn start_incremental_gc(&mut self) -> Result<bool, Error> {
        self.prepare_tlv_keep_info()?;

        let mut oldest_idx = 0u8;
        let mut oldest_seq = 0u16;
        let mut any = false;

        for i in 0..self.geometry.sector_count() {
            if i == self.active_sector {
                continue;
            }
            if let Ok(hdr) = self.read_sector_header(i) {
                if hdr.is_valid() && (!any || crate::entry::seq_is_newer(oldest_seq, hdr.seq)) {
                    oldest_seq = hdr.seq;
                    oldest_idx = i;
                    any = true;
                }
            }
        }

        if !any {
            return Ok(false);
        }

        self.gc.src_sector = oldest_idx;
        self.gc.src_offset = self.geometry.align(crate::entry::SECTOR_HDR_SIZE as u32);
        self.gc.active = true;
        self.gc.bitmap = [0u8; 32];
        Ok(true)
    }

    /// Process entries in the GC source sector until one candidate (a
    /// `VALID`, nonzero-length, retention-eligible entry) has been handled,
    /// or the sector is exhausted. Returns `true` if a pass is still (or
    /// newly) in progress, `false` once this source sector has been fully
    /// drained and erased.
    pub(crate) fn incremental_gc_step(&mut self) -> Result<bool, Error> {
        if !self.gc.active {
            return Ok(false);
        }

        let sector = self.geometry.sector_addr(self.gc.src_sector);
        let hdr_limit = self.geometry.sector_size() - self.geometry.align(HEADER_SIZE as u32);

        while self.gc.src_offset <= hdr_limit {
            let mut hdr_buf = [0u8; HEADER_SIZE];
            self.flash.read(sector + self.gc.src_offset, &mut hdr_buf)?;
            let header = EntryHeader::from_bytes(hdr_buf);
            if header.is_erased() {
                break;
            }
            let size = entry_size(header.key_len, header.val_len, self.geometry.align);

            if EntryState::from_u16(header.state) != Some(EntryState::Valid) || header.val_len == 0 {
                self.gc.src_offset += size;
                continue;
            }

            let addr = sector + self.gc.src_offset;
            if header.is_tlv() {
                let mut ty = [0u8; 1];
                self.flash.read(addr + HEADER_SIZE as u32, &mut ty)?;
                if !self.should_migrate_tlv(ty[0], addr) {
                    self.gc.src_offset += size;
                    continue;
                }
            }

            let mut bitmap = self.gc.bitmap;
            self.gc_visit_entry(addr, &header, &mut bitmap)?;
            self.gc.bitmap = bitmap;

            self.gc.src_offset += size;
            return Ok(true);
        }

        let src_addr = self.geometry.sector_addr(self.gc.src_sector);
        self.flash.erase(src_addr, src_addr + self.geometry.sector_size())?;
        self.gc.active = false;

        if self.count_free_sectors()? < 1 {
            self.start_incremental_gc()?;
        }
        Ok(false)
    }

    /// Run up to [`crate::engine::Config::gc_entries_per_write`] incremental
    /// steps after a write, starting a new pass first if free space has run
    /// low. Called automatically from [`Nanokv::commit_entry`].
    pub(crate) fn do_incremental_gc(&mut self) -> Result<(), Error> {
        if !self.gc.active && self.should_start_gc()? {
            if !self.start_incremental_gc()? {
                return Ok(());
            }
        }
        if self.gc.active {
            for _ in 0..self.config.gc_entries_per_write {
                if !self.incremental_gc_step()? {
                    break;
                }
            }
        }
        Ok(())
    }
}
