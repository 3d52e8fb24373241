//! The core engine: sector lifecycle, the two-phase commit protocol, and
//! plain-KV get/set/delete/exists (spec.md §4.2-§4.6, §4.9, §4.10).

use crate::cache::{Cache, CacheStats};
use crate::defaults::{
    find_kv_default, find_tlv_default, KvDefault, TlvDefault, DEFAULT_SETTING_VERSION, VERSION_KEY,
};
use crate::entry::{
    crc16, entry_size, seq_is_newer, EntryHeader, EntryState, SectorHeader, CRC_SIZE, HEADER_SIZE,
    MAGIC, MAX_ENTRY_SIZE, MAX_KEY_LEN, MAX_VALUE_LEN, SECTOR_HDR_SIZE,
};
use crate::error::Error;
use crate::flash::{is_erased, Flash, Geometry};
use crate::gc::GcState;
use crate::tlv::{TlvKeepInfo, TlvRetention};

/// Runtime knobs the original exposed as compile-time `NKV_*` flags.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Re-read and CRC-verify the key+value payload on every [`Nanokv::get`]
    /// rather than trusting the cached/scanned header alone.
    pub verify_on_read: bool,
    /// Heal `WRITING`-state entries left behind by a power loss mid-commit
    /// into `DELETED` while scanning a sector's write offset at boot.
    pub clean_on_boot: bool,
    /// How many candidate entries [`Nanokv::set`] migrates per call while an
    /// incremental GC pass is in flight (typical 1-4).
    pub gc_entries_per_write: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verify_on_read: true,
            clean_on_boot: true,
            gc_entries_per_write: 2,
        }
    }
}

/// Usage snapshot returned by [`Nanokv::usage`]: bytes written into the
/// active sector, and total addressable bytes across the whole ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub used: u32,
    pub total: u32,
}

/// A friendlier [`Usage`], with the percentage pre-computed, for the
/// startup diagnostic a port's init shim typically logs (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageReport {
    pub used: u32,
    pub total: u32,
    pub percent: f32,
}

/// A log-structured KV/TLV store over a NOR-flash partition.
///
/// `CACHE` sizes the LFU accelerator ([`crate::cache::Cache`]); `RETENTION`
/// bounds how many distinct TLV types can have a retention policy
/// registered at once. Both default to the sizes the original's
/// `NanoKV_cfg.h` ships with.
pub struct Nanokv<F: Flash, const CACHE: usize = 4, const RETENTION: usize = 8> {
    pub(crate) flash: F,
    pub(crate) geometry: Geometry,
    pub(crate) config: Config,
    pub(crate) initialized: bool,
    pub(crate) active_sector: u8,
    pub(crate) sector_seq: u16,
    pub(crate) write_offset: u32,
    pub(crate) gc: GcState,
    pub(crate) cache: Cache<CACHE>,
    pub(crate) defaults: Option<&'static [KvDefault]>,
    pub(crate) tlv_defaults: Option<&'static [TlvDefault]>,
    pub(crate) retention: heapless::Vec<TlvRetention, RETENTION>,
    pub(crate) keep_info: heapless::Vec<TlvKeepInfo, RETENTION>,
}

impl<F: Flash, const CACHE: usize, const RETENTION: usize> Nanokv<F, CACHE, RETENTION> {
    /// Build a fresh instance over `flash` with default runtime options.
    /// Does not touch the flash contents; call [`Nanokv::scan`] (or
    /// [`Nanokv::format`]) before any other operation.
    pub fn new(flash: F) -> Result<Self, Error> {
        Self::with_config(flash, Config::default())
    }

    pub fn with_config(flash: F, config: Config) -> Result<Self, Error> {
        let geometry = Geometry::new(&flash)?;
        let max_entry = HEADER_SIZE as u32 + MAX_KEY_LEN as u32 + MAX_VALUE_LEN as u32
            + CRC_SIZE as u32
            + geometry.align;
        if max_entry > geometry.sector_size() / 2 {
            return Err(Error::Invalid);
        }
        Ok(Nanokv {
            flash,
            geometry,
            config,
            initialized: false,
            active_sector: 0,
            sector_seq: 0,
            write_offset: 0,
            gc: GcState::new(),
            cache: Cache::new(),
            defaults: None,
            tlv_defaults: None,
            retention: heapless::Vec::new(),
            keep_info: heapless::Vec::new(),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Reclaim the underlying flash device, discarding all in-RAM engine
    /// state (cache, GC cursor, defaults). The flash contents are untouched;
    /// a later [`Nanokv::new`] + [`Nanokv::scan`] over the same device picks
    /// back up where this instance left off.
    pub fn release(self) -> F {
        self.flash
    }

    /// Scan the ring for the newest valid sector and recover `write_offset`,
    /// healing any `WRITING`-state entry a power loss interrupted. Formats a
    /// blank partition from scratch if no sector carries a valid header.
    /// Idempotent: a second call on an already-scanned instance is a no-op.
    pub fn scan(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }

        let mut found = false;
        let mut active_idx = 0u8;
        let mut max_seq = 0u16;

        for i in 0..self.geometry.sector_count() {
            if let Ok(hdr) = self.read_sector_header(i) {
                if hdr.is_valid() && (!found || seq_is_newer(hdr.seq, max_seq)) {
                    max_seq = hdr.seq;
                    active_idx = i;
                    found = true;
                }
            }
        }

        if !found {
            return self.format();
        }

        self.active_sector = active_idx;
        self.sector_seq = max_seq;
        self.write_offset = self.scan_write_offset(active_idx)?;
        self.initialized = true;

        self.sync_version()?;

        #[cfg(feature = "defmt")]
        {
            let u = self.usage_report();
            defmt::info!(
                "NanoKV OK! Size: {=u32}B, Usage: {=u32}/{=u32} ({=f32}%)",
                self.geometry.total_len(),
                u.used,
                u.total,
                u.percent
            );
        }
        Ok(())
    }

    /// Erase every sector and reinitialize the ring at sector 0, sequence 1.
    /// Destroys all stored data.
    pub fn format(&mut self) -> Result<(), Error> {
        for i in 0..self.geometry.sector_count() {
            let addr = self.geometry.sector_addr(i);
            if !is_erased(&mut self.flash, addr, self.geometry.sector_size())? {
                self.flash.erase(addr, addr + self.geometry.sector_size())?;
            }
        }

        let hdr = SectorHeader { magic: MAGIC, seq: 1 };
        let hdr_len = self.geometry.align(SECTOR_HDR_SIZE as u32);
        let mut buf = [0xFFu8; 32];
        buf[..SECTOR_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
        self.flash.write(self.geometry.sector_addr(0), &buf[..hdr_len as usize])?;

        self.active_sector = 0;
        self.sector_seq = 1;
        self.write_offset = self.geometry.align(SECTOR_HDR_SIZE as u32);
        self.initialized = true;
        Ok(())
    }

    pub(crate) fn read_sector_header(&mut self, idx: u8) -> Result<SectorHeader, Error> {
        let mut buf = [0u8; SECTOR_HDR_SIZE];
        self.flash.read(self.geometry.sector_addr(idx), &mut buf)?;
        Ok(SectorHeader::from_bytes(buf))
    }

    pub(crate) fn is_sector_valid(&mut self, idx: u8) -> Result<bool, Error> {
        Ok(self.read_sector_header(idx)?.is_valid())
    }

    /// Binary-probe for the erased tail, then linearly walk from the sector
    /// header to pin down the exact write offset and heal any dangling
    /// `WRITING` entry (spec.md §4.9).
    fn scan_write_offset(&mut self, idx: u8) -> Result<u32, Error> {
        let sector = self.geometry.sector_addr(idx);
        let sector_size = self.geometry.sector_size();
        let mut low = self.geometry.align(SECTOR_HDR_SIZE as u32);
        let mut high = sector_size;

        const PROBE_SIZE: u32 = 256;
        while high - low > PROBE_SIZE {
            let mid = self.geometry.align(low + (high - low) / 2);
            if is_erased(&mut self.flash, sector + mid, PROBE_SIZE)? {
                high = mid;
            } else {
                low = mid + PROBE_SIZE;
            }
        }

        let mut offset = self.geometry.align(SECTOR_HDR_SIZE as u32);
        while offset <= sector_size - self.geometry.align(HEADER_SIZE as u32) {
            let mut hdr_buf = [0u8; HEADER_SIZE];
            if self.flash.read(sector + offset, &mut hdr_buf).is_err() {
                break;
            }
            let header = EntryHeader::from_bytes(hdr_buf);

            if header.is_erased() {
                let tail = (sector_size - offset).min(32);
                if is_erased(&mut self.flash, sector + offset, tail)? {
                    break;
                }
            }

            if self.config.clean_on_boot
                && EntryState::from_u16(header.state) == Some(EntryState::Writing)
            {
                self.update_entry_state(sector + offset, EntryState::Deleted as u16)?;
            }

            let entry_sz = entry_size(header.key_len, header.val_len, self.geometry.align);
            if entry_sz < self.geometry.align(HEADER_SIZE as u32 + CRC_SIZE as u32) {
                break;
            }
            offset += entry_sz;
        }

        Ok(offset)
    }

    pub(crate) fn update_entry_state(&mut self, addr: u32, state: u16) -> Result<(), Error> {
        let mut buf = [0xFFu8; 32];
        buf[..2].copy_from_slice(&state.to_le_bytes());
        let align = self.geometry.align as usize;
        self.flash.write(addr, &buf[..align])?;
        Ok(())
    }

    pub(crate) fn switch_to_sector(&mut self, idx: u8) -> Result<(), Error> {
        let addr = self.geometry.sector_addr(idx);
        if !is_erased(&mut self.flash, addr, self.geometry.sector_size())? {
            self.flash.erase(addr, addr + self.geometry.sector_size())?;
        }

        let hdr = SectorHeader {
            magic: MAGIC,
            seq: self.sector_seq.wrapping_add(1),
        };
        let hdr_len = self.geometry.align(SECTOR_HDR_SIZE as u32);
        let mut buf = [0xFFu8; 32];
        buf[..SECTOR_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
        self.flash.write(addr, &buf[..hdr_len as usize])?;

        self.active_sector = idx;
        self.sector_seq = hdr.seq;
        self.write_offset = self.geometry.align(SECTOR_HDR_SIZE as u32);
        Ok(())
    }

    pub(crate) fn switch_to_next_sector(&mut self) -> Result<(), Error> {
        let next = (self.active_sector + 1) % self.geometry.sector_count();
        self.switch_to_sector(next)
    }

    pub(crate) fn find_free_sector(&mut self) -> Result<Option<u8>, Error> {
        let count = self.geometry.sector_count();
        for i in 1..count {
            let idx = (self.active_sector + i) % count;
            if !self.is_sector_valid(idx)? {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    pub(crate) fn prev_sector(&self, offset: u8) -> u8 {
        let count = self.geometry.sector_count() as u16;
        ((self.active_sector as u16 + count - (offset as u16 % count)) % count) as u8
    }

    /// Scan one sector, invoking `matches` on every live (non-erased) entry
    /// header in append order. Returns the *last* matching entry, since a
    /// later append always supersedes an earlier one within the same
    /// sector. `matches` receives the flash handle explicitly rather than
    /// capturing it, so it can read the candidate's key/type bytes without
    /// fighting the borrow checker over a second `&mut F`.
    pub(crate) fn find_in_sector(
        flash: &mut F,
        geometry: &Geometry,
        idx: u8,
        mut matches: impl FnMut(&mut F, &EntryHeader, u32) -> Result<bool, Error>,
    ) -> Result<Option<(u32, EntryHeader)>, Error> {
        let sector = geometry.sector_addr(idx);
        let mut offset = geometry.align(SECTOR_HDR_SIZE as u32);
        let mut found = None;

        while offset <= geometry.sector_size() - geometry.align(HEADER_SIZE as u32) {
            let mut hdr_buf = [0u8; HEADER_SIZE];
            flash.read(sector + offset, &mut hdr_buf)?;
            let header = EntryHeader::from_bytes(hdr_buf);
            if header.is_erased() {
                break;
            }
            let addr = sector + offset;
            if matches(flash, &header, addr)? {
                found = Some((addr, header));
            }
            offset += entry_size(header.key_len, header.val_len, geometry.align);
        }
        Ok(found)
    }

    /// Find `key` (exact match, `VALID` or `PRE_DEL` state) across the ring,
    /// searching from the active sector backwards so the newest write wins.
    pub(crate) fn find_key(&mut self, key: &[u8]) -> Result<Option<(u32, EntryHeader)>, Error> {
        let geometry = self.geometry;
        let count = geometry.sector_count();
        for i in 0..count {
            let idx = self.prev_sector(i);
            if !self.is_sector_valid(idx)? {
                continue;
            }
            let found = Self::find_in_sector(&mut self.flash, &geometry, idx, |flash, h, addr| {
                if !h.is_live() || h.key_len as usize != key.len() {
                    return Ok(false);
                }
                let mut tmp = [0u8; MAX_KEY_LEN];
                flash.read(addr + HEADER_SIZE as u32, &mut tmp[..key.len()])?;
                Ok(&tmp[..key.len()] == key)
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// The two-phase append-commit shared by plain KV and TLV writes. `old`
    /// is the predecessor entry to supersede, if any; `retire_old` controls
    /// whether that predecessor is walked through `PRE_DEL`/`DELETED` once
    /// the new entry lands.
    ///
    /// Plain KV writes always retire their predecessor (`retire_old: true`):
    /// a key has exactly one live revision. TLV writes never do
    /// (`retire_old: false`): every revision of a type stays `VALID` so
    /// [`Nanokv::tlv_get_history`] can walk the whole chain, and only GC
    /// (via retention, see [`crate::tlv`]) ever reclaims an old revision.
    pub(crate) fn commit_entry(
        &mut self,
        key: &[u8],
        value: &[u8],
        old: Option<(u32, EntryHeader)>,
        retire_old: bool,
    ) -> Result<(), Error> {
        let is_update = retire_old && old.map(|(_, h)| h.val_len > 0).unwrap_or(false);
        let size = entry_size(key.len() as u8, value.len() as u8, self.geometry.align);

        debug_assert!(
            size <= self.geometry.sector_size() - self.geometry.align(SECTOR_HDR_SIZE as u32),
            "entry_size exceeds sector capacity"
        );

        if self.write_offset + size > self.geometry.sector_size() {
            match self.find_free_sector()? {
                Some(idx) => self.switch_to_sector(idx)?,
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::trace!("no free sector, running bulk compaction");
                    self.do_compact()?;
                }
            }
            if self.write_offset + size > self.geometry.sector_size() {
                #[cfg(feature = "defmt")]
                defmt::warn!("write of {=u32} bytes does not fit after compaction", size);
                return Err(Error::NoSpace);
            }
        }

        if let (Some((old_addr, _)), true) = (old, is_update) {
            self.update_entry_state(old_addr, EntryState::PreDel as u16)?;
        }

        let mut buf = [0xFFu8; MAX_ENTRY_SIZE];
        let sz = size as usize;
        let header = EntryHeader {
            state: EntryState::Writing as u16,
            key_len: key.len() as u8,
            val_len: value.len() as u8,
        };
        buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        buf[HEADER_SIZE..HEADER_SIZE + key.len()].copy_from_slice(key);
        buf[HEADER_SIZE + key.len()..HEADER_SIZE + key.len() + value.len()].copy_from_slice(value);
        let crc = crc16(&buf[HEADER_SIZE..HEADER_SIZE + key.len() + value.len()]);
        let crc_off = HEADER_SIZE + key.len() + value.len();
        buf[crc_off..crc_off + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());

        let new_addr = self.geometry.sector_addr(self.active_sector) + self.write_offset;
        self.flash.write(new_addr, &buf[..sz])?;
        self.update_entry_state(new_addr, EntryState::Valid as u16)?;

        if let (Some((old_addr, _)), true) = (old, is_update) {
            self.update_entry_state(old_addr, EntryState::Deleted as u16)?;
        }

        self.write_offset += size;

        if !key.is_empty() {
            if value.is_empty() {
                self.cache.remove(key);
            } else {
                self.cache.update(key, value);
            }
        }

        self.do_incremental_gc()?;
        Ok(())
    }

    /// Store `value` under `key` (`1..=15` bytes), superseding any existing
    /// value for that key. `value.len() == 0` deletes the key (see
    /// [`Nanokv::delete`]).
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::Invalid);
        }
        let kb = key.as_bytes();
        if kb.is_empty() || kb.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
            return Err(Error::Invalid);
        }
        let old = self.find_key(kb)?;
        self.commit_entry(kb, value, old, true)
    }

    /// Fetch `key`'s value into `buf`, returning the number of bytes copied
    /// (truncated to `buf.len()` if the stored value is longer). Checks the
    /// cache first; on a flash read, optionally re-verifies the record's
    /// CRC per [`Config::verify_on_read`].
    pub fn get(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.initialized {
            return Err(Error::Invalid);
        }
        let kb = key.as_bytes();
        if kb.is_empty() || kb.len() > MAX_KEY_LEN {
            return Err(Error::Invalid);
        }

        if let Some(len) = self.cache.lookup(kb, buf) {
            return Ok(len);
        }

        let (addr, header) = match self.find_key(kb)? {
            Some(found) if found.1.val_len > 0 => found,
            _ => return Err(Error::NotFound),
        };

        let len = (header.val_len as usize).min(buf.len());

        if self.config.verify_on_read {
            let data_len = header.key_len as usize + header.val_len as usize;
            let mut verify_buf = [0u8; MAX_KEY_LEN + MAX_VALUE_LEN];
            self.flash
                .read(addr + HEADER_SIZE as u32, &mut verify_buf[..data_len])?;
            let mut stored_crc = [0u8; CRC_SIZE];
            self.flash
                .read(addr + HEADER_SIZE as u32 + data_len as u32, &mut stored_crc)?;
            if crc16(&verify_buf[..data_len]) != u16::from_le_bytes(stored_crc) {
                #[cfg(feature = "defmt")]
                defmt::warn!("CRC mismatch reading key at {=u32}", addr);
                return Err(Error::Crc);
            }
            buf[..len].copy_from_slice(&verify_buf[header.key_len as usize..header.key_len as usize + len]);
        } else {
            self.flash
                .read(addr + HEADER_SIZE as u32 + header.key_len as u32, &mut buf[..len])?;
        }

        self.cache.update(kb, &buf[..len]);
        Ok(len)
    }

    /// Delete `key`. A no-op (not an error) if the key has no live value.
    pub fn delete(&mut self, key: &str) -> Result<(), Error> {
        self.set(key, &[])
    }

    /// Does `key` currently hold a non-empty value? Swallows flash errors as
    /// `false`, matching the infallible boolean the original exposes.
    pub fn exists(&mut self, key: &str) -> bool {
        if !self.initialized {
            return false;
        }
        let kb = key.as_bytes();
        if kb.is_empty() || kb.len() > MAX_KEY_LEN {
            return false;
        }
        matches!(self.find_key(kb), Ok(Some((_, h))) if h.val_len > 0)
    }

    /// Bytes written into the active sector, and total addressable bytes
    /// across the whole ring.
    pub fn usage(&self) -> Usage {
        Usage {
            used: self.write_offset,
            total: self.geometry.total_len(),
        }
    }

    /// [`Nanokv::usage`] with the percentage pre-computed, for logging.
    pub fn usage_report(&self) -> UsageReport {
        let u = self.usage();
        let percent = if u.total > 0 {
            u.used as f32 / u.total as f32 * 100.0
        } else {
            0.0
        };
        UsageReport {
            used: u.used,
            total: u.total,
            percent,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_clear(&mut self) {
        self.cache.clear();
    }

    /// Manually advance an in-flight incremental GC pass by up to `steps`
    /// quanta (starting one if none is active and free space has run low).
    /// Returns whether a pass is still active afterwards.
    pub fn gc_step(&mut self, steps: u8) -> Result<bool, Error> {
        if !self.initialized {
            return Err(Error::Invalid);
        }
        if !self.gc.active && self.should_start_gc()? {
            self.start_incremental_gc()?;
        }
        if !self.gc.active {
            return Ok(false);
        }
        for _ in 0..steps {
            if !self.incremental_gc_step()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn gc_active(&self) -> bool {
        self.gc.active
    }

    pub(crate) fn sync_version(&mut self) -> Result<(), Error> {
        if !self.initialized {
            return Ok(());
        }

        let mut ver_buf = [0u8; 4];
        let synced = matches!(self.get(VERSION_KEY, &mut ver_buf), Ok(4))
            && u32::from_le_bytes(ver_buf) == DEFAULT_SETTING_VERSION;

        if synced {
            return Ok(());
        }

        if let Some(defaults) = self.defaults {
            for d in defaults {
                if !self.exists(d.key) {
                    self.set(d.key, d.value)?;
                }
            }
        }
        if let Some(defaults) = self.tlv_defaults {
            for d in defaults {
                if d.ty != 0 && !self.tlv_exists(d.ty) {
                    self.tlv_set(d.ty, d.value)?;
                }
            }
        }

        self.set(VERSION_KEY, &DEFAULT_SETTING_VERSION.to_le_bytes())
    }

    /// Register the KV default-value table and immediately run a version
    /// sync against it.
    pub fn set_defaults(&mut self, defaults: &'static [KvDefault]) -> Result<(), Error> {
        self.defaults = Some(defaults);
        self.sync_version()
    }

    pub fn find_default(&self, key: &str) -> Option<&'static KvDefault> {
        self.defaults.and_then(|d| find_kv_default(d, key))
    }

    /// Read `key`, falling back to its registered default if no live value
    /// exists.
    pub fn get_default(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, Error> {
        match self.get(key, buf) {
            Ok(len) => Ok(len),
            Err(Error::NotFound) => {
                let def = self.find_default(key).ok_or(Error::NotFound)?;
                let len = def.value.len().min(buf.len());
                buf[..len].copy_from_slice(&def.value[..len]);
                Ok(len)
            }
            Err(e) => Err(e),
        }
    }

    pub fn reset_key(&mut self, key: &str) -> Result<(), Error> {
        let def = self.find_default(key).ok_or(Error::NotFound)?;
        self.set(key, def.value)
    }

    pub fn reset_all(&mut self) -> Result<(), Error> {
        let defaults = self.defaults.ok_or(Error::Invalid)?;
        for d in defaults {
            self.set(d.key, d.value)?;
        }
        Ok(())
    }

    pub(crate) fn find_tlv_default(&self, ty: u8) -> Option<&'static TlvDefault> {
        self.tlv_defaults.and_then(|d| find_tlv_default(d, ty))
    }
}
