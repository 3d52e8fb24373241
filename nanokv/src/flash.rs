//! The flash driver contract and sector-geometry bookkeeping.
//!
//! Corresponds to spec.md §4.1/§4.2. The three callbacks spec.md describes
//! (`read`/`write`/`erase`) are expressed as the `embedded-storage` crate's
//! `MultiwriteNorFlash` trait rather than function pointers: our append
//! protocol writes the same state cell more than once between erases
//! (WRITING -> VALID -> DELETED), which is exactly what `MultiwriteNorFlash`
//! promises a driver supports.

use crate::error::Error;
use embedded_storage::nor_flash::MultiwriteNorFlash;
use flash_layout::Region;

/// A flash partition NanoKV can run on top of.
///
/// Blanket-implemented for any `MultiwriteNorFlash`; there's nothing to
/// implement by hand beyond `embedded-storage`'s own traits.
pub trait Flash: MultiwriteNorFlash {}
impl<T: MultiwriteNorFlash> Flash for T {}

/// Sector-ring geometry derived once at [`crate::Nanokv::new`] time from the
/// flash implementor's associated constants and capacity.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub region: Region,
    pub align: u32,
}

impl Geometry {
    pub fn new<F: Flash>(flash: &F) -> Result<Self, Error> {
        let align = F::WRITE_SIZE as u32;
        let sector_size = F::ERASE_SIZE as u32;
        let capacity = flash.capacity() as u32;

        if align < 2 || !align.is_power_of_two() {
            return Err(Error::Invalid);
        }
        if sector_size == 0 || capacity < sector_size * 2 {
            return Err(Error::Invalid);
        }
        let sector_count = capacity / sector_size;
        if sector_count < 2 || sector_count > u8::MAX as u32 {
            return Err(Error::Invalid);
        }

        let region = Region {
            addr: 0,
            eb_bytes: sector_size,
            eb_count: sector_count,
        };

        Ok(Geometry { region, align })
    }

    pub fn sector_size(&self) -> u32 {
        self.region.eb_bytes
    }

    pub fn sector_count(&self) -> u8 {
        self.region.eb_count as u8
    }

    pub fn sector_addr(&self, idx: u8) -> u32 {
        self.region.addr_start() as u32 + idx as u32 * self.region.eb_bytes
    }

    pub fn total_len(&self) -> u32 {
        self.region.len() as u32
    }

    /// Round `x` up to the configured write alignment.
    pub fn align(&self, x: u32) -> u32 {
        (x + self.align - 1) & !(self.align - 1)
    }
}

/// Probe `size` bytes starting at `addr` for being entirely erased (`0xFF`).
///
/// Reads in fixed 64-byte chunks (matching the original's 16-word probe
/// buffer) so the scratch buffer stays small and stack-resident.
pub(crate) fn is_erased<F: Flash>(flash: &mut F, addr: u32, size: u32) -> Result<bool, Error> {
    let mut buf = [0u8; 64];
    let mut remaining = size;
    let mut offset = addr;
    while remaining > 0 {
        let len = remaining.min(buf.len() as u32) as usize;
        flash.read(offset, &mut buf[..len])?;
        if buf[..len].iter().any(|&b| b != 0xFF) {
            return Ok(false);
        }
        offset += len as u32;
        remaining -= len as u32;
    }
    Ok(true)
}
