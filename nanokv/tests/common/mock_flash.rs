//! An in-memory NOR-flash double for tests: fixed-size erase blocks, a
//! program granularity, and bytes that only ever clear (never set) between
//! erases, exactly like the real thing. Standing in for the original's
//! `NanoKV_port.c`/`NanoKV_test.c` memory-backed flash harness.
//!
//! `power_loss_after` lets a test cut power mid-`write`: once the configured
//! number of program bytes has landed, the call that crosses the budget
//! applies only its in-budget prefix (unapplied bytes keep whatever they
//! were, i.e. erased), then every later flash operation fails. This models
//! tearing a single `set` step at an arbitrary byte offset (spec.md §8).

use embedded_storage::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFlashError(NorFlashErrorKind);

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

pub struct MockFlash<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize, const ALIGN: usize> {
    cells: Vec<u8>,
    budget: Option<usize>,
    spent: usize,
    dead: bool,
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize, const ALIGN: usize>
    MockFlash<SECTOR_SIZE, SECTOR_COUNT, ALIGN>
{
    pub fn new() -> Self {
        MockFlash {
            cells: vec![0xFFu8; SECTOR_SIZE * SECTOR_COUNT],
            budget: None,
            spent: 0,
            dead: false,
        }
    }

    /// Rebuild a flash instance from a previously captured [`Self::image`],
    /// as if the device had been power-cycled with its contents intact.
    pub fn from_image(cells: Vec<u8>) -> Self {
        assert_eq!(cells.len(), SECTOR_SIZE * SECTOR_COUNT);
        MockFlash {
            cells,
            budget: None,
            spent: 0,
            dead: false,
        }
    }

    /// Fail (with the prior write's partial effect retained) once `bytes`
    /// total program bytes have been applied across all `write` calls.
    pub fn power_loss_after(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    pub fn image(&self) -> Vec<u8> {
        self.cells.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Flip one bit of a payload byte, for CRC-integrity tests.
    pub fn flip_bit(&mut self, addr: u32, bit: u8) {
        self.cells[addr as usize] ^= 1 << bit;
    }

    fn budgeted_len(&mut self, want: usize) -> usize {
        match self.budget {
            None => want,
            Some(limit) => {
                let remaining = limit.saturating_sub(self.spent);
                let apply = remaining.min(want);
                self.spent += apply;
                apply
            }
        }
    }
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize, const ALIGN: usize> ErrorType
    for MockFlash<SECTOR_SIZE, SECTOR_COUNT, ALIGN>
{
    type Error = MockFlashError;
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize, const ALIGN: usize> ReadNorFlash
    for MockFlash<SECTOR_SIZE, SECTOR_COUNT, ALIGN>
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.dead {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        let start = offset as usize;
        bytes.copy_from_slice(&self.cells[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize, const ALIGN: usize> NorFlash
    for MockFlash<SECTOR_SIZE, SECTOR_COUNT, ALIGN>
{
    const WRITE_SIZE: usize = ALIGN;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if self.dead {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        self.cells[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.dead {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        let apply = self.budgeted_len(bytes.len());
        for (i, &b) in bytes[..apply].iter().enumerate() {
            self.cells[offset as usize + i] &= b;
        }
        if apply < bytes.len() {
            self.dead = true;
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        Ok(())
    }
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize, const ALIGN: usize> MultiwriteNorFlash
    for MockFlash<SECTOR_SIZE, SECTOR_COUNT, ALIGN>
{
}

/// The geometry `NanoKV_test.c` uses: 4 sectors of 4 KiB, 4-byte alignment.
pub type TestFlash = MockFlash<4096, 4, 4>;
