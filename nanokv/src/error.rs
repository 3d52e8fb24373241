use embedded_storage::nor_flash::NorFlashErrorKind;

/// Everything a caller of [`crate::Nanokv`] can get back.
///
/// Five kinds, matching the original C taxonomy: a bad argument or
/// uninitialized instance ([`Error::Invalid`]), a read/delete against an
/// absent key ([`Error::NotFound`]), a write that can't fit even after
/// compaction ([`Error::NoSpace`]), the underlying driver reporting failure
/// ([`Error::Flash`]), and a CRC mismatch on read ([`Error::Crc`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Argument validation failed (bad key/value length, uninitialized
    /// instance, reserved TLV type 0, ...). Programmer error; fix the call
    /// site.
    Invalid,
    /// No live record for the requested key/type.
    NotFound,
    /// A write could not fit even after compaction or incremental GC ran.
    NoSpace,
    /// The flash driver reported an error.
    Flash(NorFlashErrorKind),
    /// A record's stored CRC did not match the recomputed CRC on read.
    Crc,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Invalid => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "key not found"),
            Error::NoSpace => write!(f, "no space left"),
            Error::Flash(kind) => write!(f, "flash driver error: {kind:?}"),
            Error::Crc => write!(f, "CRC verification failed"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::Invalid => defmt::write!(fmt, "Invalid"),
            Error::NotFound => defmt::write!(fmt, "NotFound"),
            Error::NoSpace => defmt::write!(fmt, "NoSpace"),
            Error::Flash(_) => defmt::write!(fmt, "Flash"),
            Error::Crc => defmt::write!(fmt, "Crc"),
        }
    }
}

impl<E: embedded_storage::nor_flash::NorFlashError> From<E> for Error {
    fn from(e: E) -> Self {
        Error::Flash(e.kind())
    }
}
