//! Default-value tables and version-gated synchronization (spec.md §4.10).

/// A registered default for a KV key.
#[derive(Debug, Clone, Copy)]
pub struct KvDefault {
    pub key: &'static str,
    pub value: &'static [u8],
}

/// A registered default for a TLV type.
#[derive(Debug, Clone, Copy)]
pub struct TlvDefault {
    pub ty: u8,
    pub value: &'static [u8],
}

/// Reserved key under which the defaults-schema version is persisted.
pub(crate) const VERSION_KEY: &str = "__nkv_ver__";

/// Bump this whenever the embedder's default tables gain new entries, so
/// existing flash images pick up the additions on next boot.
pub(crate) const DEFAULT_SETTING_VERSION: u32 = 1;

pub(crate) fn find_kv_default(defaults: &[KvDefault], key: &str) -> Option<&KvDefault> {
    defaults.iter().find(|d| d.key == key)
}

pub(crate) fn find_tlv_default(defaults: &[TlvDefault], ty: u8) -> Option<&TlvDefault> {
    defaults.iter().find(|d| d.ty == ty)
}
