//! Error types for the extractor.
//!
//! Failures come in three kinds: fatal for the whole run (bad cache file),
//! fatal for one image (missing required structure), and recoverable
//! (missing optional data that a stage can log and skip).

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for extraction operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache format ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported cache architecture: '{0}'")]
    UnsupportedArchitecture(String),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ==================== Mach-O ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("insufficient space for new load commands (need {needed} bytes, have {available})")]
    InsufficientLoadCommandSpace { needed: usize, available: usize },

    // ==================== Slide info ====================
    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    #[error("slide info version {version} is incompatible with a {width}-bit image")]
    SlideWidthMismatch { version: u32, width: u32 },

    #[error("invalid slide info at offset {offset:#x}: {reason}")]
    InvalidSlideInfo { offset: u64, reason: String },

    // ==================== Symbols ====================
    #[error("symbol table not found in Mach-O")]
    SymbolTableNotFound,

    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("invalid LEB128 at offset {offset:#x}")]
    InvalidLeb128 { offset: usize },

    #[error("no redacted-symbols entry for image in symbols subcache")]
    RedactedSymbolsEntryMissing,

    // ==================== Stubs ====================
    #[error("unable to resolve stub at {addr:#x}")]
    UnresolvableStub { addr: u64 },

    // ==================== ObjC ====================
    #[error("unknown ObjC method list format at {addr:#x}")]
    UnknownMethodListFormat { addr: u64 },

    #[error("unable to allocate extra data region")]
    NoExtraDataSpace,

    // ==================== Images ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    #[error("image failed validation: {reason}")]
    ValidationFailed { reason: String },

    // ==================== Parse ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error is recoverable for the current image.
    ///
    /// Recoverable conditions are logged as warnings; the stage leaves the
    /// affected region untouched (or zero-fills it) and continues.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::UnresolvableStub { .. }
                | Error::UnknownMethodListFormat { .. }
                | Error::RedactedSymbolsEntryMissing
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(Error::UnresolvableStub { addr: 0x1000 }.is_recoverable());
        assert!(Error::RedactedSymbolsEntryMissing.is_recoverable());
        assert!(!Error::SymbolTableNotFound.is_recoverable());
        assert!(!Error::UnsupportedSlideVersion(9).is_recoverable());
    }
}
