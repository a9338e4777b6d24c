//! Cross-image memos shared over one extraction run.
//!
//! Most of the expensive lookups an image performs (chasing stub chains,
//! reading a dependency's export trie, reading selector strings) produce the
//! same answers for every image in the cache. The accelerator caches them
//! across images. All of its tables are insert-only with no eviction; the
//! run is single threaded, so plain maps suffice.

use std::collections::HashMap;
use std::sync::Arc;

/// Name given to symbols whose real name the cache stripped.
pub const REDACTED_SYMBOL_NAME: &str = "<redacted>";

/// One export of a dependency dylib, resolved to an absolute cache address.
#[derive(Debug, Clone)]
pub struct CachedExport {
    /// Symbol name.
    pub name: String,
    /// Absolute vm address of the definition.
    pub address: u64,
    /// Export flags from the trie.
    pub flags: u64,
    /// Stub-and-resolver exports: the resolver's absolute address.
    pub resolver: Option<u64>,
}

/// A dependency dylib's exports keyed by symbol name.
pub type ExportsByName = HashMap<String, CachedExport>;

/// Cross-image memo store. One per extraction run.
#[derive(Debug, Default)]
pub struct Accelerator {
    /// Fully resolved stub chains: first stub address to final target.
    pub resolved_stub_chains: HashMap<u64, u64>,
    /// Parsed dependency exports, keyed by install path.
    pub exports: HashMap<String, Arc<ExportsByName>>,
    /// Selector strings already read out of the cache's selector pool,
    /// keyed by their cache address.
    pub selectors: HashMap<u64, Vec<u8>>,
    /// Targets of shared-region symbol pointers already chased.
    pub symbol_pointer_targets: HashMap<u64, u64>,
    /// Base address for relative method-list selector offsets, published by
    /// libobjc's opt data (v16+). Outer `None` until detection runs; inner
    /// `None` when the cache has no such base.
    pub relative_method_sel_base: Option<Option<u64>>,
}

impl Accelerator {
    /// Creates an empty accelerator.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_only_maps() {
        let mut accel = Accelerator::new();
        accel.resolved_stub_chains.insert(0x1000, 0x2000);
        accel
            .resolved_stub_chains
            .entry(0x1000)
            .or_insert(0x3000);
        assert_eq!(accel.resolved_stub_chains[&0x1000], 0x2000);
    }
}
