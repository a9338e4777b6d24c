//! Pointer tracking across the extraction pipeline.
//!
//! The tracker owns the cache's slide geography: at construction it walks
//! every file's extended mapping-and-slide table and decodes each slide-info
//! header once. The slide processor iterates those mappings, registers every
//! slot it rewrites, and later stages chase pointers through the registry
//! instead of re-walking slide tables. Slots the slide stage never touched
//! (pages of other images) can still be decoded one at a time from the
//! cache bytes.

use std::collections::BTreeMap;
use std::mem::offset_of;

use zerocopy::FromBytes;

use crate::arch::Pointer;
use crate::dyld::{
    CacheView, DyldCacheHeader, DyldCacheMappingAndSlideInfo, DyldCacheSlideInfo2,
    DyldCacheSlideInfo3, DyldCacheSlideInfo5, SlidePointer3, SlidePointer5,
};
use crate::util;

/// Pointer-authentication bits recovered from a packed pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthData {
    /// Diversity value.
    pub diversity: u16,
    /// Whether the address participates in diversification.
    pub has_addr_div: bool,
    /// Key number.
    pub key: u8,
}

/// One tracked pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedPointer {
    /// The un-slid target address.
    pub target: u64,
    /// Authentication bits, when the slot was authenticated.
    pub auth: Option<AuthData>,
}

/// One mapping that carries slide info.
#[derive(Debug, Clone)]
pub struct MappingSlideInfo {
    /// Mapped virtual address.
    pub vm_addr: u64,
    /// Mapped size.
    pub size: u64,
    /// Index of the cache file holding the mapping (0 = primary).
    pub file_index: usize,
    /// Offset of the slide info inside that file.
    pub slide_info_offset: u64,
    /// Slide-info version. Unknown versions are kept so the slide stage
    /// can reject them; only their pointer decoding is unavailable.
    pub slide_version: u32,
}

/// Decoded slide parameters for one mapping.
#[derive(Debug, Clone, Copy)]
enum SlideParams {
    /// v1 stores plain 32-bit pointers.
    V1,
    /// v2 packs a delta chain into the pointer.
    V2 { delta_mask: u64, value_add: u64 },
    /// v3 arm64e packed pointers.
    V3 { auth_value_add: u64 },
    /// v5 arm64e packed pointers, offsets from the shared region start.
    V5 { value_add: u64 },
}

impl SlideParams {
    /// Decodes the per-mapping constants out of a slide-info header.
    fn from_header(version: u32, bytes: &[u8]) -> Option<Self> {
        match version {
            1 => Some(SlideParams::V1),
            2 => DyldCacheSlideInfo2::read_from_prefix(bytes)
                .ok()
                .map(|(info, _)| SlideParams::V2 {
                    delta_mask: info.delta_mask,
                    value_add: info.value_add,
                }),
            3 => DyldCacheSlideInfo3::read_from_prefix(bytes)
                .ok()
                .map(|(info, _)| SlideParams::V3 {
                    auth_value_add: info.auth_value_add,
                }),
            5 => DyldCacheSlideInfo5::read_from_prefix(bytes)
                .ok()
                .map(|(info, _)| SlideParams::V5 {
                    value_add: info.value_add,
                }),
            _ => None,
        }
    }
}

/// Registry of un-slid pointers plus fallback slot decoding.
#[derive(Debug, Default)]
pub struct PointerTracker {
    mappings: Vec<MappingSlideInfo>,
    // Parallel to `mappings`; `None` for versions this build cannot decode.
    params: Vec<Option<SlideParams>>,
    pointers: BTreeMap<u64, TrackedPointer>,
}

impl PointerTracker {
    /// Creates a tracker by collecting every slide-bearing mapping of every
    /// cache file and decoding its slide-info header once.
    pub fn new(cache: &CacheView) -> Self {
        let mut tracker = Self::default();

        for (file_index, file) in cache.files().enumerate() {
            let header = &file.header;
            if !header.contains_field(offset_of!(DyldCacheHeader, mapping_with_slide_offset))
                || header.mapping_with_slide_offset == 0
            {
                continue;
            }

            let data = file.data();
            let table = header.mapping_with_slide_offset as usize;
            let entry_size = std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
            for i in 0..header.mapping_with_slide_count as usize {
                let at = table + i * entry_size;
                let Some(bytes) = data.get(at..at + entry_size) else {
                    break;
                };
                let Ok(info) = DyldCacheMappingAndSlideInfo::read_from_bytes(bytes) else {
                    continue;
                };
                if info.slide_info_file_size == 0 {
                    continue;
                }

                let slide_off = info.slide_info_file_offset as usize;
                let Some(slide_bytes) = data.get(slide_off..) else {
                    continue;
                };
                if slide_bytes.len() < 4 {
                    continue;
                }
                let version = util::read_u32_le(slide_bytes);

                tracker.mappings.push(MappingSlideInfo {
                    vm_addr: info.address,
                    size: info.size,
                    file_index,
                    slide_info_offset: info.slide_info_file_offset,
                    slide_version: version,
                });
                tracker
                    .params
                    .push(SlideParams::from_header(version, slide_bytes));
            }
        }

        tracker
    }

    /// All slide-bearing mappings, in file order.
    pub fn slide_mappings(&self) -> &[MappingSlideInfo] {
        &self.mappings
    }

    /// Registers a pointer slot. Later registrations win.
    pub fn add(&mut self, addr: u64, target: u64, auth: Option<AuthData>) {
        self.pointers.insert(addr, TrackedPointer { target, auth });
    }

    /// Returns the tracked pointer at `addr`, if registered.
    pub fn get(&self, addr: u64) -> Option<&TrackedPointer> {
        self.pointers.get(&addr)
    }

    /// Returns all tracked pointers in address order.
    pub fn pointers(&self) -> &BTreeMap<u64, TrackedPointer> {
        &self.pointers
    }

    /// Number of tracked pointers.
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// Returns the un-slid value of the pointer slot at `addr`.
    ///
    /// Tracked slots answer from the registry; anything else is decoded
    /// directly from the cache bytes using the owning mapping's slide
    /// parameters. Slots outside every slide mapping read back verbatim.
    pub fn slide_at<P: Pointer>(&self, cache: &CacheView, addr: u64) -> Option<u64> {
        if let Some(tracked) = self.pointers.get(&addr) {
            return Some(tracked.target);
        }

        let raw_bytes = cache.data_at_addr(addr, P::SIZE as usize).ok()?;
        let raw = P::read_ptr(raw_bytes);

        let index = self
            .mappings
            .iter()
            .position(|m| addr >= m.vm_addr && addr < m.vm_addr + m.size);
        match index.and_then(|i| self.params[i]) {
            Some(params) => Some(Self::decode(raw, params)),
            None => Some(raw),
        }
    }

    fn decode(raw: u64, params: SlideParams) -> u64 {
        match params {
            SlideParams::V1 => raw,
            SlideParams::V2 {
                delta_mask,
                value_add,
            } => {
                let value = raw & !delta_mask;
                if value != 0 { value + value_add } else { 0 }
            }
            SlideParams::V3 { auth_value_add } => {
                let ptr = SlidePointer3(raw);
                if ptr.is_auth() {
                    ptr.auth_offset() + auth_value_add
                } else {
                    ptr.plain_value()
                }
            }
            SlideParams::V5 { value_add } => {
                let ptr = SlidePointer5(raw);
                if ptr.is_auth() {
                    ptr.runtime_offset() + value_add
                } else {
                    ptr.runtime_offset() + value_add + ((ptr.high8() as u64) << 56)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_get() {
        let mut tracker = PointerTracker::default();
        tracker.add(0x1000, 0x1_8000_0000, None);
        tracker.add(
            0x1008,
            0x1_8000_0010,
            Some(AuthData {
                diversity: 0xBEEF,
                has_addr_div: true,
                key: 0,
            }),
        );

        assert_eq!(tracker.get(0x1000).unwrap().target, 0x1_8000_0000);
        assert!(tracker.get(0x1000).unwrap().auth.is_none());
        assert_eq!(
            tracker.get(0x1008).unwrap().auth.unwrap().diversity,
            0xBEEF
        );
        assert!(tracker.get(0x2000).is_none());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_later_registration_wins() {
        let mut tracker = PointerTracker::default();
        tracker.add(0x1000, 0xAAAA, None);
        tracker.add(0x1000, 0xBBBB, None);
        assert_eq!(tracker.get(0x1000).unwrap().target, 0xBBBB);
    }

    #[test]
    fn test_decode_v2() {
        let params = SlideParams::V2 {
            delta_mask: 0x00FF_FF00_0000_0000,
            value_add: 0x1_8000_0000,
        };
        // value portion 0x4000, delta bits set
        let raw = (0x12u64 << 40) | 0x4000;
        assert_eq!(PointerTracker::decode(raw, params), 0x1_8000_4000);
        assert_eq!(PointerTracker::decode(0x12u64 << 40, params), 0);
    }

    #[test]
    fn test_decode_v3_auth() {
        let params = SlideParams::V3 {
            auth_value_add: 0x1_8000_0000,
        };
        let raw = (1u64 << 63) | 0x4_2000;
        assert_eq!(PointerTracker::decode(raw, params), 0x1_8004_2000);
    }

    #[test]
    fn test_decode_v5_plain() {
        let params = SlideParams::V5 {
            value_add: 0x1_8000_0000,
        };
        let raw = 0x1000u64;
        assert_eq!(PointerTracker::decode(raw, params), 0x1_8000_1000);
    }

    #[test]
    fn test_unknown_version_has_no_params() {
        assert!(SlideParams::from_header(9, &[0u8; 64]).is_none());
        assert!(SlideParams::from_header(1, &[0u8; 64]).is_some());
    }
}
