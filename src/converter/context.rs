//! Extraction context shared by all pipeline stages.

use crate::arch::Pointer;
use crate::dyld::CacheView;
use crate::error::Result;
use crate::macho::ImageView;
use crate::provider::{
    Accelerator, ActivityLogger, ExtraData, LinkeditTracker, PointerTracker, Symbolizer,
};

/// Name of the segment materialized for reconstituted ObjC data.
pub const EXTRA_SEGMENT_NAME: &str = "__EXTRA_OBJC";

/// Per-image scratchpad carrying the views, trackers, and stage flags.
///
/// Stages run in a fixed order and communicate exclusively through this
/// context: the slide processor fills [`Self::pointer_tracker`], the
/// linkedit optimizer installs [`Self::linkedit_tracker`] and sets
/// [`Self::has_redacted_indirect`], the stub fixer installs
/// [`Self::symbolizer`], and the ObjC fixer may allocate
/// [`Self::extra_data`].
pub struct ExtractionContext<'a, P: Pointer> {
    /// The cache being extracted from.
    pub cache: &'a CacheView,
    /// The image being reconstituted.
    pub image: ImageView<P>,
    /// Cross-image memos.
    pub accelerator: &'a mut Accelerator,
    /// Per-image log sink.
    pub activity: ActivityLogger,
    /// Pointer registry filled by slide processing.
    pub pointer_tracker: PointerTracker,
    /// Linkedit region registry, installed by the linkedit optimizer.
    pub linkedit_tracker: Option<LinkeditTracker>,
    /// Address symbolication, installed by the stub fixer.
    pub symbolizer: Option<Symbolizer>,
    /// Synthesized data region, allocated by the ObjC fixer when needed.
    pub extra_data: Option<ExtraData>,
    /// Set when any original indirect-table entry was zero.
    pub has_redacted_indirect: bool,
    /// Number of zero indirect-table entries found.
    pub redacted_indirect_count: u32,
    /// Install path of the image.
    pub image_path: String,
    /// VM address of the image's mach header.
    pub image_address: u64,
    /// Tool version constant for `--imbed-version`.
    pub tool_version: u32,
}

impl<'a, P: Pointer> ExtractionContext<'a, P> {
    /// Creates the context for one image run.
    pub fn new(
        cache: &'a CacheView,
        image: ImageView<P>,
        accelerator: &'a mut Accelerator,
        image_path: String,
        image_address: u64,
        verbose: bool,
        tool_version: u32,
    ) -> Self {
        let pointer_tracker = PointerTracker::new(cache);
        let activity = ActivityLogger::new(image_path.clone(), verbose);
        Self {
            cache,
            image,
            accelerator,
            activity,
            pointer_tracker,
            linkedit_tracker: None,
            symbolizer: None,
            extra_data: None,
            has_redacted_indirect: false,
            redacted_indirect_count: 0,
            image_path,
            image_address,
            tool_version,
        }
    }

    /// Returns the basename of the image path.
    pub fn image_name(&self) -> &str {
        self.image_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.image_path)
    }

    /// Reads cache bytes at a virtual address.
    pub fn read_cache_at(&self, addr: u64, len: usize) -> Result<&'a [u8]> {
        self.cache.data_at_addr(addr, len)
    }
}
