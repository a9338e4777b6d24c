//! Converter stages for image reconstitution.
//!
//! One image flows through the stages in a fixed order, each reading from
//! and mutating the shared [`ExtractionContext`]:
//!
//! 0. **Metadata fixups** — cache flags and chained-fixup commands
//! 1. **Slide processing** — un-slide pointers, fill the pointer tracker
//! 2. **Linkedit optimization** — rebuild a per-image `__LINKEDIT`
//! 3. **Stub fixing** — retarget stubs, pointers, and callsites
//! 4. **ObjC fixing** — restore selector and metadata structures
//! 5. **Offset optimization + write** — compact offsets, emit the file
//!
//! Skipping a stage (development aid) produces a non-loadable image.

mod context;
mod fixup;
mod linkedit;
mod objc;
mod offsets;
mod slide;
mod stubs;
mod writer;

pub use context::*;
pub use fixup::*;
pub use linkedit::*;
pub use objc::*;
pub use offsets::*;
pub use slide::*;
pub use stubs::*;
pub use writer::*;
