//! Shared providers consumed by the converter stages.
//!
//! Providers hold state that outlives a single stage: the cross-image
//! [`Accelerator`], the per-image [`PointerTracker`] and [`LinkeditTracker`],
//! the [`ExtraData`] region, the [`Symbolizer`], and the per-image
//! [`ActivityLogger`].

mod accelerator;
mod activity;
mod extra_data;
mod linkedit_tracker;
mod pointer_tracker;
mod symbolizer;

pub use accelerator::*;
pub use activity::*;
pub use extra_data::*;
pub use linkedit_tracker::*;
pub use pointer_tracker::*;
pub use symbolizer::*;
