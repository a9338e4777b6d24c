//! Mach-O file format handling.
//!
//! Raw structures for both pointer widths, constants, and the writable
//! [`ImageView`] the extraction pipeline operates on.

mod constants;
mod image;
mod structs;

pub use constants::*;
pub use image::*;
pub use structs::*;
