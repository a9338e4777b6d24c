//! Dyld shared cache handling.
//!
//! Parsing for Apple's dyld shared cache: the primary file, split
//! sub-caches (iOS 15+ / macOS 12+), and the `.symbols` file holding
//! stripped local symbols.

mod cache;
mod structs;
pub mod trie;

pub use cache::*;
pub use structs::*;
pub use trie::*;
