//! Header and load-command metadata fixups.
//!
//! Runs before the main stages: clears the `MH_DYLIB_IN_CACHE` flag so
//! dyld treats the output as a standalone dylib, and zeroes the chained
//! fixups command since slide processing replaces the fixup chains with
//! plain pointers. The export-trie command is left alone; the linkedit
//! optimizer relocates its blob.

use crate::arch::Pointer;
use crate::error::Result;
use crate::macho::{MachOFlags, RawMachHeader, LC_DYLD_CHAINED_FIXUPS};

use super::ExtractionContext;

/// Applies the metadata fixups.
pub fn fix_metadata<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    clear_dylib_in_cache_flag(ctx)?;
    zero_chained_fixups(ctx)?;
    Ok(())
}

/// Clears `MH_DYLIB_IN_CACHE` from the header flags.
fn clear_dylib_in_cache_flag<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    let flags = ctx.image.header.flags();
    if flags & MachOFlags::DYLIB_IN_CACHE.bits() != 0 {
        ctx.image
            .header
            .set_flags(flags & !MachOFlags::DYLIB_IN_CACHE.bits());
        ctx.image.sync_header()?;
        ctx.activity.debug("cleared MH_DYLIB_IN_CACHE");
    }
    Ok(())
}

/// Zeroes the `LC_DYLD_CHAINED_FIXUPS` offsets.
///
/// The chains the command described are dissolved by the slide stage, so a
/// stale offset would point at bytes that no longer hold fixup data.
fn zero_chained_fixups<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    if let Some((mut command, offset)) = ctx.image.linkedit_data_command(LC_DYLD_CHAINED_FIXUPS) {
        if command.dataoff != 0 || command.datasize != 0 {
            command.dataoff = 0;
            command.datasize = 0;
            ctx.image.write_struct(offset, &command)?;
            ctx.image.reparse_load_commands()?;
            ctx.activity.debug("zeroed LC_DYLD_CHAINED_FIXUPS");
        }
    }
    Ok(())
}

/// Embeds the tool version into the 64-bit header's reserved field.
///
/// 32-bit headers have no reserved field; the request is rejected with a
/// warning and the header is left untouched.
pub fn imbed_version<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    let version = ctx.tool_version;
    if ctx.image.header.set_reserved(version) {
        ctx.image.sync_header()?;
        ctx.activity
            .debug(&format!("embedded tool version {version:#x}"));
    } else {
        ctx.activity
            .warn("unable to imbed version info in a non 64 bit image");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Pointer64;
    use crate::macho::test_support::minimal_dylib;
    use crate::macho::ImageView;

    #[test]
    fn test_flag_clear_math() {
        let flags: u32 = 0x8020_0085;
        let cleared = flags & !MachOFlags::DYLIB_IN_CACHE.bits();
        assert_eq!(cleared, 0x0020_0085);
    }

    #[test]
    fn test_reserved_field_round_trip() {
        let mut view = ImageView::<Pointer64>::from_buffer(minimal_dylib()).unwrap();
        assert!(view.header.set_reserved(0x0003_0001));
        view.sync_header().unwrap();
        let reparsed = ImageView::<Pointer64>::from_buffer(view.data).unwrap();
        assert_eq!(reparsed.header.reserved, 0x0003_0001);
    }
}
