//! Tracking of linkedit regions and their load-command offset fields.
//!
//! Every blob in the rebuilt `__LINKEDIT` is registered here together with
//! the buffer offset of the 32-bit load-command field that cites it. When a
//! region is inserted, resized, or the whole segment moves, the tracker
//! shifts the affected regions and patches every cited offset in lock-step,
//! so the load commands can never go stale. Regions are kept sorted by
//! their data offset.

use crate::arch::Pointer;
use crate::error::{Error, Result};
use crate::macho::{ImageView, RawMachHeader, RawSection, RawSegment};
use crate::util::align_up;

/// One tracked linkedit region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedData {
    /// Buffer offset of the u32 load-command field citing this region.
    pub offset_field: usize,
    /// Buffer offset of the region's data.
    pub data_off: usize,
    /// Region size in bytes, 8-byte aligned.
    pub data_size: u32,
}

impl TrackedData {
    /// First buffer offset past the region.
    #[inline]
    pub fn end(&self) -> usize {
        self.data_off + self.data_size as usize
    }
}

/// Registry of linkedit regions for one image.
#[derive(Debug)]
pub struct LinkeditTracker {
    commands_start: usize,
    header_space: usize,
    linkedit_start: usize,
    linkedit_capacity: usize,
    linkedit_fileoff: u64,
    tracked: Vec<TrackedData>,
}

impl LinkeditTracker {
    /// Creates a tracker for the image.
    ///
    /// Fails when the image lacks a `__text` section or a `__LINKEDIT`
    /// segment; both are required for the space checks.
    pub fn new<P: Pointer>(image: &ImageView<P>) -> Result<Self> {
        let text_sect = image
            .section("__TEXT", "__text")
            .ok_or_else(|| Error::SectionNotFound {
                segment: "__TEXT".into(),
                section: "__text".into(),
            })?;
        let text_start = text_sect.section.offset() as usize;

        let (linkedit_start, linkedit_capacity) =
            image.linkedit_span().ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?;
        let linkedit_fileoff = image
            .segment("__LINKEDIT")
            .map(|seg| seg.command.fileoff())
            .unwrap_or(linkedit_start as u64);

        let commands_start = P::RawHeader::SIZE;
        Ok(Self {
            commands_start,
            header_space: text_start.saturating_sub(commands_start),
            linkedit_start,
            linkedit_capacity,
            linkedit_fileoff,
            tracked: Vec::new(),
        })
    }

    /// Buffer offset of the linkedit segment's data.
    pub fn linkedit_start(&self) -> usize {
        self.linkedit_start
    }

    /// Bytes available inside the linkedit segment.
    pub fn linkedit_capacity(&self) -> usize {
        self.linkedit_capacity
    }

    /// The tracked regions, sorted by data offset.
    pub fn tracked(&self) -> &[TrackedData] {
        &self.tracked
    }

    /// End of the last tracked region (or the linkedit start when empty).
    pub fn tracked_end(&self) -> usize {
        self.tracked
            .last()
            .map(|t| t.end())
            .unwrap_or(self.linkedit_start)
    }

    /// Finds a tracked region by its citing field.
    pub fn find_by_field(&self, offset_field: usize) -> Option<&TrackedData> {
        self.tracked.iter().find(|t| t.offset_field == offset_field)
    }

    /// Adds a region to tracking, keeping the list sorted by data offset.
    pub fn track(&mut self, entry: TrackedData) {
        let idx = self.tracked.partition_point(|t| t.data_off < entry.data_off);
        self.tracked.insert(idx, entry);
    }

    /// Inserts a load command after `after` (a command's buffer offset), or
    /// at the end of the command region when `after` is `None`.
    ///
    /// Returns `Ok(false)` without mutating anything when the commands would
    /// grow past the available header space. On success the image header is
    /// updated and the load commands are re-parsed.
    pub fn insert_load_command<P: Pointer>(
        &mut self,
        image: &mut ImageView<P>,
        after: Option<usize>,
        lc: &[u8],
    ) -> Result<bool> {
        let sizeofcmds = image.header.sizeofcmds() as usize;
        if sizeofcmds + lc.len() > self.header_space {
            return Ok(false);
        }

        let commands_end = self.commands_start + sizeofcmds;
        let shift_start = match after {
            Some(offset) => {
                let cmdsize = image.read_u32(offset + 4)? as usize;
                offset + cmdsize
            }
            None => commands_end,
        };

        image
            .data
            .copy_within(shift_start..commands_end, shift_start + lc.len());
        image.write_at(shift_start, lc)?;

        for entry in &mut self.tracked {
            if entry.offset_field >= shift_start {
                entry.offset_field += lc.len();
            }
        }

        let ncmds = image.header.ncmds();
        image.header.set_ncmds(ncmds + 1);
        image
            .header
            .set_sizeofcmds((sizeofcmds + lc.len()) as u32);
        image.sync_header()?;
        image.reparse_load_commands()?;
        Ok(true)
    }

    /// Inserts a new linkedit region after the tracked region ending at
    /// `after` (a data offset), or at the linkedit start when `None`.
    ///
    /// The data is 8-byte aligned with a zeroed tail; all following regions
    /// shift and their cited fields are patched. `offset_field` is the
    /// command field that will cite the new region. Returns `Ok(false)`
    /// when the segment has no room.
    pub fn insert_linkedit_data<P: Pointer>(
        &mut self,
        image: &mut ImageView<P>,
        after: Option<usize>,
        offset_field: usize,
        data: &[u8],
    ) -> Result<bool> {
        let aligned = align_up(data.len() as u64, 8) as usize;
        let last_end = self.tracked_end();
        if last_end + aligned > self.linkedit_start + self.linkedit_capacity {
            return Ok(false);
        }

        let shift_start = match after {
            Some(data_off) => {
                let region = self
                    .tracked
                    .iter()
                    .find(|t| t.data_off == data_off)
                    .copied()
                    .ok_or_else(|| Error::parse(data_off, "unknown tracked region"))?;
                region.end()
            }
            None => self.linkedit_start,
        };

        image
            .data
            .copy_within(shift_start..last_end, shift_start + aligned);

        for entry in &mut self.tracked {
            if entry.data_off >= shift_start {
                let value = image.read_u32(entry.offset_field)?;
                image.write_u32(entry.offset_field, value + aligned as u32)?;
                entry.data_off += aligned;
            }
        }

        // Zero the alignment tail, then place the data.
        let pad_start = shift_start + aligned - 8;
        for b in &mut image.data[pad_start..shift_start + aligned] {
            *b = 0;
        }
        image.write_at(shift_start, data)?;

        let cited = self.linkedit_fileoff + (shift_start - self.linkedit_start) as u64;
        image.write_u32(offset_field, cited as u32)?;

        self.track(TrackedData {
            offset_field,
            data_off: shift_start,
            data_size: aligned as u32,
        });
        Ok(true)
    }

    /// Resizes the region cited by `offset_field` to `new_size` bytes
    /// (rounded up to 8). Following regions shift and their cited fields are
    /// patched. Returns `Ok(false)` when growing past the segment capacity.
    pub fn resize_linkedit_data<P: Pointer>(
        &mut self,
        image: &mut ImageView<P>,
        offset_field: usize,
        new_size: u32,
    ) -> Result<bool> {
        let idx = self
            .tracked
            .iter()
            .position(|t| t.offset_field == offset_field)
            .ok_or_else(|| Error::parse(offset_field, "unknown tracked region"))?;

        let old_aligned = self.tracked[idx].data_size as usize;
        let new_aligned = align_up(new_size as u64, 8) as usize;
        if new_aligned == old_aligned {
            return Ok(true);
        }

        let last_end = self.tracked_end();
        let grow = new_aligned as i64 - old_aligned as i64;
        if grow > 0 && last_end + grow as usize > self.linkedit_start + self.linkedit_capacity {
            return Ok(false);
        }

        let shift_start = self.tracked[idx].end();
        if grow > 0 {
            image
                .data
                .copy_within(shift_start..last_end, shift_start + grow as usize);
            // Zero the newly opened gap.
            for b in &mut image.data[shift_start..shift_start + grow as usize] {
                *b = 0;
            }
        } else {
            image
                .data
                .copy_within(shift_start..last_end, (shift_start as i64 + grow) as usize);
        }

        for entry in &mut self.tracked[idx + 1..] {
            let value = image.read_u32(entry.offset_field)?;
            image.write_u32(entry.offset_field, (value as i64 + grow) as u32)?;
            entry.data_off = (entry.data_off as i64 + grow) as usize;
        }
        self.tracked[idx].data_size = new_aligned as u32;
        Ok(true)
    }

    /// Rewrites every cited field for a linkedit segment that moved to
    /// `new_fileoff` in the output file.
    pub fn change_base_fileoff<P: Pointer>(
        &mut self,
        image: &mut ImageView<P>,
        new_fileoff: u64,
    ) -> Result<()> {
        for entry in &self.tracked {
            let cited = new_fileoff + (entry.data_off - self.linkedit_start) as u64;
            image.write_u32(entry.offset_field, cited as u32)?;
        }
        self.linkedit_fileoff = new_fileoff;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Pointer64;
    use crate::macho::test_support::minimal_dylib;
    use crate::macho::{LoadCommand, SegmentCommand64};
    use zerocopy::IntoBytes;

    fn view_and_tracker() -> (ImageView<Pointer64>, LinkeditTracker) {
        let view = ImageView::<Pointer64>::from_buffer(minimal_dylib()).unwrap();
        let tracker = LinkeditTracker::new(&view).unwrap();
        (view, tracker)
    }

    #[test]
    fn test_new_requires_linkedit() {
        let (_, tracker) = view_and_tracker();
        assert_eq!(tracker.linkedit_start(), 0x600);
        assert_eq!(tracker.linkedit_capacity(), 0x400);
    }

    #[test]
    fn test_track_sorted() {
        let (_, mut tracker) = view_and_tracker();
        tracker.track(TrackedData {
            offset_field: 0x40,
            data_off: 0x700,
            data_size: 8,
        });
        tracker.track(TrackedData {
            offset_field: 0x44,
            data_off: 0x600,
            data_size: 8,
        });
        let offs: Vec<usize> = tracker.tracked().iter().map(|t| t.data_off).collect();
        assert_eq!(offs, vec![0x600, 0x700]);
        assert_eq!(tracker.tracked_end(), 0x708);
    }

    #[test]
    fn test_insert_load_command() {
        let (mut view, mut tracker) = view_and_tracker();
        let before_ncmds = view.header.ncmds;
        let before_size = view.header.sizeofcmds;

        let mut seg = SegmentCommand64::default();
        RawSegment::set_name(&mut seg, "__EXTRA");
        let ok = tracker
            .insert_load_command(&mut view, None, seg.as_bytes())
            .unwrap();
        assert!(ok);
        assert_eq!(view.header.ncmds, before_ncmds + 1);
        assert_eq!(
            view.header.sizeofcmds,
            before_size + SegmentCommand64::SIZE as u32
        );
        // Header/command consistency after the mutation
        assert_eq!(view.load_commands.len(), view.header.ncmds as usize);
        assert_eq!(view.load_commands_size(), view.header.sizeofcmds as usize);
        assert!(view.segment("__EXTRA").is_some());
    }

    #[test]
    fn test_insert_load_command_refuses_overflow() {
        let (mut view, mut tracker) = view_and_tracker();
        // A command bigger than the remaining header space must be refused.
        let huge = vec![0u8; 0x400];
        let mut lc = huge.clone();
        lc[0..4].copy_from_slice(&0x19u32.to_le_bytes());
        lc[4..8].copy_from_slice(&(huge.len() as u32).to_le_bytes());
        let ok = tracker.insert_load_command(&mut view, None, &lc).unwrap();
        assert!(!ok);
        assert_eq!(view.load_commands_size(), view.header.sizeofcmds as usize);
    }

    #[test]
    fn test_insert_linkedit_data_shifts_followers() {
        let (mut view, mut tracker) = view_and_tracker();

        // Seed one region at the linkedit start, cited from a scratch field.
        let field_a = 0x5F0usize; // inside __DATA span, fine for the test
        let field_b = 0x5F4usize;
        view.write_u32(field_a, 0x600).unwrap();
        tracker.track(TrackedData {
            offset_field: field_a,
            data_off: 0x600,
            data_size: 16,
        });

        // Insert an 8-byte region in front of it.
        let ok = tracker
            .insert_linkedit_data(&mut view, None, field_b, &[0xAB; 5])
            .unwrap();
        assert!(ok);

        // The first region moved and its field was patched.
        assert_eq!(view.read_u32(field_a).unwrap(), 0x608);
        assert_eq!(tracker.tracked()[1].data_off, 0x608);
        // New region cited at the linkedit base.
        assert_eq!(view.read_u32(field_b).unwrap(), 0x600);
        assert_eq!(view.data[0x600], 0xAB);
        // Alignment tail is zeroed.
        assert_eq!(view.data[0x605..0x608], [0, 0, 0]);
    }

    #[test]
    fn test_insert_linkedit_data_refuses_overflow() {
        let (mut view, mut tracker) = view_and_tracker();
        let big = vec![0u8; 0x401];
        let ok = tracker
            .insert_linkedit_data(&mut view, None, 0x5F0, &big)
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_resize_grows_and_patches() {
        let (mut view, mut tracker) = view_and_tracker();
        let field_a = 0x5F0usize;
        let field_b = 0x5F4usize;
        view.write_u32(field_a, 0x600).unwrap();
        view.write_u32(field_b, 0x610).unwrap();
        tracker.track(TrackedData {
            offset_field: field_a,
            data_off: 0x600,
            data_size: 16,
        });
        tracker.track(TrackedData {
            offset_field: field_b,
            data_off: 0x610,
            data_size: 8,
        });

        let ok = tracker
            .resize_linkedit_data(&mut view, field_a, 32)
            .unwrap();
        assert!(ok);
        assert_eq!(tracker.tracked()[0].data_size, 32);
        assert_eq!(view.read_u32(field_b).unwrap(), 0x620);
        assert_eq!(tracker.tracked()[1].data_off, 0x620);
    }

    #[test]
    fn test_change_base_fileoff() {
        let (mut view, mut tracker) = view_and_tracker();
        let field = 0x5F0usize;
        tracker.track(TrackedData {
            offset_field: field,
            data_off: 0x608,
            data_size: 8,
        });
        tracker.change_base_fileoff(&mut view, 0x4000).unwrap();
        assert_eq!(view.read_u32(field).unwrap(), 0x4008);
    }

    #[test]
    fn test_command_header_size_constant() {
        assert_eq!(LoadCommand::SIZE, 8);
    }
}
