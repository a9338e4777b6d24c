//! Output writer.
//!
//! Executes the offset optimizer's write plan: assembles the final byte
//! stream and writes it to the output path, creating parent directories.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::arch::Pointer;
use crate::error::{Error, Result};

use super::{ExtractionContext, WriteProcedure, WriteSource};

/// Writes the extracted image to `output_path` per the write plan.
pub fn write_image<P: Pointer, Q: AsRef<Path>>(
    ctx: &ExtractionContext<P>,
    procedures: &[WriteProcedure],
    output_path: Q,
) -> Result<()> {
    let path = output_path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
    }

    let total_size = procedures
        .iter()
        .map(|p| p.write_offset + p.size)
        .max()
        .unwrap_or(0) as usize;
    let mut output = vec![0u8; total_size];

    for procedure in procedures {
        let src: &[u8] = match procedure.source {
            WriteSource::Image { offset } => {
                let end = offset + procedure.size as usize;
                if end > ctx.image.data.len() {
                    return Err(Error::buffer_too_small(end, ctx.image.data.len()));
                }
                &ctx.image.data[offset..end]
            }
            WriteSource::ExtraData => {
                let extra = ctx
                    .extra_data
                    .as_ref()
                    .ok_or(Error::NoExtraDataSpace)?;
                let end = procedure.size as usize;
                if end > extra.data().len() {
                    return Err(Error::buffer_too_small(end, extra.data().len()));
                }
                &extra.data()[..end]
            }
        };

        let dst_start = procedure.write_offset as usize;
        output[dst_start..dst_start + src.len()].copy_from_slice(src);
    }

    let file = File::create(path).map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&output).map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    writer.flush().map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}
