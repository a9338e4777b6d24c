//! dscex - dyld shared cache image extractor.
//!
//! Extracts Mach-O images from Apple's dyld shared cache and reconstitutes
//! each as a standalone dylib. The cache interleaves hundreds of libraries,
//! slides their pointers, merges their linkedit into shared pools, rewires
//! their stubs, and consolidates their Objective-C metadata; extraction
//! reverses each of those steps per image.
//!
//! # Example
//!
//! ```no_run
//! use dscex::{CacheView, ExtractorOptions};
//!
//! fn main() -> dscex::Result<()> {
//!     let cache = CacheView::open("/path/to/dyld_shared_cache_arm64e")?;
//!     let report = dscex::extract_all(
//!         &cache,
//!         "extracted".as_ref(),
//!         &ExtractorOptions::default(),
//!         |_done, _total, _path| {},
//!     )?;
//!     println!("{} extracted, {} failed", report.extracted, report.failed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arch;
pub mod converter;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod provider;
pub mod util;

pub use dyld::{CacheView, ImageEntry};
pub use error::{Error, Result};

use std::path::{Path, PathBuf};

use arch::{pointer_width_for_arch, Pointer, Pointer32, Pointer64, PointerWidth};
use converter::{
    fix_metadata, fix_objc, fix_stubs, imbed_version, optimize_linkedit, optimize_offsets,
    process_slide_info, write_image, ExtractionContext,
};
use macho::ImageView;
use provider::Accelerator;

/// Tool version embedded by `--imbed-version`, packed as `major.minor.patch`
/// into `0x00MMmmpp`.
pub const TOOL_VERSION: u32 = 0x0000_0301;

// =============================================================================
// Options
// =============================================================================

/// Pipeline stages that can be skipped for development runs.
///
/// Parsed from the CLI bitmask into named booleans; nothing downstream
/// relies on the bit layout. Skipping any stage produces a non-loadable
/// image by design.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipModules {
    /// Skip slide-info processing.
    pub slide: bool,
    /// Skip the linkedit rebuild.
    pub linkedit: bool,
    /// Skip stub fixing.
    pub stubs: bool,
    /// Skip ObjC fixing.
    pub objc: bool,
    /// Skip header/load-command metadata fixups.
    pub metadata: bool,
}

impl SkipModules {
    /// Parses the CLI bitmask: bit 0 slide, 1 linkedit, 2 stubs, 3 objc,
    /// 4 metadata.
    pub fn from_bitmask(mask: u32) -> Self {
        Self {
            slide: mask & 0x01 != 0,
            linkedit: mask & 0x02 != 0,
            stubs: mask & 0x04 != 0,
            objc: mask & 0x08 != 0,
            metadata: mask & 0x10 != 0,
        }
    }
}

/// Options for an extraction run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractorOptions {
    /// Stages to skip.
    pub skip: SkipModules,
    /// Verbose (debug) logging.
    pub verbose: bool,
    /// Write the tool version into 64-bit headers.
    pub imbed_version: bool,
    /// Run the pipeline but write no files.
    pub disable_output: bool,
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one image's run.
#[derive(Debug, Clone)]
pub struct ImageReport {
    /// Install path of the image.
    pub path: String,
    /// True when the pipeline completed.
    pub success: bool,
    /// The per-image summary line.
    pub summary: String,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Per-image outcomes, in processing order.
    pub images: Vec<ImageReport>,
    /// Number of images that completed.
    pub extracted: usize,
    /// Number of images that failed.
    pub failed: usize,
}

impl RunReport {
    /// The concatenated per-image summary report.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for image in &self.images {
            out.push_str(&image.summary);
            out.push('\n');
        }
        out.push_str(&format!(
            "{} extracted, {} failed\n",
            self.extracted, self.failed
        ));
        out
    }
}

/// Computes the output path for an image: the install path without its
/// leading slash, under `output_dir`.
pub fn output_path_for(output_dir: &Path, image_path: &str) -> PathBuf {
    output_dir.join(image_path.trim_start_matches('/'))
}

// =============================================================================
// Per-image pipeline
// =============================================================================

/// Extracts one image through the full pipeline.
fn extract_one<P: Pointer>(
    cache: &CacheView,
    accelerator: &mut Accelerator,
    image: &ImageEntry,
    output_path: Option<&Path>,
    options: &ExtractorOptions,
) -> Result<ImageReport> {
    let view = ImageView::<P>::build(cache, image.address)?;
    let mut ctx = ExtractionContext::new(
        cache,
        view,
        accelerator,
        image.path.clone(),
        image.address,
        options.verbose,
        TOOL_VERSION,
    );

    if !options.skip.metadata {
        fix_metadata(&mut ctx)?;
    }
    if !options.skip.slide {
        process_slide_info(&mut ctx)?;
    }
    if !options.skip.linkedit {
        optimize_linkedit(&mut ctx)?;
    }
    if !options.skip.stubs {
        fix_stubs(&mut ctx)?;
    }
    if !options.skip.objc {
        fix_objc(&mut ctx)?;
    }
    if options.imbed_version {
        imbed_version(&mut ctx)?;
    }

    let procedures = optimize_offsets(&mut ctx)?;
    if let Some(path) = output_path {
        write_image(&ctx, &procedures, path)?;
    }

    Ok(ImageReport {
        path: image.path.clone(),
        success: true,
        summary: ctx.activity.summary_line(),
    })
}

/// Structural validation of one image, writing nothing.
fn validate_one<P: Pointer>(cache: &CacheView, image: &ImageEntry) -> Result<()> {
    let view = ImageView::<P>::build(cache, image.address)?;

    if view.segment("__TEXT").is_none() {
        return Err(Error::ValidationFailed {
            reason: "missing __TEXT segment".into(),
        });
    }
    if view.segment("__LINKEDIT").is_none() {
        return Err(Error::ValidationFailed {
            reason: "missing __LINKEDIT segment".into(),
        });
    }
    let Some((symtab, _)) = view.symtab() else {
        return Err(Error::ValidationFailed {
            reason: "missing LC_SYMTAB".into(),
        });
    };
    if view.dysymtab().is_none() {
        return Err(Error::ValidationFailed {
            reason: "missing LC_DYSYMTAB".into(),
        });
    }
    if symtab.nsyms > 0 && view.linkedit_offset(symtab.symoff as u64).is_none() {
        return Err(Error::ValidationFailed {
            reason: "symbol table offset outside __LINKEDIT".into(),
        });
    }
    if symtab.strsize > 0 && view.linkedit_offset(symtab.stroff as u64).is_none() {
        return Err(Error::ValidationFailed {
            reason: "string table offset outside __LINKEDIT".into(),
        });
    }
    Ok(())
}

// =============================================================================
// Drivers
// =============================================================================

fn extract_all_with<P: Pointer, F>(
    cache: &CacheView,
    output_dir: &Path,
    options: &ExtractorOptions,
    mut progress: F,
) -> RunReport
where
    F: FnMut(usize, usize, &str),
{
    let mut accelerator = Accelerator::new();
    let mut report = RunReport::default();
    let total = cache.images.len();

    for (index, image) in cache.images.iter().enumerate() {
        progress(index + 1, total, &image.path);

        let output_path = if options.disable_output {
            None
        } else {
            Some(output_path_for(output_dir, &image.path))
        };

        match extract_one::<P>(
            cache,
            &mut accelerator,
            image,
            output_path.as_deref(),
            options,
        ) {
            Ok(image_report) => {
                report.extracted += 1;
                report.images.push(image_report);
            }
            Err(e) => {
                tracing::error!("{}: {}", image.path, e);
                report.failed += 1;
                report.images.push(ImageReport {
                    path: image.path.clone(),
                    success: false,
                    summary: format!("{}: failed, {}", image.path, e),
                });
            }
        }
    }

    report
}

/// Extracts every image of the cache into `output_dir`.
///
/// The pointer width is selected once from the cache architecture; caches
/// with unsupported architectures fail before any image is touched.
pub fn extract_all<F>(
    cache: &CacheView,
    output_dir: &Path,
    options: &ExtractorOptions,
    progress: F,
) -> Result<RunReport>
where
    F: FnMut(usize, usize, &str),
{
    match pointer_width_for_arch(cache.architecture()) {
        Some(PointerWidth::U64) => Ok(extract_all_with::<Pointer64, F>(
            cache, output_dir, options, progress,
        )),
        Some(PointerWidth::U32) => Ok(extract_all_with::<Pointer32, F>(
            cache, output_dir, options, progress,
        )),
        None => Err(Error::UnsupportedArchitecture(
            cache.architecture().to_string(),
        )),
    }
}

/// Extracts a single image, found by path or basename substring.
pub fn extract_image(
    cache: &CacheView,
    image_name: &str,
    output_path: &Path,
    options: &ExtractorOptions,
) -> Result<ImageReport> {
    let image = cache
        .find_image(image_name)
        .ok_or_else(|| Error::ImageNotFound {
            name: image_name.to_string(),
        })?
        .clone();

    let mut accelerator = Accelerator::new();
    match pointer_width_for_arch(cache.architecture()) {
        Some(PointerWidth::U64) => extract_one::<Pointer64>(
            cache,
            &mut accelerator,
            &image,
            Some(output_path),
            options,
        ),
        Some(PointerWidth::U32) => extract_one::<Pointer32>(
            cache,
            &mut accelerator,
            &image,
            Some(output_path),
            options,
        ),
        None => Err(Error::UnsupportedArchitecture(
            cache.architecture().to_string(),
        )),
    }
}

/// Validates every image of the cache, writing nothing.
pub fn validate_all(cache: &CacheView) -> Result<RunReport> {
    let width = pointer_width_for_arch(cache.architecture()).ok_or_else(|| {
        Error::UnsupportedArchitecture(cache.architecture().to_string())
    })?;

    let mut report = RunReport::default();
    for image in &cache.images {
        let result = match width {
            PointerWidth::U64 => validate_one::<Pointer64>(cache, image),
            PointerWidth::U32 => validate_one::<Pointer32>(cache, image),
        };
        match result {
            Ok(()) => {
                report.extracted += 1;
                report.images.push(ImageReport {
                    path: image.path.clone(),
                    success: true,
                    summary: format!("{}: ok", image.path),
                });
            }
            Err(e) => {
                report.failed += 1;
                report.images.push(ImageReport {
                    path: image.path.clone(),
                    success: false,
                    summary: format!("{}: invalid, {}", image.path, e),
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyld::test_support::{build_cache, TestMapping};
    use macho::test_support::minimal_dylib;
    use macho::{RawMachHeader, RawSegment};

    const BASE: u64 = 0x1_8000_0000;

    fn synthetic_cache(tag: &str) -> CacheView {
        let image = minimal_dylib();
        build_cache(
            tag,
            "arm64e",
            &image,
            BASE,
            "/usr/lib/libtest.dylib",
            &[TestMapping {
                vm_addr: BASE,
                size: image.len() as u64,
                image_off: 0,
                slide_info: Vec::new(),
            }],
        )
    }

    fn temp_output(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dscex-test-{}-{}-out", std::process::id(), tag))
    }

    #[test]
    fn test_extract_end_to_end() {
        let cache = synthetic_cache("e2e");
        let out = temp_output("e2e");

        let report =
            extract_image(&cache, "libtest", &out, &ExtractorOptions::default()).unwrap();
        assert!(report.success);

        // The output parses as a standalone Mach-O.
        let bytes = std::fs::read(&out).unwrap();
        let view = ImageView::<Pointer64>::from_buffer(bytes).unwrap();
        assert!(view.header.is_valid());
        assert!(view.symtab().is_some());

        // Dense, page-aligned offsets; linkedit invariants hold.
        let text = view.segment("__TEXT").unwrap().command;
        let data = view.segment("__DATA").unwrap().command;
        let le = view.segment("__LINKEDIT").unwrap().command;
        assert_eq!(text.fileoff(), 0);
        assert_eq!(data.fileoff() % 0x4000, 0);
        assert_eq!(le.fileoff() % 0x4000, 0);
        assert!(text.fileoff() < data.fileoff() && data.fileoff() < le.fileoff());
        assert_eq!(le.vmsize(), le.filesize());

        let (symtab, _) = view.symtab().unwrap();
        assert!(symtab.symoff as u64 >= le.fileoff());
        assert!((symtab.stroff + symtab.strsize) as u64 <= le.fileoff() + le.filesize());
    }

    #[test]
    fn test_extract_imbed_version() {
        let cache = synthetic_cache("imbed");
        let out = temp_output("imbed");

        let options = ExtractorOptions {
            imbed_version: true,
            ..Default::default()
        };
        extract_image(&cache, "libtest", &out, &options).unwrap();

        let bytes = std::fs::read(&out).unwrap();
        let view = ImageView::<Pointer64>::from_buffer(bytes).unwrap();
        assert_eq!(view.header.reserved(), Some(TOOL_VERSION));
    }

    #[test]
    fn test_skip_linkedit_leaves_cache_offsets() {
        let cache = synthetic_cache("skip-le");
        let out = temp_output("skip-le");
        let options = ExtractorOptions {
            skip: SkipModules::from_bitmask(2),
            ..Default::default()
        };
        extract_image(&cache, "libtest", &out, &options).unwrap();

        let view =
            ImageView::<Pointer64>::from_buffer(std::fs::read(&out).unwrap()).unwrap();
        let (symtab, _) = view.symtab().unwrap();
        let le = view.segment("__LINKEDIT").unwrap().command;
        // Symbol offsets still point at the cache layout: with the linkedit
        // rebuild skipped the output is non-loadable by design.
        assert_eq!(symtab.symoff, 0x600);
        assert_ne!(symtab.symoff as u64, le.fileoff());
    }

    #[test]
    fn test_validate_all_synthetic() {
        let cache = synthetic_cache("validate");
        let report = validate_all(&cache).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.extracted, 1);
    }

    #[test]
    fn test_disable_output_writes_nothing() {
        let cache = synthetic_cache("disable");
        let out = temp_output("disable-dir");
        let options = ExtractorOptions {
            disable_output: true,
            ..Default::default()
        };
        let report = extract_all(&cache, &out, &options, |_, _, _| {}).unwrap();
        assert_eq!(report.extracted, 1);
        assert!(!out.exists());
    }

    #[test]
    fn test_skip_modules_bitmask() {
        let none = SkipModules::from_bitmask(0);
        assert!(!none.slide && !none.linkedit && !none.stubs && !none.objc && !none.metadata);

        let linkedit_only = SkipModules::from_bitmask(2);
        assert!(linkedit_only.linkedit);
        assert!(!linkedit_only.slide && !linkedit_only.stubs);

        let all = SkipModules::from_bitmask(0x1F);
        assert!(all.slide && all.linkedit && all.stubs && all.objc && all.metadata);
    }

    #[test]
    fn test_output_path_strips_leading_slash() {
        let path = output_path_for(
            Path::new("extracted"),
            "/System/Library/Frameworks/UIKit.framework/UIKit",
        );
        assert_eq!(
            path,
            Path::new("extracted/System/Library/Frameworks/UIKit.framework/UIKit")
        );
    }

    #[test]
    fn test_tool_version_packing() {
        // 0.3.1 -> 0x00000301
        assert_eq!((TOOL_VERSION >> 16) & 0xFF, 0);
        assert_eq!((TOOL_VERSION >> 8) & 0xFF, 3);
        assert_eq!(TOOL_VERSION & 0xFF, 1);
    }
}
