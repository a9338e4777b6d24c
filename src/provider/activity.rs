//! Per-image activity logging.
//!
//! Wraps the process-wide `tracing` output and additionally records each
//! image's warnings and errors, so the driver can print a per-image summary
//! report once all images are done.

use std::cell::RefCell;

use tracing::{debug, error, info, warn};

/// Log sink for one image's extraction run.
#[derive(Debug)]
pub struct ActivityLogger {
    image_name: String,
    verbose: bool,
    warnings: RefCell<Vec<String>>,
    errors: RefCell<Vec<String>>,
}

impl ActivityLogger {
    /// Creates a logger for the named image.
    pub fn new(image_name: impl Into<String>, verbose: bool) -> Self {
        Self {
            image_name: image_name.into(),
            verbose,
            warnings: RefCell::new(Vec::new()),
            errors: RefCell::new(Vec::new()),
        }
    }

    /// Returns the image name this logger is bound to.
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Logs and records a warning.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", self.image_name, message);
        self.warnings.borrow_mut().push(message);
    }

    /// Logs and records an error.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}: {}", self.image_name, message);
        self.errors.borrow_mut().push(message);
    }

    /// Logs progress information.
    pub fn info(&self, message: &str) {
        info!("{}: {}", self.image_name, message);
    }

    /// Logs detail visible only with verbose logging.
    pub fn debug(&self, message: &str) {
        if self.verbose {
            debug!("{}: {}", self.image_name, message);
        }
    }

    /// Number of recorded warnings.
    pub fn warning_count(&self) -> usize {
        self.warnings.borrow().len()
    }

    /// Number of recorded errors.
    pub fn error_count(&self) -> usize {
        self.errors.borrow().len()
    }

    /// Produces the one-line summary for the end-of-run report.
    pub fn summary_line(&self) -> String {
        let warnings = self.warnings.borrow();
        let errors = self.errors.borrow();
        match (errors.len(), warnings.len()) {
            (0, 0) => format!("{}: ok", self.image_name),
            (0, w) => format!("{}: ok, {} warning(s)", self.image_name, w),
            (e, w) => format!("{}: failed, {} error(s), {} warning(s)", self.image_name, e, w),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let log = ActivityLogger::new("/usr/lib/libfoo.dylib", false);
        assert_eq!(log.summary_line(), "/usr/lib/libfoo.dylib: ok");

        log.warn("first");
        log.warn("second");
        assert_eq!(log.warning_count(), 2);
        assert_eq!(
            log.summary_line(),
            "/usr/lib/libfoo.dylib: ok, 2 warning(s)"
        );

        log.error("boom");
        assert_eq!(
            log.summary_line(),
            "/usr/lib/libfoo.dylib: failed, 1 error(s), 2 warning(s)"
        );
    }
}
