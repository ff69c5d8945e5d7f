//! Removal of intermediate frames once a run is done with them.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

/// Removes every file below `dir`, leaving the directories in place.
///
/// A missing directory, or a file that disappears before it is removed, is
/// not an error. Other failures are logged and counted.
pub fn remove_intermediate(dir: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                if error.io_error().map(|io| io.kind()) != Some(ErrorKind::NotFound) {
                    warn!(dir = %dir.display(), "failed to list intermediate files: {error}");
                    report.failed += 1;
                }
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => report.removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %entry.path().display(), "failed to remove intermediate file: {error}");
                report.failed += 1;
            }
        }
    }
    debug!(
        dir = %dir.display(),
        removed = report.removed,
        failed = report.failed,
        "removed intermediate files"
    );
    report
}
