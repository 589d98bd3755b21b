//! Local archive enumeration
//!
//! Walks archive roots to count files, find the most recent modification time
//! and collect file stems as local titles.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Separator accepted inside a single root string
pub const ROOT_SEPARATOR: char = ';';

/// Facts about the files under one or more archive roots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveFacts {
    pub file_count: u64,
    /// Latest modification time in unix seconds (0 when the archive is empty)
    pub latest_mtime: i64,
    /// File stems in walk order
    pub titles: Vec<String>,
}

/// Expand `;`-delimited entries into individual roots, dropping blanks
pub fn split_roots(roots: &[PathBuf]) -> Vec<PathBuf> {
    roots
        .iter()
        .flat_map(|root| {
            root.to_string_lossy()
                .split(ROOT_SEPARATOR)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

impl ArchiveFacts {
    /// Walk every root. Missing roots and unreadable entries are skipped.
    pub fn collect(roots: &[PathBuf]) -> Self {
        let mut facts = ArchiveFacts::default();

        for root in split_roots(roots) {
            facts.add_root(&root);
        }

        debug!(
            files = facts.file_count,
            latest_mtime = facts.latest_mtime,
            "Collected archive facts"
        );
        facts
    }

    fn add_root(&mut self, root: &Path) {
        if !root.exists() {
            warn!(path = %root.display(), "Archive root does not exist");
            return;
        }

        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "Skipping unreadable archive entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            self.file_count += 1;

            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            self.latest_mtime = self.latest_mtime.max(mtime);

            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                self.titles.push(stem.to_string());
            }
        }
    }
}
