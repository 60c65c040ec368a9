//! Ignore filters compiled from a project's glob lists.
//!
//! The server sends two lists of globs per project: ignored filenames (match
//! any path segment) and ignored paths (match the project-relative path).
//! Globs are translated by replacing `*` with `.*`; every other character is
//! handed to the regex engine as-is, which is the contract the server relies
//! on.

use crate::error::{WatcherError, WatcherResult};
use crate::models::ProjectToWatch;
use regex::Regex;
use tracing::error;

pub struct PathFilter {
    filename_exclude_patterns: Vec<Regex>,
    path_exclude_patterns: Vec<Regex>,
}

impl PathFilter {
    pub fn new(project: &ProjectToWatch) -> WatcherResult<Self> {
        let mut filename_exclude_patterns = Vec::new();
        for val in &project.ignored_filenames {
            if val.contains('/') || val.contains('\\') {
                return Err(WatcherError::invalid_filter(format!(
                    "Ignore filenames may not contain path separators: {}",
                    val
                )));
            }
            filename_exclude_patterns.push(compile_glob(val)?);
        }

        let mut path_exclude_patterns = Vec::new();
        for val in &project.ignored_paths {
            if val.contains('\\') {
                return Err(WatcherError::invalid_filter(format!(
                    "Ignore paths may not contain Windows-style path separators: {}",
                    val
                )));
            }
            path_exclude_patterns.push(compile_glob(val)?);
        }

        Ok(Self {
            filename_exclude_patterns,
            path_exclude_patterns,
        })
    }

    /// True if any segment of the relative path matches any filename pattern.
    pub fn is_filtered_out_by_filename(&self, path: &str) -> bool {
        if path.contains('\\') {
            error!("Parameter cannot contain Windows-style file paths: {}", path);
            return false;
        }

        path.split('/').any(|segment| {
            self.filename_exclude_patterns
                .iter()
                .any(|pattern| pattern.is_match(segment))
        })
    }

    /// True if any path pattern matches the relative path.
    pub fn is_filtered_out_by_path(&self, path: &str) -> bool {
        if path.contains('\\') {
            error!("Parameter cannot contain Windows-style file paths: {}", path);
            return false;
        }

        self.path_exclude_patterns
            .iter()
            .any(|pattern| pattern.is_match(path))
    }

    pub fn has_path_patterns(&self) -> bool {
        !self.path_exclude_patterns.is_empty()
    }

    pub fn has_filename_patterns(&self) -> bool {
        !self.filename_exclude_patterns.is_empty()
    }
}

fn compile_glob(glob: &str) -> WatcherResult<Regex> {
    let text = glob.replace('*', ".*");
    Regex::new(&text).map_err(|e| {
        error!("Unable to compile regex: {}", text);
        WatcherError::invalid_filter(e.to_string())
    })
}
