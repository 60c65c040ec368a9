//! Path canonicalization utilities.
//!
//! Internally the daemon uses one canonical path form: absolute, forward-slash
//! separated, with a lowercase single-letter drive prefix on Windows (the
//! server-normalized form, e.g. `/c/Users/x`). The conversions here translate
//! between that form, Windows-native paths, and whatever the local OS wants.

use crate::error::{WatcherError, WatcherResult};
use std::path::Path;
use tracing::error;

/// True when the string looks like a Windows absolute path (`C:...`).
pub fn is_windows_absolute_path(absolute_path: &str) -> bool {
    let bytes = absolute_path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// `C:\helloThere` -> `/c/helloThere`. Non-Windows-style input is returned
/// unchanged.
pub fn convert_from_windows_drive_letter(absolute_path: &str) -> String {
    if !is_windows_absolute_path(absolute_path) {
        return absolute_path.to_string();
    }

    let replaced = absolute_path.replace('\\', "/");
    let drive = replaced.as_bytes()[0].to_ascii_lowercase() as char;

    // Strip the `X:` prefix and re-root under the lowercased drive.
    format!("/{}{}", drive, &replaced[2..])
}

/// Lowercase the drive letter of a Unix-style path that came from Windows
/// (`/C/...` -> `/c/...`). Paths without a single-letter drive segment are
/// returned unchanged.
pub fn normalize_drive_letter(absolute_path: &str) -> WatcherResult<String> {
    if absolute_path.contains('\\') {
        return Err(WatcherError::invalid_path(format!(
            "This function does not support Windows-style paths: {}",
            absolute_path
        )));
    }

    if absolute_path.len() < 2 {
        return Ok(absolute_path.to_string());
    }

    if !absolute_path.starts_with('/') {
        return Err(WatcherError::invalid_path(format!(
            "Path should begin with forward slash: {}",
            absolute_path
        )));
    }

    let bytes = absolute_path.as_bytes();

    if absolute_path.len() == 2 {
        if bytes[1].is_ascii_uppercase() {
            return Ok(format!("/{}", bytes[1].to_ascii_lowercase() as char));
        }
        return Ok(absolute_path.to_string());
    }

    if bytes[2] == b'/' && bytes[1].is_ascii_uppercase() {
        return Ok(format!(
            "/{}{}",
            bytes[1].to_ascii_lowercase() as char,
            &absolute_path[2..]
        ));
    }

    Ok(absolute_path.to_string())
}

/// Convert a canonical path into whatever the local OS expects. On
/// non-Windows platforms this is the identity.
pub fn convert_absolute_unix_style_normalized_path_to_local_file(
    path: &str,
) -> WatcherResult<String> {
    convert_absolute_unix_style_normalized_path_to_local_file_os(path, cfg!(windows))
}

/// Convert `/c/Users/Administrator` to `c:\Users\Administrator`. The
/// `is_windows` parameter exists so the Windows behaviour is testable on any
/// platform.
pub fn convert_absolute_unix_style_normalized_path_to_local_file_os(
    path: &str,
    is_windows: bool,
) -> WatcherResult<String> {
    if !is_windows {
        return Ok(path.to_string());
    }

    if !path.starts_with('/') {
        return Err(WatcherError::invalid_path(format!(
            "Parameter must begin with slash: {}",
            path
        )));
    }

    if path.len() <= 1 {
        return Err(WatcherError::invalid_path(format!(
            "Cannot convert string with length of 0 or 1: {}",
            path
        )));
    }

    let bytes = path.as_bytes();
    let drive_letter = bytes[1];

    if !drive_letter.is_ascii_alphabetic() {
        return Err(WatcherError::invalid_path(format!(
            "Missing drive letter: {}",
            path
        )));
    }

    if path.len() == 2 {
        return Ok(format!("{}:\\", drive_letter as char));
    }

    if bytes[2] != b'/' {
        return Err(WatcherError::invalid_path(format!(
            "Invalid path format: {}",
            path
        )));
    }

    Ok(format!(
        "{}:\\{}",
        drive_letter as char,
        path[3..].replace('/', "\\")
    ))
}

/// Convert a local filesystem path into the canonical form used everywhere
/// above the watcher boundary.
pub fn canonicalize_local_path(path: &Path) -> WatcherResult<String> {
    let as_str = path.to_string_lossy().replace('\\', "/");
    let converted = convert_from_windows_drive_letter(&as_str);
    normalize_drive_letter(&converted)
}

/// Strip all trailing forward slashes.
pub fn strip_trailing_forward_slash(value: &str) -> &str {
    value.trim_end_matches('/')
}

/// A usable server base URL starts with an HTTP scheme.
pub fn is_valid_url_base(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Strip the canonical project root from a canonical absolute path.
///
/// If `pathToMonitor` is `/home/user/project` and the watch event path is
/// `/home/user/project/some-file.txt`, this returns `/some-file.txt`. Events
/// outside the root shouldn't reach us, so a mismatch is logged severe and
/// dropped.
pub fn absolute_to_project_relative(path: &str, root_path: &str) -> Option<String> {
    if path.contains('\\') {
        error!("Parameter cannot contain Windows-style file paths: {}", path);
        return None;
    }

    let root_path = strip_trailing_forward_slash(root_path);

    let Some(relative) = path.strip_prefix(root_path) else {
        error!(
            "Watch event '{}' does not match project path '{}'",
            path, root_path
        );
        return None;
    };

    if relative.is_empty() {
        return None;
    }

    Some(relative.to_string())
}

/// Expand `/a/b/c` into `["/a/b/c", "/a/b", "/a"]` so ignore-path patterns
/// can match a directory and everything beneath it.
pub fn split_relative_path_into_component_paths(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = path;

    loop {
        let Some(idx) = current.rfind('/') else {
            break;
        };
        if !current.is_empty() {
            result.push(current.to_string());
        }
        if idx == 0 {
            break;
        }
        current = &current[..idx];
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_drive_to_canonical() {
        let cases = [
            ("c:\\hi\\file", "/c/hi/file"),
            ("C:\\foo\\bar", "/c/foo/bar"),
            ("c:\\hi", "/c/hi"),
            ("/hi", "/hi"),
            ("/c/hi", "/c/hi"),
        ];
        for (input, expected) in cases {
            assert_eq!(convert_from_windows_drive_letter(input), expected);
        }
    }

    #[test]
    fn normalize_rejects_windows_paths() {
        assert!(normalize_drive_letter("c:\\thing\\thing2").is_err());
        assert!(normalize_drive_letter("c/somepath").is_err());
    }

    #[test]
    fn normalize_lowercases_single_letter_drives_only() {
        let cases = [
            ("/home/user", "/home/user"),
            ("/C/somepath", "/c/somepath"),
            ("/TW/somepath", "/TW/somepath"),
            ("/tw/somepath", "/tw/somepath"),
            ("/c/somepath", "/c/somepath"),
            ("/", "/"),
            ("/c", "/c"),
            ("/C", "/c"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_drive_letter(input).unwrap(), expected);
        }
    }

    #[test]
    fn canonical_to_local_on_windows() {
        let cases = [
            ("/c", "c:\\"),
            ("/z", "z:\\"),
            ("/c/users", "c:\\users"),
            ("/c/users/thing", "c:\\users\\thing"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                convert_absolute_unix_style_normalized_path_to_local_file_os(input, true).unwrap(),
                expected
            );
        }
    }

    #[test]
    fn canonical_to_local_rejects_malformed() {
        for input in ["c/", "/", "/cc/users", "x", ""] {
            assert!(
                convert_absolute_unix_style_normalized_path_to_local_file_os(input, true).is_err(),
                "expected error for {:?}",
                input
            );
        }
    }

    #[test]
    fn canonical_to_local_is_identity_elsewhere() {
        assert_eq!(
            convert_absolute_unix_style_normalized_path_to_local_file_os("/c/users", false)
                .unwrap(),
            "/c/users"
        );
    }

    #[test]
    fn project_relative_strips_root() {
        assert_eq!(
            absolute_to_project_relative("/home/user/project/a.txt", "/home/user/project"),
            Some("/a.txt".to_string())
        );
        assert_eq!(
            absolute_to_project_relative("/home/user/project/a.txt", "/home/user/project/"),
            Some("/a.txt".to_string())
        );
        // The root itself has no relative form.
        assert_eq!(
            absolute_to_project_relative("/home/user/project", "/home/user/project"),
            None
        );
        // Outside the root.
        assert_eq!(
            absolute_to_project_relative("/other/place/a.txt", "/home/user/project"),
            None
        );
    }

    #[test]
    fn component_paths_walk_up_to_root() {
        assert_eq!(
            split_relative_path_into_component_paths("/a/b/c"),
            vec!["/a/b/c", "/a/b", "/a"]
        );
        assert_eq!(split_relative_path_into_component_paths("/a"), vec!["/a"]);
    }

    #[test]
    fn url_base_validation() {
        assert!(is_valid_url_base("http://localhost:9090"));
        assert!(is_valid_url_base("https://example.com"));
        assert!(!is_valid_url_base("ws://localhost"));
        assert!(!is_valid_url_base("localhost:9090"));
    }

    #[test]
    fn trailing_slash_stripping() {
        assert_eq!(strip_trailing_forward_slash("http://x/"), "http://x");
        assert_eq!(strip_trailing_forward_slash("http://x//"), "http://x");
        assert_eq!(strip_trailing_forward_slash("http://x"), "http://x");
    }
}
