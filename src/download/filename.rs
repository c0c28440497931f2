//! Destination file names for directory downloads.

use std::path::{Component, Path};

use url::Url;

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Last non-empty path segment of `url`, percent-decoded and sanitized.
///
/// Accepts absolute URLs as well as bare paths such as `/path/to/file`.
pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    let last = path.rsplit('/').find(|segment| !segment.is_empty())?;
    let decoded = urlencoding::decode(last).map_or_else(|_| last.into(), |d| d.into_owned());
    Some(sanitize_filename(&decoded))
}

/// Resolves the file name a source is written to inside the destination directory.
///
/// An explicit name wins; otherwise the last URL path segment is used, and
/// `download_<index>.bin` when the URL has none.
pub(crate) fn destination_name(explicit: Option<&str>, url: &str, index: usize) -> String {
    explicit
        .filter(|name| !name.trim().is_empty())
        .map(sanitize_filename)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| format!("download_{index}.bin"))
}
