//! Destination filename derivation and collision handling.
//!
//! A response names its file through `Content-Disposition` first, then the
//! last URL path segment, then a content-type based fallback.

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use url::Url;

/// Name used when neither headers nor the URL provide anything usable.
const DEFAULT_FILENAME: &str = "index.html";

/// Upper bound on `name_N.ext` candidates tried by [`next_free_path`].
const MAX_RENAME_ATTEMPTS: usize = 10_000;

/// Picks a filename for a response.
///
/// `content_disposition` and `content_type` are raw header values.
pub(crate) fn determine_filename(
    content_disposition: Option<&str>,
    url: &Url,
    content_type: Option<&str>,
) -> String {
    if let Some(name) = content_disposition.and_then(parse_content_disposition) {
        let name = sanitize_filename(&name);
        if !name.trim_matches('_').is_empty() {
            return name;
        }
    }

    if let Some(name) = filename_from_url(url) {
        return name;
    }

    match content_type.map(extension_from_content_type) {
        Some(".html") | None => DEFAULT_FILENAME.to_string(),
        Some(extension) => format!("index{extension}"),
    }
}

/// Last non-empty path segment of `url`, percent-decoded and sanitized.
pub(crate) fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).unwrap_or_else(|e| {
        debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
        last.into()
    });
    Some(sanitize_filename(&decoded))
}

/// Guess file extension from Content-Type header.
pub(crate) fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" | "application/x-gzip" => ".gz",
        "application/x-tar" => ".tar",
        "application/x-iso9660-image" => ".iso",
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        _ => ".bin",
    }
}

/// Extracts the filename parameter of a Content-Disposition header.
///
/// Handles:
/// - `attachment; filename="example.iso"`
/// - `attachment; filename=example.iso`
/// - `attachment; filename*=UTF-8''example%20file.iso` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + "filename*=".len()..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    let pos = header.find("filename=")?;
    let value = header[pos + "filename=".len()..].trim();
    if let Some(stripped) = value.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }
    let end = value.find(';').unwrap_or(value.len());
    let filename = value[..end].trim();
    (!filename.is_empty()).then(|| filename.to_string())
}

/// Replaces characters invalid on common filesystems and neutralizes dot segments.
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

    let is_dot_segment = Path::new(&sanitized).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if is_dot_segment {
        sanitized.replace('.', "_")
    } else {
        sanitized
    }
}

/// Returns the first non-existing `stem_N.ext` next to `path`, starting at `_1`.
///
/// Returns `None` when every candidate is taken.
pub(crate) fn next_free_path(path: &Path) -> Option<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let filename = path.file_name()?.to_string_lossy().into_owned();
    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename.as_str(), ""),
    };

    (1..MAX_RENAME_ATTEMPTS)
        .map(|i| dir.join(format!("{stem}_{i}{ext}")))
        .find(|candidate| !candidate.exists())
}
