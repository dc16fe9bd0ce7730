use std::path::Path;

use crate::ValidationError;

pub mod hash;
pub mod pattern;

/// Normalizes a context path: `""` and `"/"` become `"/"`, anything else must start with `/`
/// and loses its trailing slashes.
pub fn normalize_context_path(path: &str) -> Result<String, ValidationError> {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return Ok("/".to_string());
    }
    if !path.starts_with('/')
        || path.contains("//")
        || path.contains(['*', '?', '#', ' '])
        || path.split('/').any(|seg| seg == "..")
    {
        return Err(ValidationError::InvalidPath(path.to_string()));
    }
    Ok(path.trim_end_matches('/').to_string())
}

/// Returns the part of `request_path` below `prefix`, if `prefix` is a path-segment prefix of it.
///
/// The root prefix `/` contains every absolute path and hands it back unchanged.
pub fn strip_context_path<'a>(prefix: &str, request_path: &'a str) -> Option<&'a str> {
    if prefix == "/" {
        return request_path.starts_with('/').then_some(request_path);
    }
    let rest = request_path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Guesses a MIME type from the extension of `name`.
pub fn guess_mime_type(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => return None,
    };
    Some(mime)
}

pub fn file_read_sync(path: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}
