//! Common utilities shared by the server and the one-shot commands

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};

/// Replace the extension of the last path segment of a url
///
/// Query strings and fragments are left untouched. Returns `None` when the
/// last segment has no extension.
pub fn change_extension(url: &str, extension: &str) -> Option<String> {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let (path, rest) = url.split_at(end);
    let segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let dot = path[segment_start..].rfind('.')? + segment_start;
    Some(format!("{}.{}{}", &path[..dot], extension, rest))
}

/// Last path segment of a url, without query or fragment
pub fn file_name(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    path.rsplit('/').next().unwrap_or(path)
}
