//! Staging location resolution

use std::path::{Path, PathBuf};
use url::Url;

const FILE_SCHEME: &str = "file://";

/// Resolve a staging location to a filesystem path
///
/// `file://` URIs and absolute paths are used as given; anything else is
/// relative to the deposit directory.
pub fn resolve_staging_location(deposit_dir: &Path, location: &str) -> PathBuf {
    if let Some(path) = file_uri_path(location) {
        return path;
    }
    let path = Path::new(location);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        deposit_dir.join(path)
    }
}

/// Base name of a staging location, used when no filename was declared
pub fn staged_file_name(location: &str) -> Option<String> {
    let path = file_uri_path(location).unwrap_or_else(|| PathBuf::from(location));
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Decoded path of a `file://` URI
fn file_uri_path(location: &str) -> Option<PathBuf> {
    let raw = location.strip_prefix(FILE_SCHEME)?;
    Url::parse(location)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .or_else(|| Some(PathBuf::from(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_locations_use_deposit_dir() {
        let resolved = resolve_staging_location(Path::new("/deposits/d1"), "data/f1.bin");
        assert_eq!(resolved, PathBuf::from("/deposits/d1/data/f1.bin"));
    }

    #[test]
    fn test_absolute_and_uri_locations() {
        let dir = Path::new("/deposits/d1");
        assert_eq!(resolve_staging_location(dir, "/s/f1.bin"), PathBuf::from("/s/f1.bin"));
        assert_eq!(
            resolve_staging_location(dir, "file:///s/my%20file.bin"),
            PathBuf::from("/s/my file.bin")
        );
    }

    #[test]
    fn test_staged_file_name() {
        assert_eq!(staged_file_name("data/f1.bin").as_deref(), Some("f1.bin"));
        assert_eq!(staged_file_name("file:///s/a%20b.txt").as_deref(), Some("a b.txt"));
        assert_eq!(staged_file_name("file:///"), None);
    }
}
