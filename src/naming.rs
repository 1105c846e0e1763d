//! Cache File Naming
//!
//! Files live at
//! `<root>/<cache>/minervaCache_<cache>_<set>[_<tag>].mrc`, with every name
//! component percent-encoded so it is filesystem-safe and free of the `_`
//! field separator.

use std::path::{Path, PathBuf};

/// Prefix of every cache set file name
pub const FILE_PREFIX: &str = "minervaCache_";

/// Extension of every cache set file name
pub const FILE_EXTENSION: &str = ".mrc";

/// Characters escaped by [`sanitize`]
const RESERVED: &[char] = &[
    '%', ';', '?', '/', '\\', ':', '#', '&', '=', '+', '*', '$', ',', ' ', '<', '>', '~', '_',
];

/// Percent-encode the reserved characters of `name`
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if RESERVED.contains(&c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse [`sanitize`]
///
/// Names that do not decode to valid UTF-8 are returned unchanged.
pub fn desanitize(name: &str) -> String {
    urlencoding::decode(name)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

/// Directory holding every set file of a cache type
pub fn cache_dir(root: &Path, cache_name: &str) -> PathBuf {
    root.join(sanitize(cache_name))
}

/// File name (no directory) of a set file
pub fn set_file_name(cache_name: &str, set_name: &str, tag_name: Option<&str>) -> String {
    let mut name = format!("{}{}_{}", FILE_PREFIX, sanitize(cache_name), sanitize(set_name));
    if let Some(tag) = tag_name {
        name.push('_');
        name.push_str(&sanitize(tag));
    }
    name.push_str(FILE_EXTENSION);
    name
}

/// Full path of a set file
pub fn set_file_path(
    root: &Path,
    cache_name: &str,
    set_name: &str,
    tag_name: Option<&str>,
) -> PathBuf {
    cache_dir(root, cache_name).join(set_file_name(cache_name, set_name, tag_name))
}

/// Set and tag encoded in a set file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFileName {
    pub set_name: String,
    pub tag_name: Option<String>,
}

/// Parse a set file name belonging to `cache_name`
///
/// Returns `None` for files that are not cache set files or that belong to
/// another cache type.
pub fn parse_set_file_name(file_name: &str, cache_name: &str) -> Option<SetFileName> {
    let stem = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_EXTENSION)?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 2 || parts.len() > 3 || parts[0] != sanitize(cache_name) {
        return None;
    }
    Some(SetFileName {
        set_name: desanitize(parts[1]),
        tag_name: parts.get(2).map(|tag| desanitize(tag)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_reserved() {
        assert_eq!(sanitize("a b"), "a%20b");
        assert_eq!(sanitize("x_y"), "x%5Fy");
        assert_eq!(sanitize("50%/3"), "50%25%2F3");
        assert_eq!(sanitize("c:\\tmp"), "c%3A%5Ctmp");
        assert_eq!(sanitize("plain-name.v2"), "plain-name.v2");
    }

    #[test]
    fn test_desanitize() {
        assert_eq!(desanitize("x%5Fy"), "x_y");
        assert_eq!(desanitize("x%5fy"), "x_y");
        assert_eq!(desanitize("a%20b%7E"), "a b~");
    }

    #[test]
    fn test_set_file_name() {
        assert_eq!(
            set_file_name("mag_conf", "coil set", None),
            "minervaCache_mag%5Fconf_coil%20set.mrc"
        );
        assert_eq!(
            set_file_name("mag", "coils", Some("run 1")),
            "minervaCache_mag_coils_run%201.mrc"
        );
    }

    #[test]
    fn test_set_file_path() {
        let path = set_file_path(Path::new("/tmp/cache"), "a_b", "s", Some("t"));
        assert_eq!(
            path,
            PathBuf::from("/tmp/cache/a%5Fb/minervaCache_a%5Fb_s_t.mrc")
        );
    }

    #[test]
    fn test_parse_set_file_name() {
        let name = set_file_name("mag_conf", "coil_set", Some("tag_1"));
        assert_eq!(
            parse_set_file_name(&name, "mag_conf"),
            Some(SetFileName {
                set_name: "coil_set".into(),
                tag_name: Some("tag_1".into()),
            })
        );

        let untagged = set_file_name("mag", "coils", None);
        assert_eq!(
            parse_set_file_name(&untagged, "mag").unwrap().tag_name,
            None
        );
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert_eq!(parse_set_file_name("notes.txt", "mag"), None);
        assert_eq!(parse_set_file_name("minervaCache_other_s.mrc", "mag"), None);
        assert_eq!(parse_set_file_name("minervaCache_mag.mrc", "mag"), None);
        assert_eq!(parse_set_file_name("minervaCache_mag_s.tmp", "mag"), None);
    }
}
