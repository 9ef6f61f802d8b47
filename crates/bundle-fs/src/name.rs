//! Resource names: relative, forward-slash paths inside a collection.

use crate::{Error, Result};

/// Normalize a resource name to forward slashes, rejecting anything that
/// could escape the collection root.
pub fn normalize_resource_name(name: &str) -> Result<String> {
    let normalized = name.replace('\\', "/");
    let invalid = normalized.is_empty()
        || normalized.starts_with('/')
        || normalized.contains(':')
        || normalized
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(Error::InvalidResourceName {
            name: name.to_string(),
        });
    }
    Ok(normalized)
}

/// Lowercased extension of a resource name, if it has one.
pub fn extension(name: &str) -> Option<String> {
    let file = name.rsplit('/').next()?;
    let idx = file.rfind('.')?;
    if idx == 0 {
        None
    } else {
        Some(file[idx + 1..].to_ascii_lowercase())
    }
}

/// True for names of files that are already compressed archives.
pub fn is_compressed(name: &str) -> bool {
    matches!(extension(name).as_deref(), Some("zip" | "pdash"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a.txt", "a.txt")]
    #[case("sub\\b.dat", "sub/b.dat")]
    #[case("x/y/z", "x/y/z")]
    fn accepts_relative_names(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_resource_name(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("/etc/passwd")]
    #[case("../up.txt")]
    #[case("a//b")]
    #[case("C:evil")]
    fn rejects_escaping_names(#[case] input: &str) {
        assert!(normalize_resource_name(input).is_err());
    }

    #[test]
    fn compressed_detection_is_case_insensitive() {
        assert!(is_compressed("data.PDASH"));
        assert!(is_compressed("backup.zip"));
        assert!(!is_compressed("state"));
        assert!(!is_compressed(".zip"));
    }
}
