//! Unicode path normalization.
//!
//! Admitted paths are normalized to NFC (Composed) form before any table
//! lookup, so the same visual filename always keys the same entry. macOS
//! reports paths in NFD (Decomposed) form while Windows and Linux typically
//! use NFC; without normalization `café.txt` (U+00E9) and `café.txt`
//! (e + U+0301) would be admitted as two different files.

use std::path::{Path, PathBuf};

use unicode_normalization::{is_nfc, UnicodeNormalization};

/// Normalize a string to NFC form.
///
/// # Example
///
/// ```
/// use dupindex::path_utils::normalize_str;
///
/// let nfd = "cafe\u{0301}.txt";
/// assert_eq!(normalize_str(nfd), "café.txt");
/// ```
#[must_use]
pub fn normalize_str(s: &str) -> String {
    if is_nfc(s) {
        s.to_string()
    } else {
        s.nfc().collect()
    }
}

/// Normalize a path to NFC form.
///
/// Paths that are not valid UTF-8 are returned unchanged; they cannot carry
/// decomposed Unicode that round-trips through `str`.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) if !is_nfc(s) => PathBuf::from(s.nfc().collect::<String>()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nfd_becomes_nfc() {
        let nfd = "cafe\u{0301}.txt";
        let nfc = "caf\u{00e9}.txt";
        assert_eq!(normalize_str(nfd), nfc);
        assert_eq!(normalize_path(Path::new(nfd)), PathBuf::from(nfc));
    }

    #[test]
    fn test_ascii_unchanged() {
        assert_eq!(normalize_str("plain.txt"), "plain.txt");
        assert_eq!(
            normalize_path(Path::new("/a/plain.txt")),
            PathBuf::from("/a/plain.txt")
        );
    }

    #[test]
    fn test_nfc_and_nfd_paths_collide() {
        let a = normalize_path(Path::new("/x/cafe\u{0301}.txt"));
        let b = normalize_path(Path::new("/x/caf\u{00e9}.txt"));
        assert_eq!(a, b);
    }
}
