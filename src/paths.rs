//! Project path ⇄ storage directory encoding
//!
//! Project transcript directories are named after the absolute project path.
//! The current scheme is URL-safe base64 of the path with its leading slash
//! stripped. An older scheme replaced every path separator with a dash;
//! decoding it is ambiguous (`/a/b-c` vs `/a/b/c`), so legacy names are
//! resolved by probing the filesystem for the longest dash-preserving prefix
//! that actually exists.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::path::Path;

/// Encode an absolute project path into a storage directory name.
pub fn encode_project_path(project: &str) -> String {
    let trimmed = project.strip_prefix('/').unwrap_or(project);
    URL_SAFE_NO_PAD.encode(trimmed.as_bytes())
}

/// Decode a storage directory name produced by [`encode_project_path`].
pub fn decode_project_path(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).ok()?;
    let inner = String::from_utf8(bytes).ok()?;
    Some(format!("/{}", inner))
}

/// Decode a directory name under the transcript root, handling both the
/// base64 scheme and the legacy dash scheme.
pub fn decode_project_dir(name: &str) -> Option<String> {
    if name.starts_with('-') {
        Some(decode_legacy_dashed(name))
    } else {
        decode_project_path(name)
    }
}

/// Decode a legacy `-Users-me-git-my-project` style name.
///
/// Dashes are ambiguous between separators and literal dashes in a segment.
/// Walk the components greedily: at each step, keep extending the current
/// segment with dashes for as long as the directory built so far does not
/// exist on disk; commit a separator at the earliest prefix that does. Paths
/// that never resolve fall back to treating every dash as a separator.
pub fn decode_legacy_dashed(name: &str) -> String {
    let parts: Vec<&str> = name.trim_start_matches('-').split('-').collect();
    if parts.is_empty() {
        return "/".to_string();
    }

    let mut resolved = String::new();
    let mut i = 0;
    while i < parts.len() {
        // Find the longest run parts[i..=j] joined by dashes such that the
        // candidate directory exists; prefer the longest existing candidate.
        let mut chosen = i;
        let mut segment = parts[i].to_string();
        let mut best: Option<(usize, String)> = None;
        let mut j = i;
        loop {
            let candidate = format!("{}/{}", resolved, segment);
            if Path::new(&candidate).is_dir() {
                best = Some((j, segment.clone()));
            }
            j += 1;
            if j >= parts.len() {
                break;
            }
            segment.push('-');
            segment.push_str(parts[j]);
        }
        if let Some((end, seg)) = best {
            resolved.push('/');
            resolved.push_str(&seg);
            chosen = end;
        } else {
            // Nothing on disk matches; take the single component as-is.
            resolved.push('/');
            resolved.push_str(parts[i]);
        }
        i = chosen + 1;
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encode_decode_round_trip() {
        for path in [
            "/Users/me/git/project",
            "/home/dev/work space/repo",
            "/a",
            "/srv/data/repo.git",
        ] {
            let encoded = encode_project_path(path);
            assert!(!encoded.contains('/'));
            assert_eq!(decode_project_path(&encoded).unwrap(), path);
        }
    }

    #[test]
    fn test_encode_strips_leading_slash_only_once() {
        assert_eq!(
            decode_project_path(&encode_project_path("/a/b")).unwrap(),
            "/a/b"
        );
    }

    #[test]
    fn test_legacy_decode_prefers_existing_dirs() {
        let root = tempdir().unwrap();
        // Build /tmpdir/a/b-c so the dash in "b-c" must be preserved.
        let nested = root.path().join("a").join("b-c");
        std::fs::create_dir_all(&nested).unwrap();

        let root_str = root.path().to_str().unwrap();
        let dashed = format!("{}-a-b-c", root_str.replace('/', "-"));
        let decoded = decode_legacy_dashed(&dashed);
        assert_eq!(decoded, format!("{}/a/b-c", root_str));
    }

    #[test]
    fn test_legacy_decode_falls_back_to_separators() {
        // Nothing under /nonexistent-root exists, so every dash splits.
        let decoded = decode_legacy_dashed("-zz_nonexistent-a-b");
        assert_eq!(decoded, "/zz_nonexistent/a/b");
    }

    #[test]
    fn test_decode_project_dir_dispatches_on_shape() {
        let encoded = encode_project_path("/x/y");
        assert_eq!(decode_project_dir(&encoded).unwrap(), "/x/y");
        assert_eq!(decode_project_dir("-x-y").unwrap(), "/x/y");
    }
}
