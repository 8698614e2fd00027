//! Git remote discovery and normalization
//!
//! Peers match projects by comparing normalized fetch remotes, so the
//! normalization must map every spelling of the same origin to one string:
//! `git@host:org/repo.git`, `https://host/org/repo/`, and
//! `ssh://git@host/org/repo` all become `host/org/repo`.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Timeout per git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Normalize a git remote URL. Idempotent: feeding the output back in
/// returns it unchanged.
pub fn normalize_git_url(raw: &str) -> String {
    let trimmed = raw.trim();

    // SCP-style SSH: user@host:path
    if let Some((user_host, path)) = trimmed.split_once(':') {
        if user_host.contains('@') && !user_host.contains('/') && !path.starts_with("//") {
            let host = user_host.split('@').next_back().unwrap_or(user_host);
            return finish(&format!("{}/{}", host, path));
        }
    }

    // Scheme form: https://, ssh://, git://
    if let Ok(url) = Url::parse(trimmed) {
        if let Some(host) = url.host_str() {
            return finish(&format!("{}{}", host, url.path()));
        }
    }

    // Already-normalized or unrecognized: canonicalize in place.
    finish(trimmed)
}

fn finish(value: &str) -> String {
    let mut out = value.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = out.strip_suffix(".git") {
        out = stripped.to_string();
    }
    out.trim_end_matches('/').to_lowercase()
}

/// Fetch remotes of a project, normalized. Projects without git (or without
/// remotes) yield an empty list rather than an error.
pub async fn normalized_fetch_remotes(project: &Path) -> Result<Vec<String>> {
    if !project.join(".git").exists() {
        return Ok(Vec::new());
    }

    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        tokio::process::Command::new("git")
            .current_dir(project)
            .args(["remote", "-v"])
            .output(),
    )
    .await
    .context("git remote -v timed out")?
    .context("running git remote -v")?;

    if !output.status.success() {
        debug!("git remote -v failed for {:?}", project);
        return Ok(Vec::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut remotes: Vec<String> = stdout
        .lines()
        .filter(|line| line.trim_end().ends_with("(fetch)"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(normalize_git_url)
        .collect();
    remotes.sort();
    remotes.dedup();
    Ok(remotes)
}

/// Do two normalized remote lists share any origin?
pub fn remotes_intersect(ours: &[String], theirs: &[String]) -> bool {
    ours.iter().any(|remote| theirs.contains(remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ssh_form() {
        assert_eq!(
            normalize_git_url("git@github.com:Acme/Widgets.git"),
            "github.com/acme/widgets"
        );
    }

    #[test]
    fn test_normalize_https_form() {
        assert_eq!(
            normalize_git_url("https://github.com/acme/widgets/"),
            "github.com/acme/widgets"
        );
        assert_eq!(
            normalize_git_url("https://gitlab.example.com/a/b.git"),
            "gitlab.example.com/a/b"
        );
    }

    #[test]
    fn test_normalize_ssh_scheme_form() {
        assert_eq!(
            normalize_git_url("ssh://git@github.com/acme/widgets.git"),
            "github.com/acme/widgets"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [
            "git@github.com:Acme/Widgets.git",
            "https://github.com/acme/widgets",
            "ssh://git@host/x/y.git",
            "host/org/repo",
        ] {
            let once = normalize_git_url(raw);
            assert_eq!(normalize_git_url(&once), once);
        }
    }

    #[test]
    fn test_remotes_intersect() {
        let ours = vec!["github.com/a/b".to_string()];
        let theirs = vec![
            "github.com/x/y".to_string(),
            "github.com/a/b".to_string(),
        ];
        assert!(remotes_intersect(&ours, &theirs));
        assert!(!remotes_intersect(&ours, &["github.com/x/y".to_string()]));
    }

    #[tokio::test]
    async fn test_non_git_dir_has_no_remotes() {
        let dir = tempfile::tempdir().unwrap();
        let remotes = normalized_fetch_remotes(dir.path()).await.unwrap();
        assert!(remotes.is_empty());
    }
}
