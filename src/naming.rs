//! Tunnel name resolution.
//!
//! Derives a stable, human-meaningful identifier for the shared tunnel from
//! ambient session context, with graceful fallback:
//!
//! 1. Explicit project/branch labels (config or `TUNSHARE_PROJECT` /
//!    `TUNSHARE_BRANCH` env vars)
//! 2. Git state — repository root directory name + current branch
//! 3. Working directory name + hostname (+ outbound local address when
//!    observable)
//!
//! The result is sanitized to `[A-Za-z0-9-]` and length-bounded: names over
//! the limit keep their first `max_len - 7` characters and get a 6-hex-char
//! SHA-256 suffix so distinct long contexts stay distinct.
//!
//! [`resolve`] is pure given a [`NameContext`]; all filesystem and network
//! observation lives in [`gather_context`] so repeated resolution for the
//! same context is deterministic.

use std::net::UdpSocket;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::Config;

/// Everything the resolver looks at, collected up front.
#[derive(Debug, Clone)]
pub struct NameContext {
    /// Explicit project label, if supplied.
    pub project: Option<String>,
    /// Explicit branch label, if supplied.
    pub branch: Option<String>,
    /// Git repository root directory name + current branch, if the working
    /// directory is under version control.
    pub git: Option<GitInfo>,
    /// Working directory (used for its final path component).
    pub cwd: PathBuf,
    /// Machine hostname, if readable.
    pub hostname: Option<String>,
    /// Observed outbound local address, if any.
    pub local_addr: Option<String>,
    /// Maximum name length.
    pub max_len: usize,
}

/// Version-control naming inputs.
#[derive(Debug, Clone)]
pub struct GitInfo {
    /// Final component of the repository root path.
    pub repo: String,
    /// Branch name, or a short commit hash on detached HEAD.
    pub branch: String,
}

/// Collect a [`NameContext`] from config, environment, and filesystem.
pub fn gather_context(config: &Config, cwd: &Path) -> NameContext {
    NameContext {
        project: config.naming.project.clone(),
        branch: config.naming.branch.clone(),
        git: git_info(cwd),
        cwd: cwd.to_path_buf(),
        hostname: hostname(),
        local_addr: local_addr(),
        max_len: config.naming.max_len,
    }
}

/// Resolve the tunnel name from a context. Deterministic for a fixed context.
///
/// Always returns a name matching `^[A-Za-z0-9-]{1,max_len}$`; an empty
/// context degrades to `"tunnel"`.
pub fn resolve(ctx: &NameContext) -> String {
    let raw = if ctx.project.is_some() || ctx.branch.is_some() {
        match (&ctx.project, &ctx.branch) {
            (Some(p), Some(b)) => format!("{p}-{b}"),
            (Some(p), None) => p.clone(),
            (None, Some(b)) => b.clone(),
            (None, None) => unreachable!(),
        }
    } else if let Some(git) = &ctx.git {
        format!("{}-{}", git.repo, git.branch)
    } else {
        let dir = ctx
            .cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut parts: Vec<String> = vec![dir];
        if let Some(host) = &ctx.hostname {
            parts.push(host.clone());
        }
        if let Some(addr) = &ctx.local_addr {
            parts.push(addr.clone());
        }
        parts.retain(|p| !p.is_empty());
        parts.join("-")
    };

    normalize(&raw, ctx.max_len)
}

/// Sanitize and length-bound an arbitrary candidate name. Used both by
/// [`resolve`] and for explicit `--name` overrides.
pub fn normalize(raw: &str, max_len: usize) -> String {
    let name = sanitize(raw);
    if name.is_empty() {
        return "tunnel".to_string();
    }
    shorten(&name, max_len)
}

/// Replace every character outside `[A-Za-z0-9]` with `-`, then trim
/// leading/trailing dashes.
fn sanitize(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    replaced.trim_matches('-').to_string()
}

/// Deterministic collision-resistant shortening: names over `max_len` keep
/// their first `max_len - 7` characters plus `-` and 6 hex chars of the
/// SHA-256 of the full name.
fn shorten(name: &str, max_len: usize) -> String {
    if name.len() <= max_len || max_len < 8 {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let tag: String = digest.iter().take(3).map(|b| format!("{b:02x}")).collect();
    format!("{}-{tag}", &name[..max_len - 7])
}

/// Detect git state by walking up from `cwd` looking for a `.git` entry.
///
/// Handles both a `.git` directory and a `.git` file (worktrees), where the
/// file contains `gitdir: <path>` pointing at the real git directory.
fn git_info(cwd: &Path) -> Option<GitInfo> {
    for dir in cwd.ancestors() {
        let dot_git = dir.join(".git");
        if !dot_git.exists() {
            continue;
        }
        let head_path = if dot_git.is_dir() {
            dot_git.join("HEAD")
        } else {
            let content = std::fs::read_to_string(&dot_git).ok()?;
            let gitdir = content.strip_prefix("gitdir:")?.trim();
            let gitdir = if Path::new(gitdir).is_absolute() {
                PathBuf::from(gitdir)
            } else {
                dir.join(gitdir)
            };
            gitdir.join("HEAD")
        };
        let head = std::fs::read_to_string(head_path).ok()?;
        let repo = dir.file_name()?.to_string_lossy().into_owned();
        return Some(GitInfo {
            repo,
            branch: parse_head(&head),
        });
    }
    None
}

/// Extract the branch name from `.git/HEAD` content, or a short commit hash
/// when HEAD is detached.
fn parse_head(head: &str) -> String {
    let head = head.trim();
    if let Some(refname) = head.strip_prefix("ref:") {
        let refname = refname.trim();
        refname
            .strip_prefix("refs/heads/")
            .unwrap_or(refname)
            .to_string()
    } else {
        head.chars().take(8).collect()
    }
}

fn hostname() -> Option<String> {
    let host = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .or_else(|| std::env::var("HOSTNAME").ok())?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Observe the local address the machine would use for outbound traffic.
///
/// A connected UDP socket picks the route without sending any packets.
fn local_addr() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(project: Option<&str>, branch: Option<&str>) -> NameContext {
        NameContext {
            project: project.map(String::from),
            branch: branch.map(String::from),
            git: None,
            cwd: PathBuf::from("/home/user/widget"),
            hostname: Some("devbox".to_string()),
            local_addr: None,
            max_len: 50,
        }
    }

    fn assert_valid(name: &str) {
        assert!(!name.is_empty() && name.len() <= 50, "bad length: {name}");
        assert!(
            name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
            "bad charset: {name}"
        );
    }

    #[test]
    fn test_explicit_project_branch_wins() {
        let mut c = ctx(Some("widget"), Some("main"));
        c.git = Some(GitInfo {
            repo: "other".to_string(),
            branch: "dev".to_string(),
        });
        assert_eq!(resolve(&c), "widget-main");
    }

    #[test]
    fn test_git_fallback() {
        let mut c = ctx(None, None);
        c.git = Some(GitInfo {
            repo: "widget".to_string(),
            branch: "feature/x".to_string(),
        });
        assert_eq!(resolve(&c), "widget-feature-x");
    }

    #[test]
    fn test_directory_hostname_fallback() {
        let c = ctx(None, None);
        assert_eq!(resolve(&c), "widget-devbox");
    }

    #[test]
    fn test_sanitize_replaces_special_chars() {
        assert_eq!(normalize("feat/login_v2.1", 50), "feat-login-v2-1");
        assert_eq!(normalize("--weird--", 50), "weird");
    }

    #[test]
    fn test_empty_context_degrades() {
        assert_eq!(normalize("", 50), "tunnel");
        assert_eq!(normalize("///", 50), "tunnel");
    }

    #[test]
    fn test_determinism() {
        let c = ctx(Some("a"), Some("b"));
        assert_eq!(resolve(&c), resolve(&c));
    }

    #[test]
    fn test_long_name_truncated_to_bound() {
        let long = "x".repeat(80);
        let name = normalize(&long, 50);
        assert_valid(&name);
        assert_eq!(name.len(), 50);
        assert!(name.starts_with(&"x".repeat(43)));
        // Stable across calls
        assert_eq!(name, normalize(&long, 50));
    }

    #[test]
    fn test_long_names_differing_past_prefix_stay_distinct() {
        let base = "y".repeat(60);
        let a = format!("{base}-alpha");
        let b = format!("{base}-bravo");
        let short_a = normalize(&a, 50);
        let short_b = normalize(&b, 50);
        assert_valid(&short_a);
        assert_valid(&short_b);
        // Identical prefixes, disambiguated by the hash suffix
        assert_eq!(short_a[..43], short_b[..43]);
        assert_ne!(short_a, short_b);
    }

    #[test]
    fn test_parse_head_branch() {
        assert_eq!(parse_head("ref: refs/heads/main\n"), "main");
        assert_eq!(parse_head("ref: refs/heads/feature/x\n"), "feature/x");
    }

    #[test]
    fn test_parse_head_detached() {
        assert_eq!(
            parse_head("0123456789abcdef0123456789abcdef01234567\n"),
            "01234567"
        );
    }

    #[test]
    fn test_git_info_from_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("myrepo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::write(repo.join(".git/HEAD"), "ref: refs/heads/trunk\n").unwrap();
        let nested = repo.join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();

        let info = git_info(&nested).unwrap();
        assert_eq!(info.repo, "myrepo");
        assert_eq!(info.branch, "trunk");
    }
}
