//! GitHub integration: remote URL grammar, REST client, and the
//! per-branch reconciliation loop.

/// REST API client trait, production client, and scripted mock.
pub mod client;

/// Periodic per-branch PR/job reconciliation.
pub mod sync;

pub use client::{CreatePrParams, GitHubApi, MockGitHubApi, RemoteJob, RemotePullRequest};

/// Owner/repo pair parsed from a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepoRef {
    /// Repository owner (user or organization).
    pub owner: String,

    /// Repository name.
    pub repo: String,
}

/// Parse a GitHub remote URL into owner/repo.
///
/// Accepted forms: `https://github.com/<owner>/<repo>[.git][/]`
/// (case-insensitive host) and `git@github.com:<owner>/<repo>[.git]`.
/// Anything else is a non-GitHub remote.
#[must_use]
pub fn parse_github_remote(url: &str) -> Option<GitHubRepoRef> {
    let trimmed = url.trim();

    let rest = if let Some(rest) = strip_prefix_ignore_case(trimmed, "https://github.com/") {
        rest
    } else if let Some(rest) = strip_prefix_ignore_case(trimmed, "git@github.com:") {
        rest
    } else {
        return None;
    };

    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let mut parts = rest.split('/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if owner.is_empty() || repo.is_empty() || parts.next().is_some() {
        return None;
    }

    Some(GitHubRepoRef {
        owner: owner.to_owned(),
        repo: repo.to_owned(),
    })
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// URL listing the viewer's open PRs in a repository.
///
/// The author defaults to `@me` when the viewer login is unknown.
#[must_use]
pub fn my_prs_url(owner: &str, repo: &str, viewer_login: Option<&str>) -> String {
    let author = viewer_login.unwrap_or("@me");
    let query = format!("is:pr is:open author:{author}");
    let base = format!("https://github.com/{owner}/{repo}/pulls");

    url::Url::parse_with_params(&base, &[("q", query.as_str())])
        .map_or(base, |u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_form_parses() {
        let parsed = parse_github_remote("https://github.com/acme/harness.git").unwrap();
        assert_eq!(parsed.owner, "acme");
        assert_eq!(parsed.repo, "harness");

        assert_eq!(
            parse_github_remote("HTTPS://GitHub.com/acme/harness/").unwrap(),
            GitHubRepoRef {
                owner: "acme".to_owned(),
                repo: "harness".to_owned()
            }
        );
    }

    #[test]
    fn ssh_form_parses() {
        let parsed = parse_github_remote("git@github.com:acme/harness.git").unwrap();
        assert_eq!(parsed.owner, "acme");
        assert_eq!(parsed.repo, "harness");
    }

    #[test]
    fn non_github_remotes_are_rejected() {
        assert!(parse_github_remote("https://gitlab.com/acme/harness.git").is_none());
        assert!(parse_github_remote("https://github.com/acme").is_none());
        assert!(parse_github_remote("https://github.com/acme/harness/extra").is_none());
        assert!(parse_github_remote("").is_none());
    }

    #[test]
    fn my_prs_url_encodes_the_query() {
        let url = my_prs_url("acme", "harness", None);
        assert!(url.starts_with("https://github.com/acme/harness/pulls?q="));
        assert!(url.contains("%40me") || url.contains("@me"));

        let url = my_prs_url("acme", "harness", Some("octocat"));
        assert!(url.contains("octocat"));
    }

    proptest::proptest! {
        #[test]
        fn both_remote_forms_agree(
            owner in "[a-zA-Z0-9][a-zA-Z0-9-]{0,18}",
            repo in "[a-zA-Z0-9][a-zA-Z0-9_.-]{0,18}",
        ) {
            let https = parse_github_remote(&format!("https://github.com/{owner}/{repo}.git"));
            let ssh = parse_github_remote(&format!("git@github.com:{owner}/{repo}.git"));
            proptest::prop_assert_eq!(https.clone(), ssh);
            let parsed = https.expect("well-formed remote parses");
            proptest::prop_assert_eq!(parsed.owner, owner);
        }
    }
}
