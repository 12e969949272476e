//! Linear issue import: URL/identifier grammar and the GraphQL client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::{ControlError, ControlResult};

/// An issue fetched from Linear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LinearIssue {
    /// Linear issue id.
    pub id: String,

    /// Human identifier like `ENG-123`.
    pub identifier: String,

    /// Issue title.
    pub title: String,

    /// Issue description (markdown), empty when absent.
    pub description: String,

    /// Team name.
    pub team: Option<String>,

    /// Project name.
    pub project: Option<String>,

    /// Workflow state name.
    pub state: Option<String>,

    /// Assignee display name.
    pub assignee: Option<String>,

    /// Priority 0-4.
    pub priority: Option<u8>,

    /// Point estimate.
    pub estimate: Option<f64>,

    /// Due date `YYYY-MM-DD`.
    pub due_date: Option<String>,

    /// Label ids.
    pub label_ids: Vec<String>,

    /// Web URL.
    pub url: Option<String>,
}

/// Parse a Linear issue URL into its normalized identifier.
///
/// Accepted shape:
/// `https://<workspace.>linear.app/<team-slug>/issue/<identifier>/<slug>`
/// where the identifier matches `[A-Z]+-\d+` case-insensitively.
#[must_use]
pub fn parse_linear_issue_url(url: &str) -> Option<String> {
    let rest = url.trim().strip_prefix("https://")?;
    let (host, path) = rest.split_once('/')?;
    let host_ok = host.eq_ignore_ascii_case("linear.app")
        || host
            .to_ascii_lowercase()
            .strip_suffix(".linear.app")
            .is_some_and(|ws| !ws.is_empty());
    if !host_ok {
        return None;
    }

    let mut segments = path.split('/');
    let _team = segments.next().filter(|s| !s.is_empty())?;
    if segments.next()? != "issue" {
        return None;
    }
    let identifier = segments.next()?;

    normalize_linear_identifier(identifier)
}

/// Normalize a `TEAM-123` style identifier, uppercasing the team part.
#[must_use]
pub fn normalize_linear_identifier(raw: &str) -> Option<String> {
    let (team, number) = raw.split_once('-')?;
    if team.is_empty()
        || number.is_empty()
        || !team.chars().all(|c| c.is_ascii_alphabetic())
        || !number.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{}-{}", team.to_ascii_uppercase(), number))
}

/// Object-safe Linear API surface.
#[async_trait]
pub trait LinearApi: Send + Sync {
    /// Fetch an issue by its human identifier.
    ///
    /// # Errors
    ///
    /// Fails when the API request fails or the response is malformed.
    async fn issue_by_identifier(&self, identifier: &str) -> ControlResult<Option<LinearIssue>>;
}

const LINEAR_GRAPHQL_URL: &str = "https://api.linear.app/graphql";

const ISSUE_QUERY: &str = r"
query Issue($id: String!) {
  issue(id: $id) {
    id
    identifier
    title
    description
    url
    priority
    estimate
    dueDate
    team { name }
    project { name }
    state { name }
    assignee { displayName }
    labelIds
  }
}
";

/// reqwest-backed GraphQL [`LinearApi`].
#[derive(Debug)]
pub struct GraphqlLinearClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl GraphqlLinearClient {
    /// Build a client for the public GraphQL endpoint.
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, LINEAR_GRAPHQL_URL.to_owned())
    }

    /// Build a client against a custom endpoint (for tests).
    #[must_use]
    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            endpoint,
        }
    }
}

#[async_trait]
impl LinearApi for GraphqlLinearClient {
    async fn issue_by_identifier(&self, identifier: &str) -> ControlResult<Option<LinearIssue>> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .json(&serde_json::json!({
                "query": ISSUE_QUERY,
                "variables": { "id": identifier },
            }))
            .send()
            .await
            .map_err(|e| ControlError::external(format!("linear api request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ControlError::external(format!(
                "linear api request failed: {}",
                response.status().as_u16()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| ControlError::validation("linear issue response malformed"))?;

        let issue = &body["data"]["issue"];
        if issue.is_null() {
            return Ok(None);
        }
        if !issue.is_object() {
            return Err(ControlError::validation("linear issue response malformed"));
        }

        let id = issue["id"]
            .as_str()
            .ok_or_else(|| ControlError::validation("linear issue response malformed"))?;
        let identifier = issue["identifier"]
            .as_str()
            .ok_or_else(|| ControlError::validation("linear issue response malformed"))?;
        let title = issue["title"]
            .as_str()
            .ok_or_else(|| ControlError::validation("linear issue response malformed"))?;

        let priority = issue["priority"]
            .as_u64()
            .and_then(|p| u8::try_from(p).ok())
            .filter(|p| *p <= 4);

        Ok(Some(LinearIssue {
            id: id.to_owned(),
            identifier: identifier.to_owned(),
            title: title.to_owned(),
            description: issue["description"].as_str().unwrap_or("").to_owned(),
            team: issue["team"]["name"].as_str().map(str::to_owned),
            project: issue["project"]["name"].as_str().map(str::to_owned),
            state: issue["state"]["name"].as_str().map(str::to_owned),
            assignee: issue["assignee"]["displayName"].as_str().map(str::to_owned),
            priority,
            estimate: issue["estimate"].as_f64(),
            due_date: issue["dueDate"].as_str().map(str::to_owned),
            label_ids: issue["labelIds"]
                .as_array()
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|l| l.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
            url: issue["url"].as_str().map(str::to_owned),
        }))
    }
}

/// Scripted [`LinearApi`] for tests.
#[derive(Debug, Default)]
pub struct MockLinearApi {
    issues: Mutex<std::collections::HashMap<String, LinearIssue>>,
}

impl MockLinearApi {
    /// A mock with no issues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an issue by identifier.
    pub async fn insert(&self, issue: LinearIssue) {
        self.issues
            .lock()
            .await
            .insert(issue.identifier.clone(), issue);
    }
}

#[async_trait]
impl LinearApi for MockLinearApi {
    async fn issue_by_identifier(&self, identifier: &str) -> ControlResult<Option<LinearIssue>> {
        Ok(self.issues.lock().await.get(identifier).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar_accepts_workspace_hosts() {
        assert_eq!(
            parse_linear_issue_url("https://acme.linear.app/eng/issue/eng-42/fix-the-thing"),
            Some("ENG-42".to_owned())
        );
        assert_eq!(
            parse_linear_issue_url("https://linear.app/eng/issue/ENG-42/fix"),
            Some("ENG-42".to_owned())
        );
    }

    #[test]
    fn url_grammar_rejects_other_shapes() {
        assert!(parse_linear_issue_url("https://linear.app/eng/ENG-42").is_none());
        assert!(parse_linear_issue_url("https://example.com/eng/issue/ENG-42/x").is_none());
        assert!(parse_linear_issue_url("https://linear.app/eng/issue/42/x").is_none());
        assert!(parse_linear_issue_url("http://linear.app/eng/issue/ENG-42/x").is_none());
    }

    #[test]
    fn identifiers_normalize_uppercase() {
        assert_eq!(
            normalize_linear_identifier("eng-123"),
            Some("ENG-123".to_owned())
        );
        assert!(normalize_linear_identifier("eng123").is_none());
        assert!(normalize_linear_identifier("-123").is_none());
        assert!(normalize_linear_identifier("eng-").is_none());
    }
}
