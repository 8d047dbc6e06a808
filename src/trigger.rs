use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull-request",
            TriggerKind::Manual => "manual",
        };
        f.write_str(label)
    }
}

/// The version-control event a run was started for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub branch: String,
    pub commit: Option<String>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, branch: impl Into<String>) -> Self {
        Self {
            kind,
            branch: normalize_branch(&branch.into()),
            commit: None,
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event payload: {}", path.display()))?;
        let payload: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse event payload JSON: {}", path.display()))?;
        Self::from_payload(&payload)
            .with_context(|| format!("Unrecognized event payload: {}", path.display()))
    }

    /// Extracts the branch reference from a webhook payload.
    ///
    /// Understands Bitbucket push and pull request payloads as well as the
    /// generic `{"ref": "refs/heads/<branch>"}` shape.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        if let Some(pr) = payload.get("pullrequest") {
            let branch = pr
                .pointer("/source/branch/name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("pull request payload has no source branch"))?;
            let mut event = TriggerEvent::new(TriggerKind::PullRequest, branch);
            event.commit = pr
                .pointer("/source/commit/hash")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(event);
        }

        if let Some(changes) = payload.pointer("/push/changes").and_then(Value::as_array) {
            // The last change carries the state the push ended on.
            let latest = changes
                .iter()
                .rev()
                .find_map(|change| change.get("new").filter(|new| !new.is_null()))
                .ok_or_else(|| anyhow!("push payload contains no new branch state"))?;
            let branch = latest
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("push payload change has no branch name"))?;
            let mut event = TriggerEvent::new(TriggerKind::Push, branch);
            event.commit = latest
                .pointer("/target/hash")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(event);
        }

        if let Some(reference) = payload.get("ref").and_then(Value::as_str) {
            let mut event = TriggerEvent::new(TriggerKind::Push, reference);
            event.commit = payload
                .get("after")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(event);
        }

        Err(anyhow!(
            "expected a 'pullrequest', 'push.changes' or 'ref' field"
        ))
    }

    pub fn matches_any(&self, patterns: &[Pattern]) -> bool {
        patterns.is_empty() || patterns.iter().any(|p| p.matches(&self.branch))
    }
}

fn normalize_branch(reference: &str) -> String {
    reference
        .trim()
        .trim_start_matches("refs/heads/")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bitbucket_push() {
        let payload = json!({
            "push": {
                "changes": [
                    { "new": { "name": "feature/login", "target": { "hash": "abc123" } } }
                ]
            }
        });
        let event = TriggerEvent::from_payload(&payload).unwrap();
        assert_eq!(event.kind, TriggerKind::Push);
        assert_eq!(event.branch, "feature/login");
        assert_eq!(event.commit.as_deref(), Some("abc123"));
    }

    #[test]
    fn parses_bitbucket_pull_request() {
        let payload = json!({
            "pullrequest": {
                "source": { "branch": { "name": "bugfix/npe" }, "commit": { "hash": "def" } },
                "destination": { "branch": { "name": "main" } }
            }
        });
        let event = TriggerEvent::from_payload(&payload).unwrap();
        assert_eq!(event.kind, TriggerKind::PullRequest);
        assert_eq!(event.branch, "bugfix/npe");
    }

    #[test]
    fn parses_generic_ref_and_strips_prefix() {
        let event = TriggerEvent::from_payload(&json!({ "ref": "refs/heads/main" })).unwrap();
        assert_eq!(event.branch, "main");
    }

    #[test]
    fn deleted_branch_push_is_rejected() {
        let payload = json!({ "push": { "changes": [ { "new": null } ] } });
        assert!(TriggerEvent::from_payload(&payload).is_err());
    }

    #[test]
    fn branch_patterns() {
        let event = TriggerEvent::new(TriggerKind::Push, "release/1.2");
        assert!(event.matches_any(&[]));
        assert!(event.matches_any(&[Pattern::new("release/*").unwrap()]));
        assert!(!event.matches_any(&[Pattern::new("main").unwrap()]));
    }
}
