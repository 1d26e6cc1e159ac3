//! Fleet membership: which nodes a pattern targets.
//!
//! Patterns are regular expressions matched from the start of the node name,
//! so `web` targets `web-1` and `web-2` but not `db-web`. Use `$` to pin the
//! end. The exclude pattern follows the same rule and is subtracted from the
//! matches.

use std::collections::BTreeSet;

use async_trait::async_trait;
use regex::Regex;

use crate::error::DirectoryError;

#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Nodes matching `pattern` and not matching `exclude`, sorted.
    async fn resolve(
        &self,
        pattern: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<String>, DirectoryError>;
}

fn compile(pattern: &str) -> Result<Regex, DirectoryError> {
    Regex::new(&format!("^(?:{})", pattern)).map_err(|source| DirectoryError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Filter `candidates` by `pattern` minus `exclude`. The result is sorted and
/// free of duplicates.
pub fn match_nodes<I, S>(
    candidates: I,
    pattern: &str,
    exclude: Option<&str>,
) -> Result<Vec<String>, DirectoryError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let include = compile(pattern)?;
    let exclude = match exclude.filter(|e| !e.is_empty()) {
        Some(e) => Some(compile(e)?),
        None => None,
    };

    let matched: BTreeSet<String> = candidates
        .into_iter()
        .filter(|node| include.is_match(node.as_ref()))
        .filter(|node| {
            !exclude
                .as_ref()
                .is_some_and(|ex| ex.is_match(node.as_ref()))
        })
        .map(|node| node.as_ref().to_string())
        .collect();
    Ok(matched.into_iter().collect())
}

/// A fixed list of nodes.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    nodes: Vec<String>,
}

impl StaticDirectory {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl NodeDirectory for StaticDirectory {
    async fn resolve(
        &self,
        pattern: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<String>, DirectoryError> {
        match_nodes(&self.nodes, pattern, exclude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &[&str] = &["web-1", "web-2", "web-10", "db-1", "db-web"];

    #[test]
    fn pattern_matches_from_start() {
        let nodes = match_nodes(FLEET, "web", None).unwrap();
        assert_eq!(nodes, vec!["web-1", "web-10", "web-2"]);
    }

    #[test]
    fn exclude_is_subtracted() {
        let nodes = match_nodes(FLEET, "web-.*", Some("web-1$")).unwrap();
        assert_eq!(nodes, vec!["web-10", "web-2"]);
    }

    #[test]
    fn empty_exclude_is_ignored() {
        let nodes = match_nodes(FLEET, "db", Some("")).unwrap();
        assert_eq!(nodes, vec!["db-1", "db-web"]);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        assert!(match_nodes(FLEET, "cache", None).unwrap().is_empty());
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = match_nodes(FLEET, "web(", None).unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidPattern { .. }));
    }

    #[tokio::test]
    async fn static_directory_resolves() {
        let dir = StaticDirectory::new(["a1", "a2", "b1"]);
        assert_eq!(dir.resolve("a", None).await.unwrap(), vec!["a1", "a2"]);
        assert_eq!(dir.resolve(".*", Some("a")).await.unwrap(), vec!["b1"]);
    }
}
