//! Memory gateway: the external knowledge service consulted for stage
//! context.
//!
//! The gateway is consumed, not owned: `search` ranks fact snippets for a
//! query within the given namespaces, `store` persists a fact for later
//! campaigns. Failures here degrade context quality but never stop the
//! pipeline; callers log and continue.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// One ranked fact snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFact {
    #[serde(alias = "memory")]
    pub text: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Namespace scheme shared with the workers: working memory per campaign,
/// persistent memory per project, global user preferences.
pub mod namespace {
    pub fn campaign(campaign_id: &str) -> String {
        format!("campaign:{campaign_id}")
    }

    pub fn project(project: &str) -> String {
        format!("project:{project}")
    }

    pub fn global() -> String {
        "global:user".to_string()
    }
}

#[async_trait]
pub trait MemoryGateway: Send + Sync {
    /// Ranked facts relevant to `query` across `namespaces`, at most
    /// `limit` in total.
    async fn search(
        &self,
        query: &str,
        namespaces: &[String],
        limit: usize,
    ) -> Result<Vec<MemoryFact>>;

    /// Persist a fact under a namespace for reuse by later campaigns.
    async fn store(&self, fact: &str, namespace: &str, metadata: serde_json::Value) -> Result<()>;
}

/// Gateway used when memory is disabled: finds nothing, stores nowhere.
pub struct NullMemoryGateway;

#[async_trait]
impl MemoryGateway for NullMemoryGateway {
    async fn search(&self, _: &str, _: &[String], _: usize) -> Result<Vec<MemoryFact>> {
        Ok(Vec::new())
    }

    async fn store(&self, _: &str, _: &str, _: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { results: Vec<MemoryFact> },
    Bare(Vec<MemoryFact>),
}

impl SearchResponse {
    fn into_facts(self) -> Vec<MemoryFact> {
        match self {
            SearchResponse::Wrapped { results } => results,
            SearchResponse::Bare(facts) => facts,
        }
    }
}

/// HTTP client for the memory sidecar's REST API.
pub struct HttpMemoryGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMemoryGateway {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MemoryGateway for HttpMemoryGateway {
    async fn search(
        &self,
        query: &str,
        namespaces: &[String],
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        let mut facts = Vec::new();
        for ns in namespaces {
            let response = self
                .client
                .post(format!("{}/search", self.base_url))
                .json(&json!({ "query": query, "user_id": ns, "limit": limit }))
                .send()
                .await
                .with_context(|| format!("memory search failed for namespace {ns}"))?
                .error_for_status()
                .context("memory search returned an error status")?;
            let parsed: SearchResponse = response
                .json()
                .await
                .context("memory search response was not valid JSON")?;
            for mut fact in parsed.into_facts() {
                fact.namespace.get_or_insert_with(|| ns.clone());
                facts.push(fact);
            }
        }
        // Best matches across all namespaces first; unscored facts last.
        facts.sort_by(|a, b| {
            b.score
                .unwrap_or(f64::MIN)
                .total_cmp(&a.score.unwrap_or(f64::MIN))
        });
        facts.truncate(limit);
        debug!(count = facts.len(), %query, "memory search complete");
        Ok(facts)
    }

    async fn store(&self, fact: &str, namespace: &str, metadata: serde_json::Value) -> Result<()> {
        self.client
            .post(format!("{}/memories", self.base_url))
            .json(&json!({
                "messages": [{ "role": "user", "content": fact }],
                "user_id": namespace,
                "metadata": metadata,
            }))
            .send()
            .await
            .with_context(|| format!("memory store failed for namespace {namespace}"))?
            .error_for_status()
            .context("memory store returned an error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_follow_the_scheme() {
        assert_eq!(namespace::campaign("cmp_1"), "campaign:cmp_1");
        assert_eq!(namespace::project("authsvc"), "project:authsvc");
        assert_eq!(namespace::global(), "global:user");
    }

    #[test]
    fn search_response_accepts_both_shapes() {
        let wrapped: SearchResponse = serde_json::from_str(
            r#"{"results": [{"memory": "prefer sqlx", "score": 0.9}]}"#,
        )
        .unwrap();
        let facts = wrapped.into_facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].text, "prefer sqlx");

        let bare: SearchResponse =
            serde_json::from_str(r#"[{"text": "tests live in tests/", "score": 0.4}]"#).unwrap();
        assert_eq!(bare.into_facts().len(), 1);
    }

    #[tokio::test]
    async fn null_gateway_finds_nothing() {
        let gateway = NullMemoryGateway;
        let facts = gateway
            .search("anything", &[namespace::global()], 5)
            .await
            .unwrap();
        assert!(facts.is_empty());
        gateway
            .store("fact", &namespace::global(), serde_json::Value::Null)
            .await
            .unwrap();
    }
}
