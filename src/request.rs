//! Crawl request types
//!
//! A Request is the unit of work flowing through the queues: one entity
//! fetch against the upstream API, plus the bookkeeping the cluster needs
//! to deduplicate, retry, and defer it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default number of delivery attempts before a request is dropped
/// (deadletter capture hangs off this point in the full system).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How a finished request leaves the worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Processed successfully; acknowledge and clear the tracker tag
    Completed,
    /// Transient failure; requeue immediately
    Requeue,
    /// Not runnable right now; requeue later
    Defer,
}

/// A single unit of crawl work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique delivery id, assigned at creation
    pub id: String,
    /// Entity kind ("repo", "issue", "pull_request", "event", ...)
    pub kind: String,
    /// Entity URL on the upstream API
    pub url: String,
    /// Traversal policy name; doubles as the rate-limit traffic class
    pub policy: String,
    /// Delivery attempts so far
    pub attempt_count: u32,
    /// Opaque context supplied by the producer (traversal hints, traits)
    #[serde(default)]
    pub context: Value,
    /// Opaque metadata carried for the document store
    #[serde(default)]
    pub meta: Value,
    /// Whether execution must be guarded by the cluster-wide tracker
    pub requires_lock: bool,
    /// When the request was created
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Create a new request for an entity
    pub fn new(kind: &str, url: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            url: url.to_string(),
            policy: "default".to_string(),
            attempt_count: 0,
            context: Value::Null,
            meta: Value::Null,
            requires_lock: true,
            created_at: Utc::now(),
        }
    }

    /// Set the traversal policy
    pub fn with_policy(mut self, policy: &str) -> Self {
        self.policy = policy.to_string();
        self
    }

    /// Opt out of cluster-wide execution guarding
    pub fn without_lock(mut self) -> Self {
        self.requires_lock = false;
        self
    }

    /// Stable identity key used for deduplication across the cluster.
    ///
    /// Two requests for the same `(kind, url)` are the same unit of work no
    /// matter which producer discovered them or how many times they were
    /// enqueued.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.kind, self.url)
    }

    /// Traffic class used for per-credential call-rate accounting
    pub fn traffic_class(&self) -> &str {
        &self.policy
    }

    /// Ordered fallback trait-sets the credential must satisfy.
    ///
    /// Producers may pin requests to capability classes through
    /// `context.traits` as a list of lists; absent or malformed context
    /// means any credential will do.
    pub fn token_traits(&self) -> Vec<Vec<String>> {
        let Some(sets) = self.context.get("traits").and_then(Value::as_array) else {
            return Vec::new();
        };
        sets.iter()
            .filter_map(Value::as_array)
            .map(|set| {
                set.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    }

    /// Record another delivery attempt
    pub fn mark_attempt(&mut self) {
        self.attempt_count += 1;
    }

    /// Whether the request has exhausted its delivery attempts
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= DEFAULT_MAX_ATTEMPTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_is_stable_across_copies() {
        let a = Request::new("repo", "https://api.example.com/repos/acme/widget");
        let b = Request::new("repo", "https://api.example.com/repos/acme/widget");
        assert_ne!(a.id, b.id);
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_token_traits_from_context() {
        let mut req = Request::new("repo", "https://api.example.com/repos/acme/widget");
        req.context = json!({ "traits": [["admin"], ["public"]] });
        assert_eq!(
            req.token_traits(),
            vec![vec!["admin".to_string()], vec!["public".to_string()]]
        );

        let plain = Request::new("event", "https://api.example.com/events");
        assert!(plain.token_traits().is_empty());
    }

    #[test]
    fn test_roundtrips_through_json() {
        let req = Request::new("issue", "https://api.example.com/issues/1").with_policy("soon");
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.identity(), req.identity());
        assert_eq!(decoded.policy, "soon");
    }
}
