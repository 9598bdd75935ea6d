//! Credential pool with trait matching and cooldown benching
//!
//! Every worker loop in the process draws from one pool; the bench state
//! is the single in-process source of truth for credential health and is
//! mutated only through [`TokenPool::exhaust`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;

use crate::error::TokenError;

/// One upstream API credential
#[derive(Debug, Clone)]
pub struct ApiToken {
    /// The secret value presented to the upstream API
    pub value: String,
    /// Capability tags ("admin", "private", "push", "public", ...)
    pub traits: HashSet<String>,
    /// Ineligible for selection until this instant, if set
    pub bench_until: Option<DateTime<Utc>>,
}

impl ApiToken {
    /// Create an unbenched token with the given traits
    pub fn new(value: &str, traits: &[&str]) -> Self {
        Self {
            value: value.to_string(),
            traits: traits.iter().map(|t| t.to_string()).collect(),
            bench_until: None,
        }
    }

    fn is_benched(&self, now: DateTime<Utc>) -> bool {
        matches!(self.bench_until, Some(until) if until > now)
    }

    fn has_traits(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|t| self.traits.contains(t))
    }
}

/// Outcome of a credential selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenGrant {
    /// An eligible credential value, picked uniformly at random among
    /// the matching unbenched candidates
    Granted(String),
    /// Every matching credential is benched; retry at this instant
    RetryAt(DateTime<Utc>),
    /// No credential carries the requested traits at all
    NoMatch,
}

/// Shared pool of API credentials
pub struct TokenPool {
    tokens: RwLock<Vec<ApiToken>>,
}

impl TokenPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(Vec::new()),
        }
    }

    /// Create a pool from a spec string (see [`TokenPool::set_tokens_from_spec`])
    pub fn from_spec(spec: &str) -> Result<Self, TokenError> {
        let pool = Self::new();
        pool.set_tokens_from_spec(spec)?;
        Ok(pool)
    }

    /// Replace the whole pool atomically with a pre-structured list
    pub fn set_tokens(&self, tokens: Vec<ApiToken>) {
        *self.tokens.write() = tokens;
    }

    /// Replace the whole pool atomically from a spec string of the form
    /// `"value#trait1,trait2;value2#trait3"`.
    ///
    /// The spec is parsed completely before the swap, so a malformed
    /// segment leaves the existing pool untouched.
    pub fn set_tokens_from_spec(&self, spec: &str) -> Result<(), TokenError> {
        let mut parsed = Vec::new();
        for segment in spec.split(';').filter(|s| !s.trim().is_empty()) {
            let (value, traits) = match segment.split_once('#') {
                Some((value, traits)) => (value.trim(), traits),
                None => (segment.trim(), ""),
            };
            if value.is_empty() {
                return Err(TokenError::InvalidSpec {
                    segment: segment.to_string(),
                    reason: "empty token value".into(),
                });
            }
            let traits: HashSet<String> = traits
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            parsed.push(ApiToken {
                value: value.to_string(),
                traits,
                bench_until: None,
            });
        }
        if parsed.is_empty() {
            return Err(TokenError::EmptyPool);
        }
        self.set_tokens(parsed);
        Ok(())
    }

    /// Select an eligible credential.
    ///
    /// `desired_trait_sets` is an ordered fallback list: each entry is a
    /// set of traits the credential must carry. An empty list means any
    /// credential. Per set, candidates are tokens whose traits are a
    /// superset of the set and that are not benched; the first set with
    /// candidates wins and one is returned uniformly at random to spread
    /// load. If matching tokens exist but all are benched, the earliest
    /// bench expiry across every set examined is returned instead.
    pub fn get_token(&self, desired_trait_sets: &[Vec<String>]) -> TokenGrant {
        let now = Utc::now();
        let tokens = self.tokens.read();

        let any = vec![Vec::new()];
        let sets: &[Vec<String>] = if desired_trait_sets.is_empty() {
            &any
        } else {
            desired_trait_sets
        };

        let mut earliest_bench: Option<DateTime<Utc>> = None;
        for wanted in sets {
            let mut eligible = Vec::new();
            for token in tokens.iter().filter(|t| t.has_traits(wanted)) {
                if token.is_benched(now) {
                    let until = token.bench_until.unwrap_or(now);
                    earliest_bench = Some(match earliest_bench {
                        Some(seen) if seen <= until => seen,
                        _ => until,
                    });
                } else {
                    eligible.push(&token.value);
                }
            }
            if !eligible.is_empty() {
                let pick = rand::thread_rng().gen_range(0..eligible.len());
                return TokenGrant::Granted(eligible[pick].clone());
            }
        }

        match earliest_bench {
            Some(until) => TokenGrant::RetryAt(until),
            None => TokenGrant::NoMatch,
        }
    }

    /// Bench a credential until the given instant.
    ///
    /// Monotonic: an existing later bench is never shortened. Returns the
    /// effective bench time, or `None` if the token is unknown.
    pub fn exhaust(&self, value: &str, until: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut tokens = self.tokens.write();
        let token = tokens.iter_mut().find(|t| t.value == value)?;
        let effective = match token.bench_until {
            Some(existing) if existing >= until => existing,
            _ => {
                token.bench_until = Some(until);
                until
            }
        };
        Some(effective)
    }

    /// Number of tokens currently in the pool
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether the pool holds no tokens
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sets(groups: &[&[&str]]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| g.iter().map(|t| t.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_spec_parsing_and_trait_selection() {
        let pool = TokenPool::from_spec("1111#admin,private,push;2222#public").unwrap();
        assert_eq!(pool.len(), 2);

        assert_eq!(
            pool.get_token(&sets(&[&["admin"]])),
            TokenGrant::Granted("1111".to_string())
        );
        assert_eq!(
            pool.get_token(&sets(&[&["public"]])),
            TokenGrant::Granted("2222".to_string())
        );
        assert!(matches!(pool.get_token(&[]), TokenGrant::Granted(_)));
    }

    #[test]
    fn test_never_returns_a_benched_token() {
        let pool = TokenPool::from_spec("1111#admin;2222#admin").unwrap();
        let until = Utc::now() + Duration::minutes(5);
        pool.exhaust("1111", until);

        for _ in 0..50 {
            match pool.get_token(&sets(&[&["admin"]])) {
                TokenGrant::Granted(value) => assert_eq!(value, "2222"),
                other => panic!("unexpected grant: {other:?}"),
            }
        }
    }

    #[test]
    fn test_all_benched_returns_earliest_expiry() {
        let pool = TokenPool::from_spec("1111#admin;2222#admin").unwrap();
        let sooner = Utc::now() + Duration::minutes(2);
        let later = Utc::now() + Duration::minutes(10);
        pool.exhaust("1111", later);
        pool.exhaust("2222", sooner);

        assert_eq!(
            pool.get_token(&sets(&[&["admin"]])),
            TokenGrant::RetryAt(sooner)
        );
    }

    #[test]
    fn test_no_match_when_traits_unknown() {
        let pool = TokenPool::from_spec("1111#admin").unwrap();
        assert_eq!(pool.get_token(&sets(&[&["deploy"]])), TokenGrant::NoMatch);
    }

    #[test]
    fn test_exhaust_is_monotonic() {
        let pool = TokenPool::from_spec("1111#admin").unwrap();
        let later = Utc::now() + Duration::minutes(10);
        let sooner = Utc::now() + Duration::minutes(1);

        assert_eq!(pool.exhaust("1111", later), Some(later));
        assert_eq!(pool.exhaust("1111", sooner), Some(later));
        assert_eq!(pool.exhaust("missing", later), None);
    }

    #[test]
    fn test_expired_bench_is_eligible_again() {
        let pool = TokenPool::from_spec("1111#admin").unwrap();
        pool.exhaust("1111", Utc::now() - Duration::seconds(1));
        assert_eq!(
            pool.get_token(&sets(&[&["admin"]])),
            TokenGrant::Granted("1111".to_string())
        );
    }

    #[test]
    fn test_fallback_order_prefers_earlier_sets() {
        let pool = TokenPool::from_spec("1111#admin;2222#public").unwrap();
        // First set has no candidates; falls back to the second.
        assert_eq!(
            pool.get_token(&sets(&[&["deploy"], &["public"]])),
            TokenGrant::Granted("2222".to_string())
        );
    }

    #[test]
    fn test_malformed_spec_leaves_pool_untouched() {
        let pool = TokenPool::from_spec("1111#admin").unwrap();
        assert!(pool.set_tokens_from_spec("#admin").is_err());
        assert_eq!(pool.len(), 1);
        assert!(matches!(
            pool.get_token(&sets(&[&["admin"]])),
            TokenGrant::Granted(_)
        ));
    }
}
