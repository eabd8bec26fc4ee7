use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

/// Scope-based authorization, consumed as a capability.
///
/// `scope_sets` is a disjunction of conjunctions: the caller is authorized
/// when every scope in at least one set is satisfied.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn satisfies(&self, scope_sets: &[Vec<String>]) -> Result<bool>;
}

/// Authorizer over a fixed scope set, with taskcluster-style `*` prefix
/// expansion. Production deployments swap in a client for the auth service;
/// tests and single-tenant deployments use this directly.
pub struct StaticAuthorizer {
    scopes: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn new(scopes: impl IntoIterator<Item = String>) -> Self {
        StaticAuthorizer {
            scopes: scopes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn satisfies(&self, scope_sets: &[Vec<String>]) -> Result<bool> {
        Ok(scope_sets
            .iter()
            .any(|set| set.iter().all(|scope| scope_satisfied(&self.scopes, scope))))
    }
}

fn scope_satisfied(held: &HashSet<String>, required: &str) -> bool {
    held.contains(required)
        || held
            .iter()
            .any(|scope| scope.ends_with('*') && required.starts_with(&scope[..scope.len() - 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_and_star_scopes() {
        let auth = StaticAuthorizer::new([
            "queue:get-artifact:private/data.json".to_string(),
            "queue:create-artifact:public/*".to_string(),
        ]);
        assert!(auth
            .satisfies(&[vec!["queue:get-artifact:private/data.json".to_string()]])
            .await
            .unwrap());
        assert!(auth
            .satisfies(&[vec!["queue:create-artifact:public/logs/live.log".to_string()]])
            .await
            .unwrap());
        assert!(!auth
            .satisfies(&[vec!["queue:create-artifact:private/x".to_string()]])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_any_set_suffices() {
        let auth = StaticAuthorizer::new(["queue:create-artifact:t1/0".to_string()]);
        let sets = vec![
            vec![
                "queue:create-artifact:public/x".to_string(),
                "assume:worker-id:wg/wid".to_string(),
            ],
            vec!["queue:create-artifact:t1/0".to_string()],
        ];
        assert!(auth.satisfies(&sets).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_scopes_in_set_required() {
        let auth = StaticAuthorizer::new(["queue:create-artifact:public/x".to_string()]);
        let sets = vec![vec![
            "queue:create-artifact:public/x".to_string(),
            "assume:worker-id:wg/wid".to_string(),
        ]];
        assert!(!auth.satisfies(&sets).await.unwrap());
    }
}
