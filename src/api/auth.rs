//! Request authentication
//!
//! Bearer tokens from `[auth]` resolve to an `Authorizer` that handlers
//! consult before touching a branch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::storage::BranchKey;

/// Decides whether the caller may perform `actions` on `resources`
pub trait Authorizer: Send + Sync {
    fn authorize(&self, resources: &[String], actions: &[&str]) -> bool;
}

/// Authorizer for a configured token: an action list where `*` matches
/// everything and `backup:*` matches every backup action
pub struct TokenAuthorizer {
    actions: Vec<String>,
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, _resources: &[String], actions: &[&str]) -> bool {
        actions.iter().all(|action| {
            self.actions.iter().any(|granted| {
                granted == "*"
                    || granted == action
                    || granted
                        .strip_suffix(":*")
                        .map(|prefix| action.split(':').next() == Some(prefix))
                        .unwrap_or(false)
            })
        })
    }
}

/// Authorizer used when authentication is disabled
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _resources: &[String], _actions: &[&str]) -> bool {
        true
    }
}

/// Resolves `Authorization: Bearer` tokens
pub struct RequestAuthenticator {
    tokens: HashMap<String, Arc<dyn Authorizer>>,
}

impl RequestAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|t| {
                let authorizer: Arc<dyn Authorizer> = Arc::new(TokenAuthorizer {
                    actions: t.actions.clone(),
                });
                (t.token.clone(), authorizer)
            })
            .collect();
        Self { tokens }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Resolve the value of an Authorization header
    pub fn authenticate(&self, header: Option<&str>) -> Result<Arc<dyn Authorizer>> {
        if !self.is_enabled() {
            return Ok(Arc::new(AllowAll));
        }

        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;

        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("invalid token".into()))
    }
}

/// Resource name of a branch
pub fn branch_resource(key: &BranchKey) -> String {
    format!("database:{}:branch:{}", key.database_id, key.branch_id)
}

/// Fail with `Forbidden` unless `action` is allowed on the branch
pub fn authorize(authorizer: &dyn Authorizer, key: &BranchKey, action: &str) -> Result<()> {
    if authorizer.authorize(&[branch_resource(key)], &[action]) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("{} is not allowed on {}", action, key)))
    }
}
