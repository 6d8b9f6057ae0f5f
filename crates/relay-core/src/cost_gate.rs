//! Cost gate (spec §4.11): per-auth-token budget enforcement.
//!
//! Pre-forward check is a cheap comparison against the token's already-used
//! counter (kept authoritative in the store); post-success the computed cost
//! is folded in. Grounded in the teacher's `GlobalConfig`/`AuthToken`-style
//! budget fields generalized from `gproxy-provider-core`'s disallow-scope
//! checks (`gproxy-provider-core/src/disallow.rs`) to a numeric budget.

use relay_store::{AuthToken, AuthTokenId, Store};

use crate::sse::UsageTokens;

/// Converts extracted token counts into micro-USD. A concrete per-model
/// price table is an external collaborator (spec explicitly excludes
/// model-capability inference from this system); the zero estimator below
/// is the only implementation shipped here.
pub trait CostEstimator: Send + Sync {
    fn estimate_micro_usd(&self, model: &str, usage: &UsageTokens) -> u64;
}

pub struct ZeroCostEstimator;

impl CostEstimator for ZeroCostEstimator {
    fn estimate_micro_usd(&self, _model: &str, _usage: &UsageTokens) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    ModelNotAllowed,
    BudgetExceeded,
}

/// Pre-forward check: model allowlist, then remaining budget.
///
/// `estimated_additional_micro_usd` is 0 at admission time (spec: "check
/// `used + 0 <= limit`") since actual cost isn't known until the response is
/// metered; it exists as a parameter so a future estimator can tighten this
/// without changing the call site.
pub fn check(token: &AuthToken, model: &str, estimated_additional_micro_usd: u64) -> Result<(), GateError> {
    if !token.allows_model(model) {
        return Err(GateError::ModelNotAllowed);
    }
    if !token.has_budget_for(estimated_additional_micro_usd) {
        return Err(GateError::BudgetExceeded);
    }
    Ok(())
}

/// Post-success: persist the metered cost against the token's running total.
pub async fn record_usage(store: &dyn Store, token_id: AuthTokenId, cost_micro_usd: u64) {
    store.add_token_usage(token_id, cost_micro_usd).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(limit: u64, used: u64, allowlist: Option<Vec<String>>) -> AuthToken {
        AuthToken {
            id: 1,
            hash: "h".to_string(),
            model_allowlist: allowlist,
            limit_micro_usd: limit,
            used_micro_usd: used,
        }
    }

    #[test]
    fn disallowed_model_is_rejected_before_budget() {
        let t = token(0, 0, Some(vec!["gpt-4".to_string()]));
        assert_eq!(check(&t, "claude-3", 0), Err(GateError::ModelNotAllowed));
    }

    #[test]
    fn exhausted_budget_is_rejected() {
        let t = token(100, 100, None);
        assert_eq!(check(&t, "gpt-4", 1), Err(GateError::BudgetExceeded));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let t = token(0, 1_000_000, None);
        assert_eq!(check(&t, "gpt-4", 1), Ok(()));
    }

    #[tokio::test]
    async fn record_usage_accumulates_in_store() {
        let store = relay_store::InMemoryStore::new();
        store.insert_auth_token(token(1_000_000, 0, None));
        record_usage(&store, 1, 250_000).await;
        let t = store.lookup_auth_token("h").await.unwrap();
        assert_eq!(t.used_micro_usd, 250_000);
    }
}
