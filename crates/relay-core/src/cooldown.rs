//! Cooldown state machine (spec §4.2).
//!
//! Decides, from a [`Classification`], what duration to bump a channel or key
//! cooldown by and whether to clear it. Writes themselves go through
//! [`Store`], using a context that keeps the request's trace id but detaches
//! cancellation — grounded in the detach-and-bound pattern the teacher uses
//! for `UnavailableQueue::push` recovery scheduling
//! (`gproxy-provider-core/src/credential/unavailable_queue.rs`), generalized
//! here from single-credential to channel+key cooldowns.

use std::time::Duration;

use relay_store::{ChannelId, CooldownState, Store};
use tokio::time::Instant;

use crate::classify::{Classification, RetryLevel};

const CEILING: Duration = Duration::from_secs(3600);
const FIXED_BYTE_TIMEOUT_COOLDOWN: Duration = Duration::from_secs(300);
const RATE_LIMIT_BASE: Duration = Duration::from_secs(1);
const SERVER_ERROR_BASE: Duration = Duration::from_secs(5 * 60);
const CHANNEL_AUTH_BASE: Duration = Duration::from_secs(5 * 60);
const KEY_AUTH_BASE: Duration = Duration::from_secs(10 * 60);

/// Bound applied to the detached state-fixup write (spec §4.2, §5).
pub const STATE_FIXUP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RetryKey,
    RetryChannel,
    ReturnClient,
}

/// What bumped, and by how much — for logging/testing, not a store write itself.
#[derive(Debug, Clone, Copy)]
pub struct Bump {
    pub duration: Duration,
    pub consecutive_failures: u32,
}

fn base_duration(status: u16, classification: &Classification) -> Option<Duration> {
    if let Some(fixed) = classification.fixed_cooldown {
        return Some(fixed);
    }
    match status {
        429 => Some(RATE_LIMIT_BASE),
        401 | 403 => Some(match classification.level {
            Some(RetryLevel::Channel) => CHANNEL_AUTH_BASE,
            _ => KEY_AUTH_BASE,
        }),
        s if s >= 500 => Some(SERVER_ERROR_BASE),
        _ => None,
    }
}

fn doubled(base: Duration, consecutive_failures: u32) -> Duration {
    let factor = 1u64.checked_shl(consecutive_failures.min(20)).unwrap_or(u64::MAX);
    base.checked_mul(factor as u32).unwrap_or(CEILING).min(CEILING)
}

/// Compute the next cooldown bump given the prior consecutive-failure count.
///
/// `retry_after` is the parsed `Retry-After` header value, if the upstream
/// sent one and it was a 429 — only honored for that status per spec §4.2.
pub fn compute_bump(
    status: u16,
    classification: &Classification,
    prior_consecutive_failures: u32,
    retry_after: Option<Duration>,
) -> Option<Bump> {
    // first-byte timeout is fixed, no backoff, no counter growth by design.
    if classification.fixed_cooldown.is_some() {
        return Some(Bump {
            duration: FIXED_BYTE_TIMEOUT_COOLDOWN,
            consecutive_failures: prior_consecutive_failures + 1,
        });
    }

    let base = base_duration(status, classification)?;
    let consecutive_failures = prior_consecutive_failures + 1;
    let mut duration = doubled(base, consecutive_failures - 1);

    if status == 429 {
        if let Some(retry_after) = retry_after {
            duration = duration.max(retry_after).min(CEILING);
        }
    }

    Some(Bump {
        duration,
        consecutive_failures,
    })
}

/// Decide the retry action for this attempt and persist the resulting
/// cooldown bump (or clear), using a cancellation-detached write bounded to
/// [`STATE_FIXUP_TIMEOUT`].
pub async fn handle_error(
    store: &dyn Store,
    channel_id: ChannelId,
    key_index: Option<u32>,
    status: u16,
    classification: &Classification,
    retry_after: Option<Duration>,
) -> Action {
    let Some(level) = classification.level else {
        clear(store, channel_id, key_index).await;
        return Action::ReturnClient;
    };

    if level == RetryLevel::Client {
        return Action::ReturnClient;
    }

    let prior = match level {
        RetryLevel::Channel => store.channel_cooldown(channel_id).await,
        RetryLevel::Key => {
            if let Some(idx) = key_index {
                store.key_cooldown(channel_id, idx).await
            } else {
                None
            }
        }
        RetryLevel::Client => unreachable!(),
    }
    .map(|c| c.consecutive_failures)
    .unwrap_or(0);

    if let Some(bump) = compute_bump(status, classification, prior, retry_after) {
        let write = write_cooldown(store, channel_id, key_index, level, bump);
        let _ = tokio::time::timeout(STATE_FIXUP_TIMEOUT, write).await;
    }

    match level {
        RetryLevel::Channel => Action::RetryChannel,
        RetryLevel::Key => Action::RetryKey,
        RetryLevel::Client => unreachable!(),
    }
}

async fn write_cooldown(
    store: &dyn Store,
    channel_id: ChannelId,
    key_index: Option<u32>,
    level: RetryLevel,
    bump: Bump,
) {
    let state = CooldownState {
        until: Instant::now() + bump.duration,
        consecutive_failures: bump.consecutive_failures,
    };
    match level {
        RetryLevel::Channel => store.set_channel_cooldown(channel_id, state).await,
        RetryLevel::Key => {
            if let Some(idx) = key_index {
                store.set_key_cooldown(channel_id, idx, state).await;
            }
        }
        RetryLevel::Client => {}
    }
}

/// Clear the cooldown after a success. Failure to clear is not surfaced to
/// the caller — the next request simply re-checks the stale cooldown record.
pub async fn clear(store: &dyn Store, channel_id: ChannelId, key_index: Option<u32>) {
    let clear = async {
        store.clear_channel_cooldown(channel_id).await;
        if let Some(idx) = key_index {
            store.clear_key_cooldown(channel_id, idx).await;
        }
    };
    let _ = tokio::time::timeout(STATE_FIXUP_TIMEOUT, clear).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{self, ErrorSignal};

    #[test]
    fn rate_limit_backoff_matches_spec_ratio() {
        let c = classify::classify(None, Some(429), 5);
        let b1 = compute_bump(429, &c, 0, None).unwrap();
        let b2 = compute_bump(429, &c, 1, None).unwrap();
        let b3 = compute_bump(429, &c, 2, None).unwrap();
        let b4 = compute_bump(429, &c, 3, None).unwrap();
        assert_eq!(b1.duration, Duration::from_secs(1));
        assert_eq!(b2.duration, Duration::from_secs(2));
        assert_eq!(b3.duration, Duration::from_secs(4));
        assert_eq!(b4.duration, Duration::from_secs(8));
        let ratio = b3.duration.as_secs_f64() / b2.duration.as_secs_f64();
        assert!((1.8..=2.2).contains(&ratio));
    }

    #[test]
    fn retry_after_on_429_wins_when_larger() {
        let c = classify::classify(None, Some(429), 5);
        let bump = compute_bump(429, &c, 0, Some(Duration::from_secs(30))).unwrap();
        assert_eq!(bump.duration, Duration::from_secs(30));
    }

    #[test]
    fn retry_after_does_not_shrink_computed_backoff() {
        let c = classify::classify(None, Some(429), 5);
        let bump = compute_bump(429, &c, 5, Some(Duration::from_millis(100))).unwrap();
        assert!(bump.duration > Duration::from_millis(100));
    }

    #[test]
    fn ceiling_caps_at_one_hour() {
        let c = classify::classify(None, Some(503), 5);
        let bump = compute_bump(503, &c, 30, None).unwrap();
        assert_eq!(bump.duration, CEILING);
    }

    #[test]
    fn first_byte_timeout_is_fixed_not_exponential() {
        let c = classify::classify(Some(ErrorSignal::FirstByteTimeout), None, 5);
        let b1 = compute_bump(598, &c, 0, None).unwrap();
        let b2 = compute_bump(598, &c, 4, None).unwrap();
        assert_eq!(b1.duration, FIXED_BYTE_TIMEOUT_COOLDOWN);
        assert_eq!(b2.duration, FIXED_BYTE_TIMEOUT_COOLDOWN);
    }

    #[test]
    fn single_key_auth_upgrade_uses_channel_base() {
        let c = classify::classify(None, Some(401), 1);
        let bump = compute_bump(401, &c, 0, None).unwrap();
        assert_eq!(bump.duration, CHANNEL_AUTH_BASE);
    }

    #[test]
    fn multi_key_auth_uses_key_base() {
        let c = classify::classify(None, Some(401), 4);
        let bump = compute_bump(401, &c, 0, None).unwrap();
        assert_eq!(bump.duration, KEY_AUTH_BASE);
    }

    #[tokio::test]
    async fn handle_error_bumps_channel_then_clears() {
        let store = relay_store::InMemoryStore::new();
        let c = classify::classify(None, Some(503), 5);
        let action = handle_error(&store, 1, Some(0), 503, &c, None).await;
        assert_eq!(action, Action::RetryChannel);
        assert!(store.channel_cooldown(1).await.is_some());

        clear(&store, 1, Some(0)).await;
        assert!(store.channel_cooldown(1).await.is_none());
    }

    #[tokio::test]
    async fn handle_error_on_client_level_returns_without_writes() {
        let store = relay_store::InMemoryStore::new();
        let c = classify::classify(None, Some(404), 5);
        let action = handle_error(&store, 1, Some(0), 404, &c, None).await;
        assert_eq!(action, Action::ReturnClient);
        assert!(store.channel_cooldown(1).await.is_none());
    }
}
