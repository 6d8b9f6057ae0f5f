//! Key selector (spec §4.3).
//!
//! Picks the next API key to try for a channel, honoring cooldowns and the
//! set of keys already tried this request. Grounded in the teacher's
//! `CredentialPool::acquire`/`acquire_for_model`
//! (`gproxy-provider-core/src/credential/pool.rs`), which filters a
//! candidate set by state and hands back one entry; this generalizes that to
//! the two explicit strategies spec §4.3 names.

use std::collections::HashSet;

use relay_store::{ApiKey, ChannelId, KeyStrategy, Store};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    NoKeys,
    AllCooledOrTried,
}

pub struct Selected {
    pub key_index: u32,
    pub secret: String,
}

/// Select the next key to try, in key-index order for the sequential
/// strategy or starting at the channel's round-robin counter otherwise.
///
/// `excluded` holds key indices already attempted this request.
pub async fn select(
    store: &dyn Store,
    channel_id: ChannelId,
    keys: &[ApiKey],
    excluded: &HashSet<u32>,
) -> Result<Selected, SelectError> {
    if keys.is_empty() {
        return Err(SelectError::NoKeys);
    }

    let now = Instant::now();
    let mut candidates = Vec::with_capacity(keys.len());
    for key in keys {
        if excluded.contains(&key.key_index) {
            continue;
        }
        let cooled = store
            .key_cooldown(channel_id, key.key_index)
            .await
            .is_some_and(|c| c.is_active(now));
        if !cooled {
            candidates.push(key);
        }
    }
    if candidates.is_empty() {
        return Err(SelectError::AllCooledOrTried);
    }
    candidates.sort_by_key(|k| k.key_index);

    let strategy = keys.first().map(|k| k.strategy).unwrap_or(KeyStrategy::Sequential);
    let chosen = match strategy {
        KeyStrategy::Sequential => candidates[0],
        KeyStrategy::RoundRobin => {
            let counter = store.next_round_robin(channel_id).await;
            let idx = (counter as usize) % candidates.len();
            candidates[idx]
        }
    };

    Ok(Selected {
        key_index: chosen.key_index,
        secret: chosen.secret.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::InMemoryStore;

    fn key(channel_id: ChannelId, index: u32, strategy: KeyStrategy) -> ApiKey {
        ApiKey {
            channel_id,
            key_index: index,
            secret: format!("secret-{index}"),
            strategy,
        }
    }

    #[tokio::test]
    async fn sequential_picks_lowest_index_candidate() {
        let store = InMemoryStore::new();
        let keys = vec![
            key(1, 0, KeyStrategy::Sequential),
            key(1, 2, KeyStrategy::Sequential),
        ];
        let selected = select(&store, 1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(selected.key_index, 0);
    }

    #[tokio::test]
    async fn round_robin_advances_over_non_contiguous_indices() {
        let store = InMemoryStore::new();
        let keys = vec![
            key(1, 0, KeyStrategy::RoundRobin),
            key(1, 5, KeyStrategy::RoundRobin),
            key(1, 9, KeyStrategy::RoundRobin),
        ];
        let a = select(&store, 1, &keys, &HashSet::new()).await.unwrap();
        let b = select(&store, 1, &keys, &HashSet::new()).await.unwrap();
        let c = select(&store, 1, &keys, &HashSet::new()).await.unwrap();
        let d = select(&store, 1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(
            [a.key_index, b.key_index, c.key_index, d.key_index],
            [0, 5, 9, 0]
        );
    }

    #[tokio::test]
    async fn excluded_and_cooled_keys_are_skipped() {
        let store = InMemoryStore::new();
        let keys = vec![key(1, 0, KeyStrategy::Sequential), key(1, 1, KeyStrategy::Sequential)];
        let mut excluded = HashSet::new();
        excluded.insert(0);
        let selected = select(&store, 1, &keys, &excluded).await.unwrap();
        assert_eq!(selected.key_index, 1);
    }

    #[tokio::test]
    async fn no_keys_is_an_error() {
        let store = InMemoryStore::new();
        let err = select(&store, 1, &[], &HashSet::new()).await.unwrap_err();
        assert_eq!(err, SelectError::NoKeys);
    }

    #[tokio::test]
    async fn all_excluded_is_an_error() {
        let store = InMemoryStore::new();
        let keys = vec![key(1, 0, KeyStrategy::Sequential)];
        let mut excluded = HashSet::new();
        excluded.insert(0);
        let err = select(&store, 1, &keys, &excluded).await.unwrap_err();
        assert_eq!(err, SelectError::AllCooledOrTried);
    }
}
