//! Candidate selector (spec §4.4): decides the ordered list of channels to
//! try for a (model, channel-type) pair.
//!
//! Grounded in the teacher's `CredentialPool::acquire_for_model`
//! (`gproxy-provider-core/src/credential/pool.rs`) for the filter-then-pick
//! shape, generalized to the full lookup → fuzzy → cost → cooldown →
//! fallback → ordering pipeline spec §4.4 describes.

use std::collections::HashMap;

use relay_common::Settings;
use relay_store::{Channel, ChannelId, ChannelType, Store};
use tokio::time::Instant;

use crate::health::HealthCache;
use crate::swrr;

/// A channel ready to be tried, carrying the weight its equal-priority group
/// used when ordering it (for diagnostics/tests only).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel: Channel,
    pub effective_priority: f64,
}

fn strip_date_suffix(model: &str) -> Option<&str> {
    let (base, suffix) = model.rsplit_once('-')?;
    if suffix.len() == 8 && suffix.bytes().all(|b| b.is_ascii_digit()) {
        let year: i32 = suffix[0..4].parse().ok()?;
        let month: u32 = suffix[4..6].parse().ok()?;
        let day: u32 = suffix[6..8].parse().ok()?;
        if (1..=12).contains(&month) && (1..=31).contains(&day) && year > 1900 {
            return Some(base);
        }
    }
    None
}

fn matches_exact(channel: &Channel, model: &str, channel_type: Option<ChannelType>) -> bool {
    if let Some(t) = channel_type {
        if channel.channel_type != t {
            return false;
        }
    }
    channel.model_entry(model).is_some()
}

fn matches_fuzzy(channel: &Channel, model: &str, channel_type: Option<ChannelType>) -> bool {
    if let Some(t) = channel_type {
        if channel.channel_type != t {
            return false;
        }
    }
    channel
        .models
        .iter()
        .any(|m| m.model.contains(model) || model.contains(&m.model))
}

async fn is_cooled(store: &dyn Store, channel: &Channel, now: Instant) -> bool {
    let channel_cooled = store
        .channel_cooldown(channel.id)
        .await
        .is_some_and(|c| c.is_active(now));
    if channel_cooled {
        return true;
    }
    let keys = store.list_keys(channel.id).await;
    if keys.is_empty() {
        return false;
    }
    for key in &keys {
        let cooled = store
            .key_cooldown(channel.id, key.key_index)
            .await
            .is_some_and(|c| c.is_active(now));
        if !cooled {
            return false;
        }
    }
    true
}

async fn ready_at(store: &dyn Store, channel: &Channel) -> Instant {
    let channel_until = store
        .channel_cooldown(channel.id)
        .await
        .map(|c| c.until)
        .unwrap_or_else(Instant::now);
    let keys = store.list_keys(channel.id).await;
    let earliest_key = futures_util::future::join_all(
        keys.iter()
            .map(|k| store.key_cooldown(channel.id, k.key_index)),
    )
    .await
    .into_iter()
    .flatten()
    .map(|c| c.until)
    .min();
    match earliest_key {
        Some(key_until) => channel_until.max(key_until),
        None => channel_until,
    }
}

fn effective_priority(channel: &Channel, health: &HealthCache, settings: &Settings) -> f64 {
    let stats = health.get(channel.id);
    let confidence = (stats.sample_count as f64 / settings.health_min_confident_sample.max(1) as f64).min(1.0);
    channel.priority as f64 - (1.0 - stats.success_rate) * settings.health_penalty_weight * confidence
}

/// Select the ordered list of channels to try, per spec §4.4.
pub async fn select(
    store: &dyn Store,
    health: &HealthCache,
    settings: &Settings,
    model: &str,
    channel_type: Option<ChannelType>,
) -> Vec<Candidate> {
    let all: Vec<Channel> = store
        .list_channels()
        .await
        .into_iter()
        .filter(|c| c.enabled)
        .collect();

    let mut primary: Vec<Channel> = all
        .iter()
        .filter(|c| matches_exact(c, model, channel_type))
        .cloned()
        .collect();

    if primary.is_empty() && settings.strip_date_suffix_enabled {
        if let Some(stripped) = strip_date_suffix(model) {
            primary = all
                .iter()
                .filter(|c| matches_exact(c, stripped, channel_type))
                .cloned()
                .collect();
        }
    }

    if primary.is_empty() && settings.fuzzy_match_enabled && model != "*" {
        primary = all
            .iter()
            .filter(|c| matches_fuzzy(c, model, channel_type))
            .cloned()
            .collect();
    }

    let mut filtered = Vec::new();
    for channel in primary {
        if channel.daily_cost_limit_usd > 0.0 {
            let spent = store.today_cost_usd(channel.id).await;
            if spent >= channel.daily_cost_limit_usd {
                continue;
            }
        }
        filtered.push(channel);
    }

    let now = Instant::now();
    let mut available = Vec::new();
    let mut cooled = Vec::new();
    for channel in filtered {
        if is_cooled(store, &channel, now).await {
            cooled.push(channel);
        } else {
            available.push(channel);
        }
    }

    if available.is_empty() {
        if !settings.cooldown_fallback_enabled || cooled.is_empty() {
            return Vec::new();
        }
        let mut best: Option<(Channel, Instant, f64)> = None;
        for channel in cooled {
            let ready = ready_at(store, &channel).await;
            let prio = effective_priority(&channel, health, settings);
            best = Some(match best {
                None => (channel, ready, prio),
                Some((bc, br, bp)) => {
                    if ready < br
                        || (ready == br && (prio > bp || (prio == bp && channel.priority > bc.priority)))
                    {
                        (channel, ready, prio)
                    } else {
                        (bc, br, bp)
                    }
                }
            });
        }
        let (channel, _, prio) = best.expect("cooled is non-empty");
        return vec![Candidate {
            channel,
            effective_priority: prio,
        }];
    }

    let effective_key_counts = effective_key_counts(store, &available).await;
    order_by_priority_and_swrr(available, health, settings, &effective_key_counts)
}

/// `keyCount − cooledKeyCount`, floored at 1, per channel — the SWRR weight
/// for the head pick within an equal-priority group.
async fn effective_key_counts(store: &dyn Store, channels: &[Channel]) -> HashMap<ChannelId, i64> {
    let now = Instant::now();
    let mut counts = HashMap::with_capacity(channels.len());
    for channel in channels {
        let keys = store.list_keys(channel.id).await;
        if keys.is_empty() {
            counts.insert(channel.id, 1);
            continue;
        }
        let mut cooled = 0i64;
        for key in &keys {
            let is_cooled = store
                .key_cooldown(channel.id, key.key_index)
                .await
                .is_some_and(|c| c.is_active(now));
            if is_cooled {
                cooled += 1;
            }
        }
        counts.insert(channel.id, (keys.len() as i64 - cooled).max(1));
    }
    counts
}

fn order_by_priority_and_swrr(
    channels: Vec<Channel>,
    health: &HealthCache,
    settings: &Settings,
    effective_key_counts: &HashMap<ChannelId, i64>,
) -> Vec<Candidate> {
    let mut scored: Vec<(Channel, f64)> = channels
        .into_iter()
        .map(|c| {
            let p = effective_priority(&c, health, settings);
            (c, p)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut result = Vec::with_capacity(scored.len());
    let mut i = 0;
    while i < scored.len() {
        let mut j = i + 1;
        while j < scored.len() && ((scored[i].1 - scored[j].1).abs() < 0.1) {
            j += 1;
        }
        let mut group: Vec<(Channel, f64)> = scored[i..j].to_vec();
        if group.len() > 1 {
            let weights: Vec<(usize, i64)> = group
                .iter()
                .enumerate()
                .map(|(idx, (c, _))| (idx, effective_key_counts.get(&c.id).copied().unwrap_or(1)))
                .collect();
            if let Some(head_idx) = swrr::pick_one(&weights) {
                let head = group.remove(head_idx);
                result.push(Candidate {
                    channel: head.0,
                    effective_priority: head.1,
                });
            }
        }
        for (channel, prio) in group {
            result.push(Candidate {
                channel,
                effective_priority: prio,
            });
        }
        i = j;
    }
    result
}
