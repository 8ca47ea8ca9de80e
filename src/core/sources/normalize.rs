use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::core::error::UsageError;
use crate::core::models::summary::{Summary, WindowSummary};

/// Raw rate-limit window as reported by the app-server peer (camelCase wire
/// names). The oauth source converts its payload into this shape too, so both
/// sources share one normalization path.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindowRaw {
    #[serde(default)]
    pub used_percent: i64,
    #[serde(default)]
    pub window_duration_mins: Option<i64>,
    #[serde(default)]
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshotRaw {
    #[serde(default)]
    pub limit_id: String,
    #[serde(default)]
    pub plan_type: String,
    #[serde(default)]
    pub primary: Option<RateLimitWindowRaw>,
    #[serde(default)]
    pub secondary: Option<RateLimitWindowRaw>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsReadResultRaw {
    #[serde(default)]
    pub rate_limits: RateLimitSnapshotRaw,
    #[serde(default)]
    pub rate_limits_by_limit_id: HashMap<String, RateLimitSnapshotRaw>,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityInfo {
    pub email: String,
    pub account_id: String,
    pub user_id: String,
}

/// Map a raw snapshot into the canonical summary. Both windows are required;
/// a source that cannot produce them has failed.
pub fn normalize_summary(
    source: &str,
    snapshot: &RateLimitSnapshotRaw,
    additional_limit_count: usize,
    identity: Option<&IdentityInfo>,
    warnings: Vec<String>,
    now: DateTime<Utc>,
) -> Result<Summary, UsageError> {
    let primary = snapshot
        .primary
        .as_ref()
        .ok_or_else(|| UsageError::Data("missing primary window".to_string()))?;
    let secondary = snapshot
        .secondary
        .as_ref()
        .ok_or_else(|| UsageError::Data("missing secondary window".to_string()))?;

    let mut out = Summary {
        source: source.to_string(),
        plan_type: snapshot.plan_type.clone(),
        window_data_available: true,
        primary_window: to_window_summary(primary, now),
        secondary_window: to_window_summary(secondary, now),
        additional_limit_count,
        warnings,
        fetched_at: now,
        ..Default::default()
    };
    if let Some(identity) = identity {
        out.account_email = identity.email.clone();
        out.account_id = identity.account_id.clone();
        out.user_id = identity.user_id.clone();
    }
    Ok(out)
}

fn to_window_summary(win: &RateLimitWindowRaw, now: DateTime<Utc>) -> WindowSummary {
    let mut out = WindowSummary {
        used_percent: win.used_percent,
        window_duration_mins: win.window_duration_mins,
        ..Default::default()
    };
    if let Some(epoch) = win.resets_at {
        if let Some(resets_at) = Utc.timestamp_opt(epoch, 0).single() {
            out.resets_at = Some(resets_at);
            out.seconds_until_reset = Some((resets_at - now).num_seconds().max(0));
        }
    }
    out
}
