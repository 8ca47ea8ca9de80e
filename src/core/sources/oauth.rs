use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::auth::{find_auth_json_path, read_access_token};
use crate::core::error::UsageError;
use crate::core::models::summary::Summary;
use crate::core::sources::normalize::{
    normalize_summary, IdentityInfo, RateLimitSnapshotRaw, RateLimitWindowRaw,
};

const USAGE_ENDPOINT: &str = "https://chatgpt.com/backend-api/wham/usage";
const USER_AGENT: &str = concat!("codex-usage-monitor/", env!("CARGO_PKG_VERSION"));
const MAX_BODY_BYTES: usize = 1_000_000;

/// Fallback source: a single bearer-authenticated GET against the usage
/// endpoint, used when the app-server session is unavailable.
pub struct OAuthSource {
    client: reqwest::Client,
    codex_home: String,
}

impl OAuthSource {
    pub fn for_home(codex_home: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(8))
            .build()
            .unwrap_or_default();
        Self {
            client,
            codex_home: codex_home.trim().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        "oauth"
    }

    pub async fn fetch(&self) -> Result<Summary, UsageError> {
        let auth_path = find_auth_json_path(&self.codex_home)?;
        let token = read_access_token(&auth_path)?;

        let response = self
            .client
            .get(USAGE_ENDPOINT)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| UsageError::Transport(format!("oauth request failed: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| UsageError::Transport(format!("read oauth response: {e}")))?;
        let body = &body[..body.len().min(MAX_BODY_BYTES)];

        if status != reqwest::StatusCode::OK {
            return Err(UsageError::Transport(format!(
                "oauth endpoint returned HTTP {}: {}",
                status.as_u16(),
                summarize_body(body)
            )));
        }

        parse_usage_payload(body, Utc::now())
    }

    pub async fn close(&self) -> Result<(), UsageError> {
        Ok(())
    }
}

/// Decode the usage endpoint body into the shared snapshot shape.
fn parse_usage_payload(body: &[u8], now: DateTime<Utc>) -> Result<Summary, UsageError> {
    let payload: OAuthUsagePayload = serde_json::from_slice(body)
        .map_err(|e| UsageError::Transport(format!("decode oauth response: {e}")))?;

    let rate_limit = payload
        .rate_limit
        .as_ref()
        .ok_or_else(|| UsageError::Data("oauth response missing rate_limit".to_string()))?;
    let primary = rate_limit
        .primary_window
        .as_ref()
        .ok_or_else(|| UsageError::Data("oauth response missing primary_window".to_string()))?;
    let secondary = rate_limit.secondary_window.as_ref().ok_or_else(|| {
        UsageError::Data("oauth response missing secondary_window".to_string())
    })?;

    let snapshot = RateLimitSnapshotRaw {
        limit_id: "codex".to_string(),
        plan_type: payload.plan_type.clone().unwrap_or_default(),
        primary: Some(to_raw_window(primary)),
        secondary: Some(to_raw_window(secondary)),
    };
    let identity = IdentityInfo {
        email: payload.email.unwrap_or_default().trim().to_string(),
        account_id: payload.account_id.unwrap_or_default().trim().to_string(),
        user_id: payload.user_id.unwrap_or_default().trim().to_string(),
    };

    normalize_summary(
        "oauth",
        &snapshot,
        payload.additional_rate_limits.len(),
        Some(&identity),
        Vec::new(),
        now,
    )
}

fn to_raw_window(win: &OAuthWindowSnapshot) -> RateLimitWindowRaw {
    RateLimitWindowRaw {
        used_percent: win.used_percent,
        window_duration_mins: to_mins(win.limit_window_seconds),
        resets_at: positive_epoch(win.reset_at),
    }
}

fn to_mins(seconds: i64) -> Option<i64> {
    (seconds > 0).then_some(seconds / 60)
}

fn positive_epoch(v: i64) -> Option<i64> {
    (v > 0).then_some(v)
}

fn summarize_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.len() > 180 {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < 180)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &trimmed[..cut])
    } else {
        trimmed.to_string()
    }
}

#[derive(Deserialize)]
struct OAuthUsagePayload {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    plan_type: Option<String>,
    #[serde(default)]
    rate_limit: Option<OAuthRateLimitDetails>,
    #[serde(default)]
    additional_rate_limits: Vec<OAuthAdditionalRateLimit>,
}

#[derive(Deserialize)]
struct OAuthAdditionalRateLimit {
    #[serde(default)]
    #[allow(dead_code)]
    limit_name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    rate_limit: Option<OAuthRateLimitDetails>,
}

#[derive(Deserialize)]
struct OAuthRateLimitDetails {
    #[serde(default)]
    primary_window: Option<OAuthWindowSnapshot>,
    #[serde(default)]
    secondary_window: Option<OAuthWindowSnapshot>,
}

#[derive(Deserialize)]
struct OAuthWindowSnapshot {
    #[serde(default)]
    used_percent: i64,
    #[serde(default)]
    limit_window_seconds: i64,
    #[serde(default)]
    #[allow(dead_code)]
    reset_after_seconds: i64,
    #[serde(default)]
    reset_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_body(reset_at: i64) -> String {
        format!(
            r#"{{
                "email": "a@example.com",
                "account_id": "acc-1",
                "user_id": "user-1",
                "plan_type": "pro",
                "rate_limit": {{
                    "primary_window": {{
                        "used_percent": 60,
                        "limit_window_seconds": 18000,
                        "reset_after_seconds": 1200,
                        "reset_at": {reset_at}
                    }},
                    "secondary_window": {{
                        "used_percent": 70,
                        "limit_window_seconds": 604800,
                        "reset_after_seconds": 86400,
                        "reset_at": 0
                    }}
                }},
                "additional_rate_limits": [
                    {{"limit_name": "codex-mini", "rate_limit": null}}
                ]
            }}"#
        )
    }

    #[test]
    fn parse_usage_payload_full_response() {
        let now = Utc.with_ymd_and_hms(2026, 2, 26, 12, 0, 0).unwrap();
        let body = sample_body(now.timestamp() + 1200);

        let out = parse_usage_payload(body.as_bytes(), now).unwrap();
        assert_eq!(out.source, "oauth");
        assert_eq!(out.plan_type, "pro");
        assert_eq!(out.account_email, "a@example.com");
        assert_eq!(out.account_id, "acc-1");
        assert_eq!(out.user_id, "user-1");
        assert_eq!(out.primary_window.used_percent, 60);
        assert_eq!(out.primary_window.window_duration_mins, Some(300));
        assert_eq!(out.primary_window.seconds_until_reset, Some(1200));
        assert_eq!(out.secondary_window.used_percent, 70);
        assert_eq!(out.additional_limit_count, 1);
        // reset_at of zero means no reset information at all.
        assert!(out.secondary_window.resets_at.is_none());
        assert!(out.secondary_window.seconds_until_reset.is_none());
    }

    #[test]
    fn parse_usage_payload_negative_reset_treated_as_absent() {
        let now = Utc::now();
        let body = sample_body(-5);
        let out = parse_usage_payload(body.as_bytes(), now).unwrap();
        assert!(out.primary_window.resets_at.is_none());
    }

    #[test]
    fn parse_usage_payload_missing_rate_limit_errors() {
        let err = parse_usage_payload(br#"{"plan_type":"pro"}"#, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("rate_limit"));
    }

    #[test]
    fn parse_usage_payload_missing_window_errors() {
        let body = r#"{"rate_limit":{"primary_window":{"used_percent":1}}}"#;
        let err = parse_usage_payload(body.as_bytes(), Utc::now()).unwrap_err();
        assert!(err.to_string().contains("secondary_window"));
    }

    #[test]
    fn summarize_body_truncates_long_bodies() {
        let long = "x".repeat(500);
        let summary = summarize_body(long.as_bytes());
        assert!(summary.ends_with("..."));
        assert!(summary.len() <= 184);

        assert_eq!(summarize_body(b"  short  "), "short");
    }
}
