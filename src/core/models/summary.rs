use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized subscription usage snapshot emitted to the CLI and JSON output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub plan_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default)]
    pub window_data_available: bool,
    #[serde(default)]
    pub primary_window: WindowSummary,
    #[serde(default)]
    pub secondary_window: WindowSummary,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub window_account_label: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub additional_limit_count: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_accounts: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub successful_accounts: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_tokens_5h: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_tokens_weekly: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_window_5h: Option<ObservedTokenBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_window_weekly: Option<ObservedTokenBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_tokens_status: Option<ObservedTokensStatus>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub observed_tokens_warming: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_tokens_note: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default = "epoch")]
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowSummary {
    #[serde(default)]
    pub used_percent: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_duration_mins: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_until_reset: Option<i64>,
}

/// One row per distinct account identity in the aggregate summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default)]
    pub primary_window: WindowSummary,
    #[serde(default)]
    pub secondary_window: WindowSummary,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub additional_limit_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_tokens_5h: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_tokens_weekly: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_window_5h: Option<ObservedTokenBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_window_weekly: Option<ObservedTokenBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_tokens_status: Option<ObservedTokensStatus>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub observed_tokens_warming: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_tokens_note: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedTokensStatus {
    Estimated,
    Partial,
    Unavailable,
}

impl ObservedTokensStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Estimated => "estimated",
            Self::Partial => "partial",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Per-category token counts replayed from session journals. `has_split`
/// means category counters (not just the total) were present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTokenBreakdown {
    #[serde(default)]
    pub total: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub input: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub cached_input: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub output: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub reasoning_output: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub cached_output: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_split: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_cached_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub details: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
