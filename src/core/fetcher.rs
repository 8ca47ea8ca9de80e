use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::core::accounts::{load_monitor_accounts, MonitorAccount};
use crate::core::error::UsageError;
use crate::core::models::summary::{
    AccountSummary, ObservedTokenBreakdown, ObservedTokensStatus, Summary,
};
use crate::core::observed::{dedupe_warnings, ObservedTokenEstimator, TokenEstimator};
use crate::core::paths::{default_codex_home, normalize_home};
use crate::core::sources::{fetch_with_fallback, AccountSource};

const UNVERIFIED_IDENTITY_KEY: &str = "unverified";
const MAX_ACCOUNT_PARALLELISM: usize = 4;

type AccountLoader =
    Box<dyn Fn() -> Result<(Vec<MonitorAccount>, String), UsageError> + Send + Sync>;

/// Multi-account usage fetcher: discovers accounts, fans out per-account
/// fetches, and merges the results into one summary.
pub struct Fetcher {
    accounts: Vec<AccountWorker>,
    observed: Arc<dyn TokenEstimator>,
    initialization_note: String,
    account_loader: Option<AccountLoader>,
    account_refresh_interval: Duration,
    accounts_last_refreshed_at: Option<DateTime<Utc>>,
    active_home_override: Option<String>,
}

#[derive(Clone)]
struct AccountWorker {
    account: MonitorAccount,
    primary: Arc<AccountSource>,
    fallback: Arc<AccountSource>,
}

struct AccountFetchResult {
    codex_home: String,
    account: AccountSummary,
    snapshot: Option<Summary>,
    fetch_err: Option<UsageError>,
    observed_available: bool,
    observed_unavailable: bool,
    warnings: Vec<String>,
}

#[derive(Clone, Copy, Default)]
struct ObservedWindowPair {
    window_5h: ObservedTokenBreakdown,
    window_weekly: ObservedTokenBreakdown,
}

struct AccountSummaryWithHome {
    account: AccountSummary,
    codex_home: String,
}

impl Fetcher {
    /// Fetcher for the live display: estimates warm up in the background.
    pub async fn new_default() -> Self {
        Self::new_configured(true).await
    }

    /// Fetcher for one-shot output: estimates compute inline.
    pub async fn new_snapshot() -> Self {
        Self::new_configured(false).await
    }

    async fn new_configured(async_observed: bool) -> Self {
        let mut fetcher = Self {
            accounts: Vec::new(),
            observed: Arc::new(ObservedTokenEstimator::new(
                StdDuration::from_secs(60),
                async_observed,
            )),
            initialization_note: String::new(),
            account_loader: Some(Box::new(load_monitor_accounts)),
            account_refresh_interval: Duration::seconds(60),
            accounts_last_refreshed_at: None,
            active_home_override: None,
        };
        fetcher.refresh_accounts(Utc::now(), true).await;
        fetcher
    }

    #[cfg(test)]
    fn for_tests(accounts: Vec<AccountWorker>, observed: Arc<dyn TokenEstimator>) -> Self {
        Self {
            accounts,
            observed,
            initialization_note: String::new(),
            account_loader: None,
            account_refresh_interval: Duration::seconds(60),
            accounts_last_refreshed_at: None,
            active_home_override: Some(String::new()),
        }
    }

    pub async fn fetch(&mut self, deadline: Instant) -> Result<Summary, UsageError> {
        let now = Utc::now();
        self.refresh_accounts(now, false).await;
        if self.accounts.is_empty() {
            return Err(UsageError::Config("no accounts available".to_string()));
        }

        let mut out = Summary {
            observed_tokens_status: Some(ObservedTokensStatus::Unavailable),
            fetched_at: now,
            ..Default::default()
        };
        if !self.initialization_note.is_empty() {
            out.warnings.push(self.initialization_note.clone());
        }

        let mut any_account_success = false;
        let mut any_observed_available = false;
        let mut any_observed_warming = false;
        let mut unavailable_observed_count = 0usize;
        let mut total_identities: HashSet<String> = HashSet::new();
        let mut successful_identities: HashSet<String> = HashSet::new();
        let mut seen_observed_by_identity: HashMap<String, ObservedWindowPair> = HashMap::new();
        let mut account_by_identity: HashMap<String, AccountSummaryWithHome> = HashMap::new();
        let active_home = self.resolve_active_home();
        let mut active_success: Option<Summary> = None;
        let mut active_label = String::new();
        let mut active_home_discovered = false;
        let mut active_fetch_failed = false;

        let results = self.fetch_accounts_concurrent(now, deadline).await;
        for result in results {
            let account_out = result.account;
            let identity = account_identity_or_home_key(&account_out);
            total_identities.insert(identity.clone());
            let is_active =
                !active_home.is_empty() && normalize_home(&result.codex_home) == active_home;
            if is_active {
                active_home_discovered = true;
            }
            if let Some(err) = &result.fetch_err {
                out.warnings.push(format!(
                    "account {:?} fetch failed: {err}",
                    account_out.label
                ));
                if is_active {
                    active_fetch_failed = true;
                }
            } else if let Some(snapshot) = &result.snapshot {
                any_account_success = true;
                successful_identities.insert(identity.clone());
                if is_active {
                    active_success = Some(snapshot.clone());
                    active_label = account_out.label.clone();
                }
            }
            if result.observed_available {
                any_observed_available = true;
                let pair = ObservedWindowPair {
                    window_5h: account_out.observed_window_5h.unwrap_or_default(),
                    window_weekly: account_out.observed_window_weekly.unwrap_or_default(),
                };
                let merged = seen_observed_by_identity
                    .get(&identity)
                    .copied()
                    .unwrap_or_default();
                seen_observed_by_identity
                    .insert(identity.clone(), merge_observed_pair_max(merged, pair));
            }
            if result.observed_unavailable {
                unavailable_observed_count += 1;
            }
            if account_out.observed_tokens_warming {
                any_observed_warming = true;
            }
            out.warnings.extend(result.warnings);

            let prefer = match account_by_identity.get(&identity) {
                None => true,
                Some(existing) => should_prefer_account_summary(
                    existing,
                    &account_out,
                    &result.codex_home,
                    &active_home,
                ),
            };
            if prefer {
                account_by_identity.insert(
                    identity,
                    AccountSummaryWithHome {
                        account: account_out,
                        codex_home: result.codex_home,
                    },
                );
            }
        }
        out.accounts = account_summaries_from_identity_map(account_by_identity);
        out.total_accounts = total_identities.len();
        out.successful_accounts = successful_identities.len();

        if let Some(active) = active_success {
            out.source = active.source;
            out.plan_type = active.plan_type;
            out.account_email = active.account_email;
            out.account_id = active.account_id;
            out.user_id = active.user_id;
            out.window_data_available = true;
            out.primary_window = active.primary_window;
            out.secondary_window = active.secondary_window;
            out.window_account_label = active_label;
            out.additional_limit_count = active.additional_limit_count;
            out.fetched_at = active.fetched_at;
        } else {
            out.window_data_available = false;
            let warning = if active_home.is_empty() {
                "active account home is unavailable; window cards are unavailable"
            } else if !active_home_discovered {
                "active account home is not in discovered accounts; window cards are unavailable"
            } else if active_fetch_failed {
                "active account usage fetch failed; window cards are unavailable"
            } else {
                "active account usage is unavailable; window cards are unavailable"
            };
            out.warnings.push(warning.to_string());
        }

        if any_observed_available {
            let mut observed_total = ObservedWindowPair::default();
            for pair in seen_observed_by_identity.values() {
                observed_total = add_observed_pairs(&observed_total, pair);
            }
            out.observed_tokens_status = Some(ObservedTokensStatus::Estimated);
            out.observed_window_5h = Some(observed_total.window_5h);
            out.observed_window_weekly = Some(observed_total.window_weekly);
            out.observed_tokens_5h = Some(observed_total.window_5h.total);
            out.observed_tokens_weekly = Some(observed_total.window_weekly.total);
            out.observed_tokens_note = "sum across accounts".to_string();
            out.observed_tokens_warming = false;
            if unavailable_observed_count > 0 {
                out.observed_tokens_status = Some(ObservedTokensStatus::Partial);
                out.observed_tokens_note =
                    "partial sum across accounts; some account homes unavailable".to_string();
            }
        } else if unavailable_observed_count > 0 {
            out.observed_tokens_status = Some(ObservedTokensStatus::Unavailable);
            out.observed_tokens_note = "token estimate warming or unavailable".to_string();
            out.observed_tokens_warming = any_observed_warming;
        }

        out.warnings = dedupe_warnings(out.warnings);

        if !any_account_success && !any_observed_available {
            return Err(UsageError::AllSourcesFailed);
        }
        Ok(out)
    }

    pub async fn close(&mut self) -> Result<(), UsageError> {
        let mut first_err = None;
        for worker in self.accounts.drain(..) {
            if let Err(err) = worker.primary.close().await {
                first_err.get_or_insert(err);
            }
            if let Err(err) = worker.fallback.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolve_active_home(&self) -> String {
        if let Some(active) = &self.active_home_override {
            return active.clone();
        }
        match default_codex_home() {
            Ok(home) => normalize_home(&home),
            Err(_) => String::new(),
        }
    }

    /// Reload the account list when forced or the refresh interval elapsed,
    /// reusing workers whose canonical home is unchanged.
    async fn refresh_accounts(&mut self, now: DateTime<Utc>, force: bool) {
        let Some(loader) = &self.account_loader else {
            return;
        };
        if !force {
            if let Some(last) = self.accounts_last_refreshed_at {
                if now - last < self.account_refresh_interval {
                    return;
                }
            }
        }

        let loaded = loader();
        self.accounts_last_refreshed_at = Some(now);
        match loaded {
            Err(err) => {
                self.initialization_note = err.to_string();
            }
            Ok((mut accounts, warning)) => {
                if accounts.is_empty() {
                    if let Ok(home) = default_codex_home() {
                        accounts.push(MonitorAccount {
                            label: "default".to_string(),
                            codex_home: home,
                        });
                    }
                }
                self.initialization_note = warning;
                self.replace_account_workers(accounts).await;
            }
        }
    }

    async fn replace_account_workers(&mut self, accounts: Vec<MonitorAccount>) {
        let mut existing_by_home: HashMap<String, AccountWorker> = HashMap::new();
        for worker in self.accounts.drain(..) {
            let home = normalize_home(&worker.account.codex_home);
            if home.is_empty() {
                continue;
            }
            existing_by_home.insert(home, worker);
        }

        let mut next = Vec::with_capacity(accounts.len());
        for mut account in accounts {
            let home = normalize_home(&account.codex_home);
            if home.is_empty() {
                continue;
            }
            account.codex_home = home.clone();
            if let Some(mut existing) = existing_by_home.remove(&home) {
                existing.account = account;
                next.push(existing);
                continue;
            }
            debug!(home = %home, "creating account worker");
            next.push(AccountWorker {
                primary: Arc::new(AccountSource::app_server_for_home(&home)),
                fallback: Arc::new(AccountSource::oauth_for_home(&home)),
                account,
            });
        }

        for (home, removed) in existing_by_home {
            debug!(home = %home, "closing removed account worker");
            let _ = removed.primary.close().await;
            let _ = removed.fallback.close().await;
        }
        self.accounts = next;
    }

    /// Fan out one task per account, at most four running at a time. Results
    /// come back in input order so merging is deterministic.
    async fn fetch_accounts_concurrent(
        &self,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Vec<AccountFetchResult> {
        if self.accounts.is_empty() {
            return Vec::new();
        }
        let parallelism = self.accounts.len().min(MAX_ACCOUNT_PARALLELISM);
        let semaphore = Arc::new(Semaphore::new(parallelism));

        let mut handles = Vec::with_capacity(self.accounts.len());
        let mut metas = Vec::with_capacity(self.accounts.len());
        for worker in &self.accounts {
            metas.push(worker.account.clone());
            let worker = worker.clone();
            let observed = self.observed.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                fetch_account_result(worker, observed, now, deadline).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, meta) in handles.into_iter().zip(metas) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    let message = format!("account task failed: {join_err}");
                    results.push(AccountFetchResult {
                        codex_home: meta.codex_home,
                        account: AccountSummary {
                            label: meta.label,
                            error: message.clone(),
                            ..Default::default()
                        },
                        snapshot: None,
                        fetch_err: Some(UsageError::SourcesFailed(message)),
                        observed_available: false,
                        observed_unavailable: false,
                        warnings: Vec::new(),
                    });
                }
            }
        }
        results
    }
}

/// One account's fetch: primary then fallback, plus the local token estimate.
async fn fetch_account_result(
    worker: AccountWorker,
    observed: Arc<dyn TokenEstimator>,
    now: DateTime<Utc>,
    deadline: Instant,
) -> AccountFetchResult {
    let mut result = AccountFetchResult {
        codex_home: worker.account.codex_home.clone(),
        account: AccountSummary {
            label: worker.account.label.clone(),
            ..Default::default()
        },
        snapshot: None,
        fetch_err: None,
        observed_available: false,
        observed_unavailable: false,
        warnings: Vec::new(),
    };

    match fetch_with_fallback(&worker.primary, &worker.fallback, deadline).await {
        Err(err) => {
            result.account.error = err.to_string();
            result.fetch_err = Some(err);
        }
        Ok(snapshot) => {
            result.account.source = snapshot.source.clone();
            result.account.plan_type = snapshot.plan_type.clone();
            result.account.account_email = snapshot.account_email.clone();
            result.account.account_id = snapshot.account_id.clone();
            result.account.user_id = snapshot.user_id.clone();
            result.account.primary_window = snapshot.primary_window.clone();
            result.account.secondary_window = snapshot.secondary_window.clone();
            result.account.additional_limit_count = snapshot.additional_limit_count;
            result.account.warnings.extend(snapshot.warnings.clone());
            result.account.fetched_at = Some(snapshot.fetched_at);
            result.snapshot = Some(snapshot);
        }
    }

    // Journal replay is blocking file I/O; keep it off the async workers.
    let estimate = {
        let observed = observed.clone();
        let home = worker.account.codex_home.clone();
        tokio::task::spawn_blocking(move || observed.estimate(&home, now)).await
    };
    let estimate = match estimate {
        Ok(estimate) => estimate,
        Err(join_err) => Err(crate::core::observed::EstimateError {
            note: "token estimate failed".to_string(),
            message: join_err.to_string(),
        }),
    };

    match estimate {
        Err(err) => {
            result.account.observed_tokens_status = Some(ObservedTokensStatus::Unavailable);
            result.account.observed_tokens_note = err.note.clone();
            result.observed_unavailable = true;
            result.warnings.push(format!(
                "account {:?} observed tokens unavailable: {}",
                worker.account.label, err.message
            ));
        }
        Ok(estimate) => {
            result.account.observed_tokens_status = estimate.status;
            result.account.observed_tokens_note = estimate.note.clone();
            result.account.observed_tokens_warming = estimate.warming;
            result.account.warnings.extend(estimate.warnings.clone());
            result.account.observed_window_5h = Some(estimate.window_5h);
            result.account.observed_window_weekly = Some(estimate.window_weekly);
            result.account.observed_tokens_5h = Some(estimate.window_5h.total);
            result.account.observed_tokens_weekly = Some(estimate.window_weekly.total);

            if estimate.status == Some(ObservedTokensStatus::Unavailable) {
                result.observed_unavailable = true;
            } else {
                result.observed_available = true;
            }
        }
    }

    result.account.warnings = dedupe_warnings(result.account.warnings.clone());
    result
}

/// Tagged identity key: first non-empty of email, account id, user id,
/// lowercased. Empty means the account could not be verified.
fn identity_key(email: &str, account_id: &str, user_id: &str) -> String {
    let email = email.trim();
    if !email.is_empty() {
        return format!("email:{}", email.to_lowercase());
    }
    let account_id = account_id.trim();
    if !account_id.is_empty() {
        return format!("account_id:{}", account_id.to_lowercase());
    }
    let user_id = user_id.trim();
    if !user_id.is_empty() {
        return format!("user_id:{}", user_id.to_lowercase());
    }
    String::new()
}

fn account_identity_or_home_key(account: &AccountSummary) -> String {
    let identity = identity_key(&account.account_email, &account.account_id, &account.user_id);
    if identity.is_empty() {
        return UNVERIFIED_IDENTITY_KEY.to_string();
    }
    identity
}

/// Between two rows with the same identity: a successful fetch beats a
/// failed one, then the active home wins, then the fresher snapshot. Ties
/// keep the incumbent.
fn should_prefer_account_summary(
    existing: &AccountSummaryWithHome,
    candidate: &AccountSummary,
    candidate_home: &str,
    active_home: &str,
) -> bool {
    let existing_ok = existing.account.error.trim().is_empty();
    let candidate_ok = candidate.error.trim().is_empty();
    if existing_ok != candidate_ok {
        return candidate_ok;
    }

    let existing_active =
        !active_home.is_empty() && normalize_home(&existing.codex_home) == active_home;
    let candidate_active =
        !active_home.is_empty() && normalize_home(candidate_home) == active_home;
    if existing_active != candidate_active {
        return candidate_active;
    }

    match (existing.account.fetched_at, candidate.fetched_at) {
        (None, candidate_at) => candidate_at.is_some(),
        (Some(_), None) => false,
        (Some(existing_at), Some(candidate_at)) => candidate_at > existing_at,
    }
}

fn account_summaries_from_identity_map(
    by_identity: HashMap<String, AccountSummaryWithHome>,
) -> Vec<AccountSummary> {
    let mut accounts: Vec<AccountSummary> = by_identity
        .into_values()
        .map(|row| row.account)
        .collect();
    accounts.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then_with(|| a.account_email.cmp(&b.account_email))
            .then_with(|| a.source.cmp(&b.source))
    });
    accounts
}

fn add_observed_pairs(a: &ObservedWindowPair, b: &ObservedWindowPair) -> ObservedWindowPair {
    ObservedWindowPair {
        window_5h: add_breakdowns(&a.window_5h, &b.window_5h),
        window_weekly: add_breakdowns(&a.window_weekly, &b.window_weekly),
    }
}

fn add_breakdowns(a: &ObservedTokenBreakdown, b: &ObservedTokenBreakdown) -> ObservedTokenBreakdown {
    ObservedTokenBreakdown {
        total: a.total + b.total,
        input: a.input + b.input,
        cached_input: a.cached_input + b.cached_input,
        output: a.output + b.output,
        reasoning_output: a.reasoning_output + b.reasoning_output,
        cached_output: a.cached_output + b.cached_output,
        has_split: a.has_split || b.has_split,
        has_cached_output: a.has_cached_output || b.has_cached_output,
    }
}

fn merge_observed_pair_max(prev: ObservedWindowPair, next: ObservedWindowPair) -> ObservedWindowPair {
    ObservedWindowPair {
        window_5h: merge_breakdown_max(prev.window_5h, next.window_5h),
        window_weekly: merge_breakdown_max(prev.window_weekly, next.window_weekly),
    }
}

/// The breakdown with the larger total wins whole; categories from different
/// replays of the same identity must not be mixed.
fn merge_breakdown_max(
    a: ObservedTokenBreakdown,
    b: ObservedTokenBreakdown,
) -> ObservedTokenBreakdown {
    if b.total > a.total {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observed::{EstimateError, ObservedTokenEstimate};
    use crate::core::sources::fake::FakeSource;
    use std::time::Duration as TimeoutDuration;

    struct FakeEstimator {
        values: HashMap<String, ObservedTokenEstimate>,
        errs: HashMap<String, String>,
    }

    impl FakeEstimator {
        fn new() -> Self {
            Self {
                values: HashMap::new(),
                errs: HashMap::new(),
            }
        }

        fn with_totals(mut self, home: &str, total_5h: i64, total_weekly: i64) -> Self {
            self.values.insert(
                home.to_string(),
                ObservedTokenEstimate {
                    window_5h: ObservedTokenBreakdown {
                        total: total_5h,
                        ..Default::default()
                    },
                    window_weekly: ObservedTokenBreakdown {
                        total: total_weekly,
                        ..Default::default()
                    },
                    status: Some(ObservedTokensStatus::Estimated),
                    ..Default::default()
                },
            );
            self
        }

        fn with_estimate(mut self, home: &str, estimate: ObservedTokenEstimate) -> Self {
            self.values.insert(home.to_string(), estimate);
            self
        }

        fn with_error(mut self, home: &str, message: &str) -> Self {
            self.errs.insert(home.to_string(), message.to_string());
            self
        }
    }

    impl TokenEstimator for FakeEstimator {
        fn estimate(
            &self,
            codex_home: &str,
            _now: DateTime<Utc>,
        ) -> Result<ObservedTokenEstimate, EstimateError> {
            if let Some(message) = self.errs.get(codex_home) {
                return Err(EstimateError {
                    note: message.clone(),
                    message: message.clone(),
                });
            }
            match self.values.get(codex_home) {
                Some(estimate) => Ok(estimate.clone()),
                None => Err(EstimateError {
                    note: "missing estimate".to_string(),
                    message: "missing estimate".to_string(),
                }),
            }
        }
    }

    fn deadline() -> Instant {
        Instant::now() + TimeoutDuration::from_secs(5)
    }

    fn worker(label: &str, home: &str, primary: FakeSource, fallback: FakeSource) -> AccountWorker {
        AccountWorker {
            account: MonitorAccount {
                label: label.to_string(),
                codex_home: home.to_string(),
            },
            primary: Arc::new(AccountSource::Fake(primary)),
            fallback: Arc::new(AccountSource::Fake(fallback)),
        }
    }

    fn summary_with(email: &str, primary_pct: i64, secondary_pct: i64) -> Summary {
        Summary {
            source: "app-server".to_string(),
            plan_type: "pro".to_string(),
            account_email: email.to_string(),
            primary_window: crate::core::models::summary::WindowSummary {
                used_percent: primary_pct,
                ..Default::default()
            },
            secondary_window: crate::core::models::summary::WindowSummary {
                used_percent: secondary_pct,
                ..Default::default()
            },
            fetched_at: Utc::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_account_primary_success() {
        let mut fetcher = Fetcher::for_tests(
            vec![worker(
                "a",
                "/a",
                FakeSource::ok("app-server", summary_with("a@example.com", 20, 50)),
                FakeSource::empty("oauth"),
            )],
            Arc::new(FakeEstimator::new().with_totals("/a", 100, 200)),
        );
        fetcher.active_home_override = Some("/a".to_string());

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.source, "app-server");
        assert_eq!(out.plan_type, "pro");
        assert_eq!(out.account_email, "a@example.com");
        assert_eq!(out.primary_window.used_percent, 20);
        assert_eq!(out.secondary_window.used_percent, 50);
        assert_eq!(out.observed_tokens_5h, Some(100));
        assert_eq!(out.observed_tokens_weekly, Some(200));
        assert_eq!(out.total_accounts, 1);
        assert_eq!(out.successful_accounts, 1);
        assert!(out.warnings.is_empty(), "warnings: {:?}", out.warnings);
    }

    #[tokio::test]
    async fn aggregates_multi_account_observed_tokens() {
        let fallback_b = Summary {
            source: "oauth".to_string(),
            account_email: "b@example.com".to_string(),
            primary_window: crate::core::models::summary::WindowSummary {
                used_percent: 60,
                ..Default::default()
            },
            secondary_window: crate::core::models::summary::WindowSummary {
                used_percent: 70,
                ..Default::default()
            },
            plan_type: "pro".to_string(),
            fetched_at: Utc::now(),
            ..Default::default()
        };
        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_with("a@example.com", 20, 50)),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::failing("primary-b", "boom"),
                    FakeSource::ok("fallback-b", fallback_b),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 100, 200)
                    .with_totals("/b", 30, 80),
            ),
        );
        fetcher.active_home_override = Some("/b".to_string());

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.total_accounts, 2);
        assert_eq!(out.successful_accounts, 2);
        assert_eq!(out.observed_tokens_5h, Some(130));
        assert_eq!(out.observed_tokens_weekly, Some(280));
        assert_eq!(out.observed_tokens_status, Some(ObservedTokensStatus::Estimated));
        assert_eq!(out.accounts.len(), 2);
        assert_eq!(out.accounts[1].source, "oauth");
        assert_eq!(out.accounts[0].observed_tokens_5h, Some(100));
        assert_eq!(out.accounts[1].observed_tokens_5h, Some(30));
        // The active account drives the window card and fell back to oauth.
        assert!(out.window_data_available);
        assert_eq!(out.secondary_window.used_percent, 70);
        assert_eq!(out.window_account_label, "b");
        assert_eq!(out.source, "oauth");
        // The fallback warning is carried on the account row and names the
        // primary source.
        assert!(out.accounts[1]
            .warnings
            .iter()
            .any(|w| w.contains("primary-b") && w.contains("boom")));
    }

    #[tokio::test]
    async fn allows_observed_only_when_all_sources_fail() {
        let mut fetcher = Fetcher::for_tests(
            vec![worker(
                "a",
                "/a",
                FakeSource::failing("primary-a", "p"),
                FakeSource::failing("fallback-a", "f"),
            )],
            Arc::new(FakeEstimator::new().with_totals("/a", 12, 99)),
        );

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.successful_accounts, 0);
        assert_eq!(out.observed_tokens_status, Some(ObservedTokensStatus::Estimated));
        assert_eq!(out.observed_tokens_5h, Some(12));
        assert_eq!(out.observed_tokens_weekly, Some(99));
        assert!(!out.window_data_available);
    }

    #[tokio::test]
    async fn fails_when_nothing_succeeds_anywhere() {
        let mut fetcher = Fetcher::for_tests(
            vec![worker(
                "a",
                "/a",
                FakeSource::failing("primary-a", "p"),
                FakeSource::failing("fallback-a", "f"),
            )],
            Arc::new(FakeEstimator::new().with_error("/a", "missing logs")),
        );

        let err = fetcher.fetch(deadline()).await.unwrap_err();
        assert!(matches!(err, UsageError::AllSourcesFailed));
    }

    #[tokio::test]
    async fn marks_observed_partial_when_some_accounts_unavailable() {
        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_with("", 0, 0)),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::ok("primary-b", summary_with("b@example.com", 0, 0)),
                    FakeSource::empty("fallback-b"),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 10, 20)
                    .with_error("/b", "missing logs"),
            ),
        );

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.observed_tokens_status, Some(ObservedTokensStatus::Partial));
        assert_eq!(out.observed_tokens_5h, Some(10));
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("\"b\"") && w.contains("missing logs")));
    }

    #[tokio::test]
    async fn marks_warming_when_unavailable_estimate_is_warming() {
        let mut fetcher = Fetcher::for_tests(
            vec![worker(
                "a",
                "/a",
                FakeSource::ok("primary-a", summary_with("", 10, 20)),
                FakeSource::empty("fallback-a"),
            )],
            Arc::new(FakeEstimator::new().with_estimate(
                "/a",
                ObservedTokenEstimate {
                    status: Some(ObservedTokensStatus::Unavailable),
                    warming: true,
                    note: "warming token estimate".to_string(),
                    ..Default::default()
                },
            )),
        );

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.observed_tokens_status, Some(ObservedTokensStatus::Unavailable));
        assert!(out.observed_tokens_warming);
        assert_eq!(out.accounts.len(), 1);
        assert!(out.accounts[0].observed_tokens_warming);
    }

    #[tokio::test]
    async fn deduplicates_observed_totals_by_email_identity() {
        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_with("same@example.com", 10, 20)),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::ok("primary-b", summary_with("same@example.com", 30, 40)),
                    FakeSource::empty("fallback-b"),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 100, 200)
                    .with_totals("/b", 150, 180),
            ),
        );

        let out = fetcher.fetch(deadline()).await.unwrap();
        // Max-merge per window: max(100,150) and max(200,180).
        assert_eq!(out.observed_tokens_5h, Some(150));
        assert_eq!(out.observed_tokens_weekly, Some(200));
        assert_eq!(out.total_accounts, 1);
        assert_eq!(out.successful_accounts, 1);
        assert_eq!(out.accounts.len(), 1);
    }

    #[tokio::test]
    async fn deduplicates_by_account_id_when_email_missing() {
        let mut summary_a = summary_with("", 10, 20);
        summary_a.account_id = "same-account-id".to_string();
        let mut summary_b = summary_with("", 20, 30);
        summary_b.account_id = "same-account-id".to_string();

        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_a),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::ok("primary-b", summary_b),
                    FakeSource::empty("fallback-b"),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 100, 200)
                    .with_totals("/b", 150, 180),
            ),
        );

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.observed_tokens_5h, Some(150));
        assert_eq!(out.total_accounts, 1);
        assert_eq!(out.successful_accounts, 1);
        assert_eq!(out.accounts.len(), 1);
    }

    #[tokio::test]
    async fn merges_unverified_accounts_into_single_identity() {
        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_with("", 10, 20)),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::ok("primary-b", summary_with("", 30, 40)),
                    FakeSource::empty("fallback-b"),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 100, 200)
                    .with_totals("/b", 150, 180),
            ),
        );

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(out.total_accounts, 1);
        assert_eq!(out.successful_accounts, 1);
        assert_eq!(out.accounts.len(), 1);
        assert_eq!(out.observed_tokens_5h, Some(150));
        assert_eq!(out.observed_tokens_weekly, Some(200));
    }

    #[tokio::test]
    async fn active_home_drives_identity_and_window_cards() {
        let workers = vec![
            worker(
                "a",
                "/a",
                FakeSource::ok("primary-a", summary_with("a@example.com", 11, 12)),
                FakeSource::empty("fallback-a"),
            ),
            worker(
                "b",
                "/b",
                FakeSource::ok("primary-b", summary_with("b@example.com", 65, 99)),
                FakeSource::empty("fallback-b"),
            ),
        ];
        let estimator = Arc::new(
            FakeEstimator::new()
                .with_totals("/a", 1, 2)
                .with_totals("/b", 3, 4),
        );
        let mut fetcher = Fetcher::for_tests(workers, estimator);

        fetcher.active_home_override = Some("/a".to_string());
        let first = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(first.account_email, "a@example.com");
        assert_eq!(first.window_account_label, "a");
        assert_eq!(first.secondary_window.used_percent, 12);

        fetcher.active_home_override = Some("/b".to_string());
        let second = fetcher.fetch(deadline()).await.unwrap();
        assert_eq!(second.account_email, "b@example.com");
        assert_eq!(second.window_account_label, "b");
        assert_eq!(second.secondary_window.used_percent, 99);
    }

    #[tokio::test]
    async fn window_unavailable_when_active_home_missing() {
        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_with("a@example.com", 10, 20)),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::ok("primary-b", summary_with("b@example.com", 25, 70)),
                    FakeSource::empty("fallback-b"),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 1, 2)
                    .with_totals("/b", 3, 4),
            ),
        );
        fetcher.active_home_override = Some("/missing".to_string());

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert!(!out.window_data_available);
        assert_eq!(out.account_email, "");
        assert_eq!(out.window_account_label, "");
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("not in discovered accounts")));
    }

    #[tokio::test]
    async fn window_unavailable_when_active_fetch_fails() {
        let mut fetcher = Fetcher::for_tests(
            vec![
                worker(
                    "a",
                    "/a",
                    FakeSource::ok("primary-a", summary_with("a@example.com", 10, 20)),
                    FakeSource::empty("fallback-a"),
                ),
                worker(
                    "b",
                    "/b",
                    FakeSource::failing("primary-b", "boom"),
                    FakeSource::failing("fallback-b", "fallback boom"),
                ),
            ],
            Arc::new(
                FakeEstimator::new()
                    .with_totals("/a", 1, 2)
                    .with_totals("/b", 3, 4),
            ),
        );
        fetcher.active_home_override = Some("/b".to_string());

        let out = fetcher.fetch(deadline()).await.unwrap();
        assert!(!out.window_data_available);
        assert_eq!(out.account_email, "");
        assert_eq!(out.window_account_label, "");
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("window cards are unavailable")));
    }

    #[tokio::test]
    async fn close_closes_all_account_sources() {
        let primary = Arc::new(AccountSource::Fake(FakeSource::empty("primary")));
        let fallback = Arc::new(AccountSource::Fake(FakeSource::empty("fallback")));
        let mut fetcher = Fetcher::for_tests(
            vec![AccountWorker {
                account: MonitorAccount {
                    label: "a".to_string(),
                    codex_home: "/a".to_string(),
                },
                primary: primary.clone(),
                fallback: fallback.clone(),
            }],
            Arc::new(FakeEstimator::new()),
        );

        fetcher.close().await.unwrap();
        let AccountSource::Fake(primary) = &*primary else {
            unreachable!()
        };
        let AccountSource::Fake(fallback) = &*fallback else {
            unreachable!()
        };
        assert!(primary.was_closed());
        assert!(fallback.was_closed());
        // Idempotent: a second close has nothing left to do.
        fetcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn replace_account_workers_closes_removed_homes() {
        let tmp = tempfile::tempdir().unwrap();
        let old_home = tmp.path().join("old");
        let new_home = tmp.path().join("new");
        std::fs::create_dir_all(&old_home).unwrap();
        std::fs::create_dir_all(&new_home).unwrap();

        let old_primary = Arc::new(AccountSource::Fake(FakeSource::empty("old-primary")));
        let old_fallback = Arc::new(AccountSource::Fake(FakeSource::empty("old-fallback")));
        let mut fetcher = Fetcher::for_tests(
            vec![AccountWorker {
                account: MonitorAccount {
                    label: "old".to_string(),
                    codex_home: old_home.to_string_lossy().into_owned(),
                },
                primary: old_primary.clone(),
                fallback: old_fallback.clone(),
            }],
            Arc::new(FakeEstimator::new()),
        );

        fetcher
            .replace_account_workers(vec![MonitorAccount {
                label: "new".to_string(),
                codex_home: new_home.to_string_lossy().into_owned(),
            }])
            .await;

        let AccountSource::Fake(old_primary) = &*old_primary else {
            unreachable!()
        };
        let AccountSource::Fake(old_fallback) = &*old_fallback else {
            unreachable!()
        };
        assert!(old_primary.was_closed());
        assert!(old_fallback.was_closed());
        assert_eq!(fetcher.accounts.len(), 1);
        assert_eq!(fetcher.accounts[0].account.label, "new");
    }

    #[tokio::test]
    async fn refresh_reloads_and_reuses_existing_homes() {
        let tmp = tempfile::tempdir().unwrap();
        let alpha = tmp.path().join("alpha");
        let beta = tmp.path().join("beta");
        std::fs::create_dir_all(&alpha).unwrap();
        std::fs::create_dir_all(&beta).unwrap();
        let alpha_home = alpha.to_string_lossy().into_owned();
        let beta_home = beta.to_string_lossy().into_owned();

        let call_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let loader_count = call_count.clone();
        let loader_alpha = alpha_home.clone();
        let loader_beta = beta_home.clone();
        let mut fetcher = Fetcher::for_tests(Vec::new(), Arc::new(FakeEstimator::new()));
        fetcher.account_loader = Some(Box::new(move || {
            let count = loader_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if count == 1 {
                Ok((
                    vec![MonitorAccount {
                        label: "alpha".to_string(),
                        codex_home: loader_alpha.clone(),
                    }],
                    String::new(),
                ))
            } else {
                Ok((
                    vec![
                        MonitorAccount {
                            label: "alpha-renamed".to_string(),
                            codex_home: loader_alpha.clone(),
                        },
                        MonitorAccount {
                            label: "beta".to_string(),
                            codex_home: loader_beta.clone(),
                        },
                    ],
                    String::new(),
                ))
            }
        }));

        let start = Utc::now();
        fetcher.refresh_accounts(start, true).await;
        assert_eq!(fetcher.accounts.len(), 1);
        let reused_primary = fetcher.accounts[0].primary.clone();

        // Within the interval, nothing reloads.
        fetcher.refresh_accounts(start + Duration::seconds(10), false).await;
        assert_eq!(fetcher.accounts.len(), 1);

        fetcher
            .refresh_accounts(start + Duration::seconds(120), false)
            .await;
        assert_eq!(fetcher.accounts.len(), 2);
        let normalized_alpha = normalize_home(&alpha_home);
        let alpha_worker = fetcher
            .accounts
            .iter()
            .find(|w| w.account.codex_home == normalized_alpha)
            .expect("alpha home should survive the reload");
        assert_eq!(alpha_worker.account.label, "alpha-renamed");
        assert!(Arc::ptr_eq(&alpha_worker.primary, &reused_primary));
    }

    #[test]
    fn identity_key_precedence_and_tagging() {
        assert_eq!(
            identity_key("A@Example.com", "acc", "user"),
            "email:a@example.com"
        );
        assert_eq!(identity_key("", "Acc-1", "user"), "account_id:acc-1");
        assert_eq!(identity_key("", "", "User-1"), "user_id:user-1");
        assert_eq!(identity_key("  ", "", ""), "");

        let unverified = AccountSummary::default();
        assert_eq!(account_identity_or_home_key(&unverified), "unverified");
    }

    #[test]
    fn max_merge_is_non_decreasing() {
        let mut pair = ObservedWindowPair::default();
        for total in [10i64, 5, 30, 20] {
            let before = pair.window_5h.total;
            pair = merge_observed_pair_max(
                pair,
                ObservedWindowPair {
                    window_5h: ObservedTokenBreakdown {
                        total,
                        ..Default::default()
                    },
                    window_weekly: ObservedTokenBreakdown::default(),
                },
            );
            assert!(pair.window_5h.total >= before);
        }
        assert_eq!(pair.window_5h.total, 30);
    }

    #[test]
    fn prefer_rules_follow_error_then_active_then_freshness() {
        let now = Utc::now();
        let ok_row = |home: &str, fetched_at: Option<DateTime<Utc>>| AccountSummaryWithHome {
            account: AccountSummary {
                fetched_at,
                ..Default::default()
            },
            codex_home: home.to_string(),
        };

        // A candidate without an error beats an incumbent with one.
        let failed = AccountSummaryWithHome {
            account: AccountSummary {
                error: "boom".to_string(),
                ..Default::default()
            },
            codex_home: "/a".to_string(),
        };
        let ok_candidate = AccountSummary::default();
        assert!(should_prefer_account_summary(&failed, &ok_candidate, "/b", ""));

        // Active home beats non-active.
        let incumbent = ok_row("/a", None);
        assert!(should_prefer_account_summary(
            &incumbent,
            &AccountSummary::default(),
            "/active",
            "/active"
        ));

        // Fresher snapshot beats older; equal keeps the incumbent.
        let older = ok_row("/a", Some(now - Duration::seconds(60)));
        let newer = AccountSummary {
            fetched_at: Some(now),
            ..Default::default()
        };
        assert!(should_prefer_account_summary(&older, &newer, "/b", ""));
        let same = AccountSummary {
            fetched_at: Some(now - Duration::seconds(60)),
            ..Default::default()
        };
        assert!(!should_prefer_account_summary(&older, &same, "/b", ""));
    }

    #[test]
    fn account_rows_sort_by_label_email_source() {
        let mut map = HashMap::new();
        for (key, label, email, source) in [
            ("k1", "b", "", ""),
            ("k2", "a", "z@example.com", ""),
            ("k3", "a", "a@example.com", "oauth"),
            ("k4", "a", "a@example.com", "app-server"),
        ] {
            map.insert(
                key.to_string(),
                AccountSummaryWithHome {
                    account: AccountSummary {
                        label: label.to_string(),
                        account_email: email.to_string(),
                        source: source.to_string(),
                        ..Default::default()
                    },
                    codex_home: String::new(),
                },
            );
        }
        let rows = account_summaries_from_identity_map(map);
        assert_eq!(rows[0].source, "app-server");
        assert_eq!(rows[1].source, "oauth");
        assert_eq!(rows[2].account_email, "z@example.com");
        assert_eq!(rows[3].label, "b");
    }
}
