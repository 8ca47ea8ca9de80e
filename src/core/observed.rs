use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::models::summary::{ObservedTokenBreakdown, ObservedTokensStatus};
use crate::core::paths::lexical_clean;

const JOURNAL_EXTENSION: &str = "jsonl";

/// Local token estimate replayed from session journals. Never authoritative;
/// the status and note say how trustworthy the numbers are right now.
#[derive(Debug, Clone, Default)]
pub struct ObservedTokenEstimate {
    pub window_5h: ObservedTokenBreakdown,
    pub window_weekly: ObservedTokenBreakdown,
    pub status: Option<ObservedTokensStatus>,
    pub note: String,
    pub warming: bool,
    pub warnings: Vec<String>,
}

/// Estimator failure: the caller reports `note` per account and demotes the
/// observed status to unavailable.
#[derive(Debug, Clone)]
pub struct EstimateError {
    pub note: String,
    pub message: String,
}

impl std::fmt::Display for EstimateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Anything that can produce an observed-token estimate for one home.
/// The aggregator only depends on this, so tests can inject fixed values.
pub trait TokenEstimator: Send + Sync {
    fn estimate(
        &self,
        codex_home: &str,
        now: DateTime<Utc>,
    ) -> Result<ObservedTokenEstimate, EstimateError>;
}

/// Journal-replaying estimator with a per-home TTL cache. In async mode a
/// cache miss returns immediately (warming or stale data) while a detached
/// refresh recomputes; in synchronous mode it computes inline.
pub struct ObservedTokenEstimator {
    shared: Arc<EstimatorShared>,
}

struct EstimatorShared {
    state: Mutex<EstimatorState>,
    ttl: StdDuration,
    async_mode: bool,
}

#[derive(Default)]
struct EstimatorState {
    cache: HashMap<String, CachedEstimate>,
    inflight: HashSet<String>,
}

struct CachedEstimate {
    at: DateTime<Utc>,
    estimate: ObservedTokenEstimate,
}

impl ObservedTokenEstimator {
    pub fn new(ttl: StdDuration, async_mode: bool) -> Self {
        let ttl = if ttl.is_zero() {
            StdDuration::from_secs(60)
        } else {
            ttl
        };
        Self {
            shared: Arc::new(EstimatorShared {
                state: Mutex::new(EstimatorState::default()),
                ttl,
                async_mode,
            }),
        }
    }
}

impl TokenEstimator for ObservedTokenEstimator {
    fn estimate(
        &self,
        codex_home: &str,
        now: DateTime<Utc>,
    ) -> Result<ObservedTokenEstimate, EstimateError> {
        let trimmed = codex_home.trim();
        if trimmed.is_empty() {
            return Err(EstimateError {
                note: "missing codex home".to_string(),
                message: "missing codex home".to_string(),
            });
        }
        // The cleaned path is the cache and single-flight key, so different
        // spellings of one home share an entry.
        let home = lexical_clean(Path::new(trimmed))
            .to_string_lossy()
            .into_owned();

        match std::fs::metadata(&home) {
            Err(e) => {
                return Err(EstimateError {
                    note: format!("codex home is not accessible: {e}"),
                    message: format!("stat codex home {home}: {e}"),
                })
            }
            Ok(meta) if !meta.is_dir() => {
                return Err(EstimateError {
                    note: "codex home is not a directory".to_string(),
                    message: format!("codex home {home} is not a directory"),
                })
            }
            Ok(_) => {}
        }

        let cached = {
            let state = self.shared.state.lock().unwrap();
            state.cache.get(&home).map(|entry| (entry.at, entry.estimate.clone()))
        };
        if let Some((at, estimate)) = &cached {
            let age = (now - *at).to_std().unwrap_or_default();
            if age <= self.shared.ttl {
                let mut out = estimate.clone();
                out.note = format!("local estimate (updated {} ago)", human_duration(age));
                return Ok(out);
            }
        }

        if !self.shared.async_mode {
            let estimate = compute_observed_estimate(Path::new(&home), now).map_err(|e| {
                EstimateError {
                    note: e.clone(),
                    message: e,
                }
            })?;
            let mut state = self.shared.state.lock().unwrap();
            state.cache.insert(
                home,
                CachedEstimate {
                    at: now,
                    estimate: estimate.clone(),
                },
            );
            return Ok(estimate);
        }

        let launch_refresh = {
            let mut state = self.shared.state.lock().unwrap();
            state.inflight.insert(home.clone())
        };
        if launch_refresh {
            let shared = self.shared.clone();
            let home = home.clone();
            std::thread::spawn(move || refresh_estimate(shared, home));
        }

        if let Some((_, estimate)) = cached {
            let mut out = estimate;
            out.note = "local estimate (refreshing)".to_string();
            return Ok(out);
        }

        Ok(ObservedTokenEstimate {
            status: Some(ObservedTokensStatus::Unavailable),
            note: "warming token estimate".to_string(),
            warming: true,
            ..Default::default()
        })
    }
}

fn refresh_estimate(shared: Arc<EstimatorShared>, home: String) {
    let now = Utc::now();
    let result = compute_observed_estimate(Path::new(&home), now);
    let mut state = shared.state.lock().unwrap();
    state.inflight.remove(&home);
    match result {
        Ok(estimate) => {
            debug!(home = %home, total_5h = estimate.window_5h.total, "refreshed token estimate");
            state.cache.insert(home, CachedEstimate { at: now, estimate });
        }
        Err(e) => warn!(home = %home, error = %e, "token estimate refresh failed"),
    }
}

/// Replay every recent journal for a home and window the usage into the
/// trailing 5 h and 7 d accumulators.
pub fn compute_observed_estimate(
    codex_home: &Path,
    now: DateTime<Utc>,
) -> Result<ObservedTokenEstimate, String> {
    let (files, mut warnings) = discover_recent_usage_files(codex_home, now)?;

    let cutoff_5h = now - Duration::hours(5);
    let cutoff_1w = now - Duration::days(7);

    let mut total_5h = TokenAccumulator::default();
    let mut total_weekly = TokenAccumulator::default();
    for file in &files {
        let (file_5h, file_weekly, file_warnings) =
            estimate_tokens_from_file(file, cutoff_5h, cutoff_1w)?;
        total_5h.add(&file_5h);
        total_weekly.add(&file_weekly);
        warnings.extend(file_warnings);
    }

    Ok(ObservedTokenEstimate {
        window_5h: total_5h.to_breakdown(),
        window_weekly: total_weekly.to_breakdown(),
        status: Some(ObservedTokensStatus::Estimated),
        note: "local estimate".to_string(),
        warming: false,
        warnings: dedupe_warnings(warnings),
    })
}

/// Collect journal files for day offsets 0..=8 under the date-sharded
/// sessions tree, plus recently-modified archived sessions. Missing
/// directories are skipped; other I/O errors are fatal.
fn discover_recent_usage_files(
    codex_home: &Path,
    now: DateTime<Utc>,
) -> Result<(Vec<PathBuf>, Vec<String>), String> {
    let mut files = Vec::new();
    let mut warnings = Vec::new();
    let archive_cutoff = now - Duration::days(8);

    for day in 0..=8 {
        let date = now - Duration::days(day);
        let dir = codex_home
            .join("sessions")
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(format!("read sessions dir {}: {e}", dir.display())),
        };
        for entry in entries {
            let entry = entry.map_err(|e| format!("read sessions dir {}: {e}", dir.display()))?;
            let path = entry.path();
            if path.is_dir() || !has_journal_extension(&path) {
                continue;
            }
            files.push(path);
        }
    }

    let archived_dir = codex_home.join("archived_sessions");
    match std::fs::read_dir(&archived_dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(format!(
                "read archived sessions dir {}: {e}",
                archived_dir.display()
            ))
        }
        Ok(entries) => {
            for entry in entries {
                let entry = entry
                    .map_err(|e| format!("read archived sessions dir {}: {e}", archived_dir.display()))?;
                let path = entry.path();
                if path.is_dir() || !has_journal_extension(&path) {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map(DateTime::<Utc>::from);
                match modified {
                    Err(e) => {
                        warnings.push(format!("skip {}: {e}", path.display()));
                        continue;
                    }
                    Ok(modified) if modified < archive_cutoff => continue,
                    Ok(_) => files.push(path),
                }
            }
        }
    }

    files.sort();
    Ok((files, warnings))
}

fn has_journal_extension(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(JOURNAL_EXTENSION)
}

#[derive(Deserialize)]
struct TokenCountLine {
    #[serde(default)]
    timestamp: String,
    #[serde(default, rename = "type")]
    line_type: String,
    #[serde(default)]
    payload: TokenCountPayload,
}

#[derive(Deserialize, Default)]
struct TokenCountPayload {
    #[serde(default, rename = "type")]
    payload_type: String,
    #[serde(default)]
    info: Option<TokenCountInfo>,
}

#[derive(Deserialize, Default)]
struct TokenCountInfo {
    #[serde(default)]
    total_token_usage: TokenUsageTotal,
    #[serde(default)]
    last_token_usage: TokenUsageTotal,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct TokenUsageTotal {
    #[serde(default)]
    total_tokens: i64,
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    cached_input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    reasoning_output_tokens: i64,
    #[serde(default)]
    cached_output_tokens: i64,
}

impl TokenUsageTotal {
    fn has_usage(&self) -> bool {
        self.total_tokens > 0
            || self.input_tokens > 0
            || self.cached_input_tokens > 0
            || self.output_tokens > 0
            || self.reasoning_output_tokens > 0
            || self.cached_output_tokens > 0
    }
}

#[derive(Default, Clone, Copy)]
struct TokenAccumulator {
    total: i64,
    input: i64,
    cached_input: i64,
    output: i64,
    reasoning_output: i64,
    cached_output: i64,
    has_split: bool,
    has_cached_output: bool,
}

impl TokenAccumulator {
    fn add(&mut self, other: &TokenAccumulator) {
        self.total += other.total;
        self.input += other.input;
        self.cached_input += other.cached_input;
        self.output += other.output;
        self.reasoning_output += other.reasoning_output;
        self.cached_output += other.cached_output;
        self.has_split |= other.has_split;
        self.has_cached_output |= other.has_cached_output;
    }

    fn add_token_usage(&mut self, usage: &TokenUsageTotal) {
        if usage.total_tokens <= 0 {
            return;
        }
        self.total += usage.total_tokens;
        self.input += usage.input_tokens;
        self.cached_input += usage.cached_input_tokens;
        self.output += usage.output_tokens;
        self.reasoning_output += usage.reasoning_output_tokens;
        self.cached_output += usage.cached_output_tokens;
        self.has_split = true;
        if usage.cached_output_tokens != 0 {
            self.has_cached_output = true;
        }
    }

    fn to_breakdown(self) -> ObservedTokenBreakdown {
        ObservedTokenBreakdown {
            total: self.total,
            input: self.input,
            cached_input: self.cached_input,
            output: self.output,
            reasoning_output: self.reasoning_output,
            cached_output: self.cached_output,
            has_split: self.has_split,
            has_cached_output: self.has_cached_output,
        }
    }
}

/// Replay one journal. Unparsable lines are counted into a warning, never
/// fatal. Every accepted record advances the monotonic anchor, including
/// records outside the weekly window.
fn estimate_tokens_from_file(
    path: &Path,
    cutoff_5h: DateTime<Utc>,
    cutoff_1w: DateTime<Utc>,
) -> Result<(TokenAccumulator, TokenAccumulator, Vec<String>), String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("open usage file {}: {e}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut warnings = Vec::new();
    let mut prev_total: Option<TokenUsageTotal> = None;
    let mut sum_5h = TokenAccumulator::default();
    let mut sum_1w = TokenAccumulator::default();
    let mut parse_err_count = 0usize;

    for line in reader.lines() {
        let line = line.map_err(|e| format!("scan usage file {}: {e}", path.display()))?;
        let record: TokenCountLine = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(_) => {
                parse_err_count += 1;
                continue;
            }
        };
        if record.line_type != "event_msg" || record.payload.payload_type != "token_count" {
            continue;
        }
        let Some(info) = record.payload.info else {
            continue;
        };

        let event_time = match DateTime::parse_from_rfc3339(&record.timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(_) => {
                parse_err_count += 1;
                continue;
            }
        };

        if event_time >= cutoff_1w {
            if let Some(usage) = usage_for_event(&info.total_token_usage, &info.last_token_usage, prev_total.as_ref()) {
                sum_1w.add_token_usage(&usage);
                if event_time >= cutoff_5h {
                    sum_5h.add_token_usage(&usage);
                }
            }
        }
        prev_total = Some(info.total_token_usage);
    }

    if parse_err_count > 0 {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        warnings.push(format!(
            "skipped {parse_err_count} unparsable lines in {name}"
        ));
    }
    Ok((sum_5h, sum_1w, warnings))
}

/// Duplicate-safe per-event usage: a non-negative delta against the previous
/// cumulative total wins; repeated totals contribute nothing; without an
/// anchor, a non-zero `last_token_usage` stands in.
fn usage_for_event(
    current: &TokenUsageTotal,
    last: &TokenUsageTotal,
    previous: Option<&TokenUsageTotal>,
) -> Option<TokenUsageTotal> {
    if let Some(previous) = previous {
        if let Some(delta) = token_usage_delta(previous, current) {
            if delta.total_tokens > 0 {
                return Some(delta);
            }
            return None;
        }
    }
    if last.has_usage() {
        return Some(*last);
    }
    None
}

fn token_usage_delta(prev: &TokenUsageTotal, current: &TokenUsageTotal) -> Option<TokenUsageTotal> {
    if current.total_tokens < prev.total_tokens {
        return None;
    }
    let total_delta = current.total_tokens - prev.total_tokens;
    if total_delta <= 0 {
        return Some(TokenUsageTotal::default());
    }
    Some(TokenUsageTotal {
        total_tokens: total_delta,
        input_tokens: non_negative_delta(prev.input_tokens, current.input_tokens),
        cached_input_tokens: non_negative_delta(prev.cached_input_tokens, current.cached_input_tokens),
        output_tokens: non_negative_delta(prev.output_tokens, current.output_tokens),
        reasoning_output_tokens: non_negative_delta(
            prev.reasoning_output_tokens,
            current.reasoning_output_tokens,
        ),
        cached_output_tokens: non_negative_delta(
            prev.cached_output_tokens,
            current.cached_output_tokens,
        ),
    })
}

fn non_negative_delta(prev: i64, current: i64) -> i64 {
    (current - prev).max(0)
}

/// Trim, drop empties, dedupe case-insensitively (first occurrence kept),
/// then sort for stable output.
pub fn dedupe_warnings(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_string());
        }
    }
    out.sort();
    out
}

/// Duration rounded to whole seconds, printed with every unit from the
/// highest active one down through seconds: "42s", "1m30s", "1h0m0s".
pub fn human_duration(duration: StdDuration) -> String {
    let mut total_secs = duration.as_secs();
    if duration.subsec_nanos() >= 500_000_000 {
        total_secs += 1;
    }
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
