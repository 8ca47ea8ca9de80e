use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::UsageError;
use crate::core::observed::dedupe_warnings;
use crate::core::paths::{
    default_codex_home, dir_exists, expand_path, file_exists, normalize_home, user_home_dir,
};

const ACCOUNTS_FILE_ENV_VAR: &str = "CODEX_USAGE_MONITOR_ACCOUNTS_FILE";
const DEFAULT_MONITOR_DIR_NAME: &str = "codex-usage-monitor";
const LEGACY_MONITOR_DIR_NAME: &str = ".codex-usage-monitor";
const DEFAULT_ACCOUNTS_FILE_NAME: &str = "accounts.json";
const MAX_DISCOVERY_DEPTH: usize = 5;

/// One monitored account: a human label plus its canonical Codex home.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorAccount {
    pub label: String,
    pub codex_home: String,
}

#[derive(Deserialize)]
struct AccountFile {
    #[serde(default)]
    #[allow(dead_code)]
    version: i64,
    #[serde(default)]
    accounts: Vec<AccountItem>,
}

#[derive(Deserialize)]
struct AccountItem {
    #[serde(default)]
    label: String,
    #[serde(default)]
    codex_home: String,
}

/// Combine the default home, the active `$CODEX_HOME`, the explicit registry
/// file, and filesystem auto-discovery into one deduplicated account list.
/// The returned string is a joined warning line (may be empty).
pub fn load_monitor_accounts() -> Result<(Vec<MonitorAccount>, String), UsageError> {
    let default_home = default_codex_home()?;

    let mut collector = AccountCollector::new();
    collector.add("default", &default_home, 50, false);

    if let Ok(env_home) = std::env::var("CODEX_HOME") {
        let env_home = env_home.trim().to_string();
        if !env_home.is_empty() {
            match expand_path(&env_home) {
                Ok(expanded) => collector.add("active", &expanded, 40, true),
                Err(e) => collector.warn(format!("could not resolve CODEX_HOME: {e}")),
            }
        }
    }

    match load_accounts_from_file() {
        Err(e) => collector.warn(format!("accounts file could not be read: {e}")),
        Ok((file_accounts, file_warning)) => {
            if !file_warning.is_empty() {
                collector.warn(file_warning);
            }
            for account in file_accounts {
                collector.add(&account.label, &account.codex_home, 100, true);
            }
        }
    }

    match discover_accounts_from_filesystem() {
        Err(e) => collector.warn(format!("auto discovery error: {e}")),
        Ok(auto_accounts) => {
            for account in auto_accounts {
                collector.add(&account.label, &account.codex_home, 30, false);
            }
        }
    }

    let mut out = collector.to_accounts();
    if out.is_empty() {
        out.push(MonitorAccount {
            label: "default".to_string(),
            codex_home: default_home,
        });
    }
    Ok((out, collector.warning_string()))
}

/// Parse the explicit registry file. A missing file yields no accounts and no
/// warning; an empty account list yields a warning.
fn load_accounts_from_file() -> Result<(Vec<MonitorAccount>, String), UsageError> {
    let accounts_path = resolve_accounts_file_path()
        .map_err(|e| UsageError::Config(format!("resolve accounts file: {e}")))?;

    let data = match std::fs::read_to_string(&accounts_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), String::new()))
        }
        Err(e) => {
            return Err(UsageError::Config(format!(
                "read accounts file {}: {e}",
                accounts_path.display()
            )))
        }
    };

    let raw: AccountFile = serde_json::from_str(&data).map_err(|e| {
        UsageError::Config(format!(
            "decode accounts file {}: {e}",
            accounts_path.display()
        ))
    })?;
    if raw.accounts.is_empty() {
        return Ok((
            Vec::new(),
            format!("accounts file {} is empty", accounts_path.display()),
        ));
    }

    let mut out = Vec::with_capacity(raw.accounts.len());
    for (i, item) in raw.accounts.iter().enumerate() {
        let label = item.label.trim();
        let label = if label.is_empty() {
            format!("account-{}", i + 1)
        } else {
            label.to_string()
        };
        let home = expand_path(item.codex_home.trim()).map_err(|e| {
            UsageError::Config(format!("resolve codex_home for account {label:?}: {e}"))
        })?;
        if home.trim().is_empty() {
            return Err(UsageError::Config(format!(
                "account {label:?} has empty codex_home"
            )));
        }
        out.push(MonitorAccount {
            label,
            codex_home: home,
        });
    }
    Ok((out, String::new()))
}

/// Registry path precedence: env override, then the default monitor
/// directory, then the legacy dot-directory when only it exists.
fn resolve_accounts_file_path() -> Result<PathBuf, UsageError> {
    if let Ok(explicit) = std::env::var(ACCOUNTS_FILE_ENV_VAR) {
        let explicit = explicit.trim().to_string();
        if !explicit.is_empty() {
            return Ok(PathBuf::from(expand_path(&explicit)?));
        }
    }
    let home = user_home_dir()?;
    let default_path = home
        .join(DEFAULT_MONITOR_DIR_NAME)
        .join(DEFAULT_ACCOUNTS_FILE_NAME);
    if file_exists(&default_path) {
        return Ok(default_path);
    }
    let legacy_path = home
        .join(LEGACY_MONITOR_DIR_NAME)
        .join(DEFAULT_ACCOUNTS_FILE_NAME);
    if file_exists(&legacy_path) {
        return Ok(legacy_path);
    }
    Ok(default_path)
}

fn discover_accounts_from_filesystem() -> Result<Vec<MonitorAccount>, UsageError> {
    let home = user_home_dir()?;
    let candidates = discover_codex_homes(&home);

    let mut out: Vec<MonitorAccount> = candidates
        .into_iter()
        .filter(|path| has_usage_signals(Path::new(path)))
        .map(|path| MonitorAccount {
            label: label_for_discovered_home(Path::new(&path)),
            codex_home: path,
        })
        .collect();
    out.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(out)
}

/// Candidate homes under the user home: `.codex*` entries at the top level,
/// plus directories named `codex-home` or `.codex` up to five levels deep.
/// Unreadable directories are silently skipped.
fn discover_codex_homes(home: &Path) -> Vec<String> {
    let mut candidates = BTreeSet::new();

    if let Ok(entries) = std::fs::read_dir(home) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(".codex") {
                    candidates.insert(path.to_string_lossy().into_owned());
                }
            }
        }
    }

    walk_for_homes(home, 0, &mut candidates);
    candidates.into_iter().collect()
}

fn walk_for_homes(dir: &Path, depth: usize, candidates: &mut BTreeSet<String>) {
    if depth > MAX_DISCOVERY_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if depth > 0 && (name == "codex-home" || name == ".codex") {
            candidates.insert(path.to_string_lossy().into_owned());
        }
        walk_for_homes(&path, depth + 1, candidates);
    }
}

/// A candidate only counts when the directory actually carries usage state.
pub fn has_usage_signals(codex_home: &Path) -> bool {
    file_exists(&codex_home.join("auth.json"))
        || dir_exists(&codex_home.join("sessions"))
        || dir_exists(&codex_home.join("archived_sessions"))
}

fn label_for_discovered_home(codex_home: &Path) -> String {
    let base = codex_home
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if base == "codex-home" {
        let parent = codex_home
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");
        if !parent.trim().is_empty() && parent != "." {
            return safe_label(parent);
        }
    } else if base.starts_with(".codex") {
        if base == ".codex" {
            return "default".to_string();
        }
        return safe_label(base.trim_start_matches('.'));
    }
    safe_label(base)
}

fn safe_label(label: &str) -> String {
    let label = label.trim();
    if label.is_empty() {
        return "account".to_string();
    }
    label.to_string()
}

/// Deduplicates candidate accounts by canonical home; the highest-priority
/// candidate keeps the label.
struct AccountCollector {
    by_home: HashMap<String, AccountCandidate>,
    warnings: Vec<String>,
}

struct AccountCandidate {
    account: MonitorAccount,
    priority: i32,
}

impl AccountCollector {
    fn new() -> Self {
        Self {
            by_home: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    fn add(&mut self, label: &str, codex_home: &str, priority: i32, allow_without_signals: bool) {
        let normalized = normalize_home(codex_home);
        if normalized.is_empty() {
            return;
        }
        if !allow_without_signals && !has_usage_signals(Path::new(&normalized)) {
            return;
        }
        if let Some(existing) = self.by_home.get(&normalized) {
            if existing.priority >= priority {
                return;
            }
        }
        self.by_home.insert(
            normalized.clone(),
            AccountCandidate {
                account: MonitorAccount {
                    label: safe_label(label),
                    codex_home: normalized,
                },
                priority,
            },
        );
    }

    fn warn(&mut self, message: String) {
        let message = message.trim().to_string();
        if !message.is_empty() {
            self.warnings.push(message);
        }
    }

    fn warning_string(&self) -> String {
        dedupe_warnings(self.warnings.clone()).join("; ")
    }

    fn to_accounts(&self) -> Vec<MonitorAccount> {
        let mut out: Vec<MonitorAccount> = self
            .by_home
            .values()
            .map(|candidate| candidate.account.clone())
            .collect();
        out.sort_by(|a, b| {
            a.label
                .cmp(&b.label)
                .then_with(|| a.codex_home.cmp(&b.codex_home))
        });
        out
    }
}
