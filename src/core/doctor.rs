use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::auth::{find_auth_json_path, read_access_token};
use crate::core::models::summary::{DoctorCheck, Summary};
use crate::core::paths::default_codex_home;
use crate::core::sources::{AppServerSource, OAuthSource};

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Serialize, Deserialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    /// Healthy when at least one of the two fetch probes succeeded.
    pub fn healthy(&self) -> bool {
        self.checks
            .iter()
            .any(|c| c.ok && (c.name == "app-server fetch" || c.name == "oauth fetch"))
    }
}

/// Run the fixed probe sequence: binary version, auth readability, then one
/// fetch per source, each bounded by an 8 s timeout.
pub async fn run_doctor() -> DoctorReport {
    let mut checks = Vec::new();

    checks.push(check_codex_binary().await);
    checks.push(check_auth_json());

    let home = default_codex_home().unwrap_or_default();

    let app_server = AppServerSource::for_home(&home);
    let result = app_server.fetch(Instant::now() + PROBE_TIMEOUT).await;
    checks.push(fetch_check(app_server.name(), result));
    let _ = app_server.close().await;

    let oauth = OAuthSource::for_home(&home);
    let result = tokio::time::timeout(PROBE_TIMEOUT, oauth.fetch())
        .await
        .unwrap_or_else(|_| {
            Err(crate::core::error::UsageError::Cancelled {
                method: "oauth fetch".to_string(),
                cause: "deadline exceeded".to_string(),
            })
        });
    checks.push(fetch_check(oauth.name(), result));
    let _ = oauth.close().await;

    DoctorReport { checks }
}

/// Probe the codex binary itself: run `codex --version` and report what it
/// printed. A missing binary, non-zero exit, or hang all fail this check.
async fn check_codex_binary() -> DoctorCheck {
    let name = "codex binary".to_string();
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new("codex")
            .arg("--version")
            .output(),
    )
    .await;

    match output {
        Err(_) => DoctorCheck {
            name,
            ok: false,
            details: format!(
                "failed to execute codex --version: timed out after {}s",
                PROBE_TIMEOUT.as_secs()
            ),
        },
        Ok(Err(err)) => DoctorCheck {
            name,
            ok: false,
            details: format!("failed to execute codex --version: {err}"),
        },
        Ok(Ok(output)) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            DoctorCheck {
                name,
                ok: false,
                details: format!(
                    "codex --version exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            }
        }
        Ok(Ok(output)) => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            DoctorCheck {
                name,
                ok: true,
                details: if version.is_empty() {
                    "version output is empty".to_string()
                } else {
                    version
                },
            }
        }
    }
}

fn check_auth_json() -> DoctorCheck {
    let home = match default_codex_home() {
        Ok(home) => home,
        Err(err) => {
            return DoctorCheck {
                name: "auth file".to_string(),
                ok: false,
                details: err.to_string(),
            }
        }
    };
    let path = match find_auth_json_path(&home) {
        Ok(path) => path,
        Err(err) => {
            return DoctorCheck {
                name: "auth file".to_string(),
                ok: false,
                details: err.to_string(),
            }
        }
    };
    match read_access_token(&path) {
        Err(err) => DoctorCheck {
            name: "auth file".to_string(),
            ok: false,
            details: format!("found {} but token read failed: {err}", path.display()),
        },
        Ok(_) => DoctorCheck {
            name: "auth file".to_string(),
            ok: true,
            details: format!("found {} with access token", path.display()),
        },
    }
}

fn fetch_check(
    source_name: &str,
    result: Result<Summary, crate::core::error::UsageError>,
) -> DoctorCheck {
    let name = format!("{source_name} fetch");
    match result {
        Err(err) => DoctorCheck {
            name,
            ok: false,
            details: err.to_string(),
        },
        Ok(summary) => DoctorCheck {
            name,
            ok: true,
            details: format!(
                "plan={} 5h={}% weekly={}% source={}",
                summary.plan_type,
                summary.primary_window.used_percent,
                summary.secondary_window.used_percent,
                summary.source
            ),
        },
    }
}
