use colored::{control, Colorize};

use crate::core::doctor::DoctorReport;
use crate::core::models::summary::{ObservedTokenBreakdown, Summary, WindowSummary};

/// Render a summary as the plain-text snapshot block.
///
/// Layout:
/// ```text
///  Codex usage (app-server)
///   Plan        pro
///   Account     user@example.com
///   Five-hour   20% used, resets in 1h 12m
///   Weekly      50% used, resets in 3d 4h
///   Accounts    2 detected, 2 reachable
///   Observed    5h 12k · weekly 340k (estimated)
/// ```
pub fn render_summary(summary: &Summary, use_color: bool) -> String {
    control::set_override(use_color);

    let mut lines: Vec<String> = Vec::new();
    let header = if summary.source.is_empty() {
        " Codex usage".to_string()
    } else {
        format!(" Codex usage ({})", summary.source)
    };
    lines.push(header.bold().to_string());

    if !summary.plan_type.is_empty() {
        lines.push(label_line("Plan", &summary.plan_type));
    }
    if !summary.account_email.is_empty() {
        lines.push(label_line("Account", &summary.account_email));
    }
    if !summary.account_id.is_empty() {
        lines.push(label_line("Account id", &summary.account_id));
    }
    if !summary.user_id.is_empty() {
        lines.push(label_line("User id", &summary.user_id));
    }

    if summary.window_data_available {
        lines.push(label_line(
            "Five-hour",
            &format_window(&summary.primary_window),
        ));
        lines.push(label_line("Weekly", &format_window(&summary.secondary_window)));
        if !summary.window_account_label.is_empty() {
            lines.push(label_line("Window account", &summary.window_account_label));
        }
        if summary.additional_limit_count > 0 {
            lines.push(label_line(
                "Additional",
                &format!("{} more limits", summary.additional_limit_count),
            ));
        }
    } else {
        lines.push(label_line("Windows", "unavailable"));
    }

    if summary.total_accounts > 0 {
        lines.push(label_line(
            "Accounts",
            &format!(
                "{} detected, {} reachable",
                summary.total_accounts, summary.successful_accounts
            ),
        ));
    }

    if let Some(status) = summary.observed_tokens_status {
        let five_hour = format_observed_total(
            summary.observed_window_5h.as_ref(),
            summary.observed_tokens_5h,
        );
        let weekly = format_observed_total(
            summary.observed_window_weekly.as_ref(),
            summary.observed_tokens_weekly,
        );
        lines.push(label_line(
            "Observed",
            &format!("5h {five_hour} · weekly {weekly} ({})", status.as_str()),
        ));
        if let Some(split) = summary.observed_window_5h.as_ref().and_then(format_split) {
            lines.push(label_line("", &split));
        }
        if !summary.observed_tokens_note.is_empty() {
            lines.push(label_line("", &summary.observed_tokens_note));
        }
    }

    for account in &summary.accounts {
        let status = if account.error.is_empty() {
            format!(
                "5h {}% · weekly {}%",
                account.primary_window.used_percent, account.secondary_window.used_percent
            )
        } else {
            format!("error: {}", account.error)
        };
        lines.push(label_line(&account.label, &status));
    }

    for warning in &summary.warnings {
        lines.push(format!("  {} {}", "warning:".yellow(), warning));
    }

    control::unset_override();
    lines.join("\n")
}

pub fn render_doctor(report: &DoctorReport, use_color: bool) -> String {
    control::set_override(use_color);

    let mut lines = vec!["codex usage monitor doctor".bold().to_string(), String::new()];
    for check in &report.checks {
        let state = if check.ok {
            "PASS".green()
        } else {
            "FAIL".red()
        };
        lines.push(format!("[{state}] {}", check.name));
        lines.push(format!("  {}", check.details));
    }

    control::unset_override();
    lines.join("\n")
}

fn label_line(label: &str, value: &str) -> String {
    format!("  {}{}", format!("{label:<12}").cyan(), value)
}

fn format_window(window: &WindowSummary) -> String {
    let mut out = format!("{}% used", window.used_percent);
    if let Some(seconds) = window.seconds_until_reset {
        out.push_str(&format!(", resets in {}", format_countdown(seconds)));
    } else if let Some(resets_at) = window.resets_at {
        out.push_str(&format!(", resets at {}", resets_at.to_rfc3339()));
    }
    out
}

fn format_countdown(total_seconds: i64) -> String {
    if total_seconds <= 0 {
        return "now".to_string();
    }
    let total_minutes = total_seconds / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours >= 24 {
        let days = hours / 24;
        let rem_hours = hours % 24;
        if rem_hours == 0 {
            format!("{days}d")
        } else {
            format!("{days}d {rem_hours}h")
        }
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{}m", total_minutes.max(1))
    }
}

fn format_observed_total(window: Option<&ObservedTokenBreakdown>, fallback: Option<i64>) -> String {
    match window {
        Some(window) => format_compact_count(window.total),
        None => match fallback {
            Some(total) => format_compact_count(total),
            None => "n/a".to_string(),
        },
    }
}

fn format_split(window: &ObservedTokenBreakdown) -> Option<String> {
    if !window.has_split {
        return None;
    }
    let mut parts = vec![
        format!("input {}", format_compact_count(window.input)),
        format!("cached input {}", format_compact_count(window.cached_input)),
        format!("output {}", format_compact_count(window.output)),
    ];
    if window.reasoning_output > 0 {
        parts.push(format!(
            "reasoning {}",
            format_compact_count(window.reasoning_output)
        ));
    }
    if window.has_cached_output && window.cached_output > 0 {
        parts.push(format!(
            "cached output {}",
            format_compact_count(window.cached_output)
        ));
    }
    Some(parts.join(" | "))
}

/// Compact token counts: 999, 1k, 12k, 2m. Rounded to the nearest unit.
pub fn format_compact_count(value: i64) -> String {
    let (sign, mut value) = if value < 0 {
        ("-", -(value as f64))
    } else {
        ("", value as f64)
    };
    if value < 1000.0 {
        return format!("{sign}{}", value as i64);
    }

    let units = ["", "k", "m", "b", "t"];
    let mut unit_index = 0;
    while value >= 1000.0 && unit_index < units.len() - 1 {
        value /= 1000.0;
        unit_index += 1;
    }
    format!("{sign}{}{}", value.round() as i64, units[unit_index])
}
