use std::path::{Component, Path, PathBuf};

use crate::core::error::UsageError;

/// Normalize an account home path into its canonical on-disk identity.
///
/// Trims whitespace, lexically cleans, absolutizes against the working
/// directory, resolves symlinks when the path exists, and cleans again. The
/// result is the dedup key for accounts discovered through multiple paths.
/// Idempotent: normalizing an already-normalized path is a no-op.
pub fn normalize_home(home: &str) -> String {
    let trimmed = home.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut normalized = lexical_clean(Path::new(trimmed));
    if normalized.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            normalized = cwd.join(normalized);
        }
    }
    if let Ok(resolved) = std::fs::canonicalize(&normalized) {
        normalized = resolved;
    }
    lexical_clean(&normalized).to_string_lossy().into_owned()
}

/// Lexically clean a path: collapse `.`, resolve `..` against parent
/// components where possible, drop redundant separators. Unlike
/// [`normalize_home`] this never touches the filesystem.
pub(crate) fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                let last_is_root =
                    matches!(out.components().next_back(), Some(Component::RootDir));
                if last_is_normal {
                    out.pop();
                } else if !last_is_root {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Resolve the user's home directory. `$HOME` wins so tests can redirect it.
pub fn user_home_dir() -> Result<PathBuf, UsageError> {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir().ok_or_else(|| UsageError::Config("resolve home directory".to_string()))
}

/// Resolve the default Codex home: `$CODEX_HOME` if set, else `~/.codex`.
pub fn default_codex_home() -> Result<String, UsageError> {
    if let Ok(codex_home) = std::env::var("CODEX_HOME") {
        let trimmed = codex_home.trim();
        if !trimmed.is_empty() {
            return expand_path(trimmed);
        }
    }
    let home = user_home_dir()?;
    Ok(home.join(".codex").to_string_lossy().into_owned())
}

/// Expand a leading `~` or `~/` against the user home. Other paths pass
/// through unchanged.
pub fn expand_path(path: &str) -> Result<String, UsageError> {
    if path.is_empty() {
        return Ok(String::new());
    }
    if path == "~" {
        return Ok(user_home_dir()?.to_string_lossy().into_owned());
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return Ok(user_home_dir()?.join(rest).to_string_lossy().into_owned());
    }
    Ok(path.to_string())
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Serializes tests that rewrite HOME / CODEX_HOME; process env is global.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
