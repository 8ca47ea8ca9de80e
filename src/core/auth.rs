use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::core::error::UsageError;
use crate::core::paths::file_exists;

#[derive(Deserialize)]
struct AuthFilePayload {
    #[serde(default)]
    #[allow(dead_code)]
    auth_mode: Option<String>,
    #[serde(default)]
    tokens: AuthTokens,
}

#[derive(Deserialize, Default)]
struct AuthTokens {
    #[serde(default)]
    access_token: Option<String>,
}

/// Locate `auth.json` under a Codex home. Missing file is an auth error.
pub fn find_auth_json_path(codex_home: &str) -> Result<PathBuf, UsageError> {
    let trimmed = codex_home.trim();
    if !trimmed.is_empty() {
        let path = Path::new(trimmed).join("auth.json");
        if file_exists(&path) {
            return Ok(path);
        }
    }
    Err(UsageError::Auth(format!(
        "auth.json not found in {}",
        Path::new(trimmed).join("auth.json").display()
    )))
}

/// Read and trim the access token from an auth file. Blank tokens error.
pub fn read_access_token(path: &Path) -> Result<String, UsageError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| UsageError::Auth(format!("read auth file: {e}")))?;
    let payload: AuthFilePayload = serde_json::from_str(&data)
        .map_err(|e| UsageError::Auth(format!("decode auth file: {e}")))?;
    let token = payload
        .tokens
        .access_token
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if token.is_empty() {
        return Err(UsageError::Auth(
            "auth.json missing tokens.access_token".to_string(),
        ));
    }
    Ok(token)
}

/// Opaque fingerprint over the auth path and a hash of the token. A change
/// forces the app-server session to restart with fresh credentials.
pub fn auth_fingerprint_for_home(codex_home: &str) -> Result<String, UsageError> {
    let auth_path = find_auth_json_path(codex_home)?;
    let token = read_access_token(&auth_path)?;
    let digest = Sha256::digest(token.as_bytes());
    Ok(format!("{}:{:x}", auth_path.display(), digest))
}
