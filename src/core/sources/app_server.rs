use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex as TokioMutex};
use tokio::time::Instant;
use tracing::debug;

use crate::core::auth::auth_fingerprint_for_home;
use crate::core::error::UsageError;
use crate::core::models::summary::Summary;
use crate::core::sources::normalize::{normalize_summary, IdentityInfo, RateLimitsReadResultRaw};

const CLIENT_NAME: &str = "codex-usage-monitor";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const CODEX_PROGRAM: &str = "codex";

type FingerprintFn = Box<dyn Fn() -> Result<String, UsageError> + Send + Sync>;

/// Primary source: a persistent `codex app-server` subprocess speaking
/// line-framed JSON-RPC. The session is spawned lazily on first fetch and
/// restarted after stream loss or an auth change.
pub struct AppServerSource {
    /// Serializes whole fetches so at most one request is in flight.
    req_lock: TokioMutex<()>,
    state: StdMutex<SourceState>,
    codex_home: String,
    program: String,
    fingerprint_fn: Option<FingerprintFn>,
}

#[derive(Default)]
struct SourceState {
    session: Option<Arc<AppServerSession>>,
    auth_fingerprint: String,
}

impl AppServerSource {
    pub fn for_home(codex_home: &str) -> Self {
        Self {
            req_lock: TokioMutex::new(()),
            state: StdMutex::new(SourceState::default()),
            codex_home: codex_home.trim().to_string(),
            program: CODEX_PROGRAM.to_string(),
            fingerprint_fn: None,
        }
    }

    #[cfg(test)]
    fn with_program(codex_home: &str, program: &str) -> Self {
        let mut source = Self::for_home(codex_home);
        source.program = program.to_string();
        source
    }

    #[cfg(test)]
    fn with_fingerprint_fn(fingerprint_fn: FingerprintFn) -> Self {
        let mut source = Self::for_home("");
        source.fingerprint_fn = Some(fingerprint_fn);
        source
    }

    pub fn name(&self) -> &'static str {
        "app-server"
    }

    pub async fn fetch(&self, deadline: Instant) -> Result<Summary, UsageError> {
        let _guard = self.req_lock.lock().await;

        let mut warnings = Vec::new();
        if let Some(warning) = self.refresh_auth_state().await {
            warnings.push(warning);
        }

        let session = self.ensure_session(deadline).await?;

        let result = match session.fetch_rate_limits(deadline).await {
            Ok(result) => result,
            Err(err) => {
                self.reset_session().await;
                return Err(err);
            }
        };
        let additional = result.rate_limits_by_limit_id.len().saturating_sub(1);

        let identity = match session.fetch_account(deadline).await {
            Ok(identity) => Some(identity),
            Err(err) => {
                warnings.push(format!("account identity unavailable: {err}"));
                None
            }
        };

        normalize_summary(
            self.name(),
            &result.rate_limits,
            additional,
            identity.as_ref(),
            warnings,
            Utc::now(),
        )
    }

    pub async fn close(&self) -> Result<(), UsageError> {
        let session = self.state.lock().unwrap().session.take();
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    async fn ensure_session(&self, deadline: Instant) -> Result<Arc<AppServerSession>, UsageError> {
        let session = {
            let mut state = self.state.lock().unwrap();
            state
                .session
                .get_or_insert_with(|| {
                    Arc::new(AppServerSession::new(&self.codex_home, &self.program))
                })
                .clone()
        };

        if let Err(err) = session.ensure_started().await {
            return Err(UsageError::Protocol(format!(
                "start app-server source: {err}"
            )));
        }
        if let Err(err) = session.ensure_initialized(deadline).await {
            let _ = session.close().await;
            return Err(match err {
                cancelled @ UsageError::Cancelled { .. } => cancelled,
                other => UsageError::Protocol(format!("initialize app-server source: {other}")),
            });
        }
        Ok(session)
    }

    async fn reset_session(&self) {
        let session = self.state.lock().unwrap().session.take();
        if let Some(session) = session {
            let _ = session.close().await;
        }
    }

    /// Recompute the auth fingerprint and restart the session when it moved.
    /// Returns a user-facing warning when a restart happened.
    async fn refresh_auth_state(&self) -> Option<String> {
        let fingerprint = match &self.fingerprint_fn {
            Some(fingerprint_fn) => fingerprint_fn(),
            None => auth_fingerprint_for_home(&self.codex_home),
        };

        match fingerprint {
            Err(_) => {
                let had_fingerprint = {
                    let state = self.state.lock().unwrap();
                    !state.auth_fingerprint.is_empty()
                };
                if !had_fingerprint {
                    return None;
                }
                self.reset_session().await;
                self.state.lock().unwrap().auth_fingerprint.clear();
                Some("auth state changed; restarted app-server session".to_string())
            }
            Ok(fingerprint) => {
                let changed = {
                    let mut state = self.state.lock().unwrap();
                    if state.auth_fingerprint.is_empty() {
                        state.auth_fingerprint = fingerprint.clone();
                        return None;
                    }
                    state.auth_fingerprint != fingerprint
                };
                if !changed {
                    return None;
                }
                self.reset_session().await;
                self.state.lock().unwrap().auth_fingerprint = fingerprint;
                Some("auth state changed; restarted app-server session".to_string())
            }
        }
    }

    #[cfg(test)]
    fn stored_fingerprint(&self) -> String {
        self.state.lock().unwrap().auth_fingerprint.clone()
    }

    #[cfg(test)]
    fn has_session(&self) -> bool {
        self.state.lock().unwrap().session.is_some()
    }

    #[cfg(test)]
    fn install_session(&self) {
        let session = Arc::new(AppServerSession::new(&self.codex_home, &self.program));
        self.state.lock().unwrap().session = Some(session);
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    #[allow(dead_code)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountReadResultRaw {
    #[serde(default)]
    account: Option<AccountReadAccountRaw>,
    #[serde(default)]
    requires_openai_auth: bool,
}

#[derive(Debug, Deserialize)]
struct AccountReadAccountRaw {
    #[serde(default)]
    email: String,
}

struct AppServerSession {
    codex_home: String,
    program: String,
    inner: Arc<StdMutex<SessionInner>>,
    stdin: Arc<TokioMutex<Option<ChildStdin>>>,
}

#[derive(Default)]
struct SessionInner {
    running: bool,
    initialized: bool,
    next_id: i64,
    pending: HashMap<i64, oneshot::Sender<RpcMessage>>,
    done_err: Option<String>,
    child: Option<Child>,
    done_rx: Option<watch::Receiver<bool>>,
}

/// Removes a registered pending slot if the owning request future is dropped
/// before a response arrives, so a cancelled request leaves the session usable.
struct PendingGuard {
    inner: Arc<StdMutex<SessionInner>>,
    id: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.lock().unwrap().pending.remove(&self.id);
    }
}

impl AppServerSession {
    fn new(codex_home: &str, program: &str) -> Self {
        Self {
            codex_home: codex_home.to_string(),
            program: program.to_string(),
            inner: Arc::new(StdMutex::new(SessionInner::default())),
            stdin: Arc::new(TokioMutex::new(None)),
        }
    }

    /// Spawn the child process and reader task if not already running.
    /// Callers are serialized by the source's request lock.
    async fn ensure_started(&self) -> Result<(), UsageError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.running {
                return Ok(());
            }
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(["-s", "read-only", "-a", "untrusted", "app-server"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if !self.codex_home.is_empty() {
            cmd.env("CODEX_HOME", &self.codex_home);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| UsageError::Protocol(format!("start codex app-server: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UsageError::Protocol("open stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UsageError::Protocol("open stdout pipe".to_string()))?;

        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.running = true;
            inner.initialized = false;
            inner.done_err = None;
            inner.child = Some(child);
            inner.done_rx = Some(done_rx);
        }
        *self.stdin.lock().await = Some(stdin);

        debug!(home = %self.codex_home, "spawned app-server session");
        tokio::spawn(read_loop(
            self.inner.clone(),
            self.stdin.clone(),
            stdout,
            done_tx,
        ));
        Ok(())
    }

    async fn ensure_initialized(&self, deadline: Instant) -> Result<(), UsageError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.initialized {
                return Ok(());
            }
        }

        self.request(
            "initialize",
            json!({
                "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
                "capabilities": {},
            }),
            deadline,
        )
        .await?;
        self.notify("initialized", json!({})).await?;

        self.inner.lock().unwrap().initialized = true;
        Ok(())
    }

    async fn fetch_rate_limits(
        &self,
        deadline: Instant,
    ) -> Result<RateLimitsReadResultRaw, UsageError> {
        let result = self
            .request("account/rateLimits/read", json!({}), deadline)
            .await?;
        serde_json::from_value(result).map_err(|e| {
            UsageError::Protocol(format!("decode account/rateLimits/read response: {e}"))
        })
    }

    async fn fetch_account(&self, deadline: Instant) -> Result<IdentityInfo, UsageError> {
        let result = self.request("account/read", json!({}), deadline).await?;
        let raw: AccountReadResultRaw = serde_json::from_value(result)
            .map_err(|e| UsageError::Protocol(format!("decode account/read response: {e}")))?;
        match raw.account {
            Some(account) => Ok(IdentityInfo {
                email: account.email.trim().to_string(),
                ..Default::default()
            }),
            None if raw.requires_openai_auth => Err(UsageError::Protocol(
                "account/read requires OpenAI auth".to_string(),
            )),
            None => Err(UsageError::Protocol(
                "account/read missing account".to_string(),
            )),
        }
    }

    /// Send one id-correlated request and wait for its response, the
    /// deadline, or stream termination, whichever comes first.
    async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Instant,
    ) -> Result<Value, UsageError> {
        let (id, rx) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.running {
                return Err(UsageError::Protocol(
                    "app-server process not started".to_string(),
                ));
            }
            inner.next_id += 1;
            let id = inner.next_id;
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(id, tx);
            (id, rx)
        };
        let _pending = PendingGuard {
            inner: self.inner.clone(),
            id,
        };

        let line = encode_line(&RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        })?;
        self.write_line(&line)
            .await
            .map_err(|e| UsageError::Protocol(format!("send request {method}: {e}")))?;

        let msg = tokio::select! {
            res = rx => match res {
                Ok(msg) => msg,
                // Sender dropped: the reader drained pending on stream end.
                Err(_) => {
                    return Err(UsageError::Protocol(format!(
                        "{method} failed: {}",
                        self.done_err_snapshot()
                    )))
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(UsageError::Cancelled {
                    method: method.to_string(),
                    cause: "deadline exceeded".to_string(),
                });
            }
        };

        if let Some(err) = msg.error {
            return Err(UsageError::Method {
                method: method.to_string(),
                message: err.message,
            });
        }
        Ok(msg.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), UsageError> {
        let line = encode_line(&RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        })?;
        self.write_line(&line)
            .await
            .map_err(|e| UsageError::Protocol(format!("send notification {method}: {e}")))
    }

    async fn write_line(&self, line: &str) -> Result<(), String> {
        let mut slot = self.stdin.lock().await;
        let stdin = slot
            .as_mut()
            .ok_or_else(|| "app-server process not started".to_string())?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        stdin.flush().await.map_err(|e| e.to_string())
    }

    /// Kill the child and wait up to 2 s for the reader to finish reaping.
    async fn close(&self) -> Result<(), UsageError> {
        let done_rx = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.running && inner.child.is_none() {
                return Ok(());
            }
            if let Some(child) = inner.child.as_mut() {
                let _ = child.start_kill();
            }
            inner.done_rx.clone()
        };

        let Some(mut done_rx) = done_rx else {
            return Ok(());
        };
        let result = match tokio::time::timeout(Duration::from_secs(2), done_rx.wait_for(|done| *done)).await
        {
            Ok(_) => Ok(()),
            Err(_) => Err(UsageError::Protocol(
                "timeout waiting for app-server shutdown".to_string(),
            )),
        };
        result
    }

    fn done_err_snapshot(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .done_err
            .clone()
            .unwrap_or_else(|| "app-server exited".to_string())
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<String, UsageError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| UsageError::Protocol(format!("encode request: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Reads stdout line by line, dispatching responses to their pending slots.
/// Messages without an id are notifications; unknown ids are dropped. On
/// stream end, wakes every pending waiter, reaps the child, and signals done.
async fn read_loop(
    inner: Arc<StdMutex<SessionInner>>,
    stdin_slot: Arc<TokioMutex<Option<ChildStdin>>>,
    stdout: ChildStdout,
    done_tx: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let stream_err = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Ok(msg) = serde_json::from_str::<RpcMessage>(&line) else {
                    continue;
                };
                let Some(id) = msg.id else {
                    continue;
                };
                let tx = inner.lock().unwrap().pending.remove(&id);
                if let Some(tx) = tx {
                    let _ = tx.send(msg);
                }
            }
            Ok(None) => break "app-server stream closed".to_string(),
            Err(e) => break format!("read app-server stdout: {e}"),
        }
    };

    debug!(error = %stream_err, "app-server session ended");
    let child = {
        let mut inner = inner.lock().unwrap();
        inner.done_err = Some(stream_err);
        inner.running = false;
        inner.initialized = false;
        // Dropping the senders wakes every in-flight request with an error.
        inner.pending.clear();
        inner.child.take()
    };
    stdin_slot.lock().await.take();
    if let Some(mut child) = child {
        let _ = child.wait().await;
    }
    let _ = done_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn refresh_auth_state_first_fingerprint_no_warning() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let source = AppServerSource::with_fingerprint_fn(Box::new(|| Ok("fp-a".to_string())));

        let warning = rt.block_on(source.refresh_auth_state());
        assert!(warning.is_none());
        assert_eq!(source.stored_fingerprint(), "fp-a");
    }

    #[test]
    fn refresh_auth_state_unchanged_no_warning() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let source = AppServerSource::with_fingerprint_fn(Box::new(|| Ok("fp-a".to_string())));
        source.state.lock().unwrap().auth_fingerprint = "fp-a".to_string();

        let warning = rt.block_on(source.refresh_auth_state());
        assert!(warning.is_none());
        assert_eq!(source.stored_fingerprint(), "fp-a");
    }

    #[test]
    fn refresh_auth_state_change_resets_session_with_warning() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let source = AppServerSource::with_fingerprint_fn(Box::new(|| Ok("fp-b".to_string())));
        source.state.lock().unwrap().auth_fingerprint = "fp-a".to_string();
        source.install_session();

        let warning = rt.block_on(source.refresh_auth_state());
        assert!(warning.is_some());
        assert_eq!(source.stored_fingerprint(), "fp-b");
        assert!(!source.has_session());
    }

    #[test]
    fn refresh_auth_state_error_after_known_fingerprint_warns_and_clears() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let source = AppServerSource::with_fingerprint_fn(Box::new(|| {
            Err(UsageError::Auth("missing auth".to_string()))
        }));
        source.state.lock().unwrap().auth_fingerprint = "fp-a".to_string();
        source.install_session();

        let warning = rt.block_on(source.refresh_auth_state());
        assert!(warning.is_some());
        assert_eq!(source.stored_fingerprint(), "");
        assert!(!source.has_session());
    }

    #[test]
    fn refresh_auth_state_error_without_fingerprint_is_silent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let source = AppServerSource::with_fingerprint_fn(Box::new(|| {
            Err(UsageError::Auth("missing auth".to_string()))
        }));

        let warning = rt.block_on(source.refresh_auth_state());
        assert!(warning.is_none());
    }

    #[test]
    fn rpc_message_decoding() {
        let msg: RpcMessage =
            serde_json::from_str(r#"{"id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(msg.id, Some(3));
        assert!(msg.error.is_none());

        let msg: RpcMessage =
            serde_json::from_str(r#"{"id":4,"error":{"code":-1,"message":"nope"}}"#).unwrap();
        assert_eq!(msg.error.unwrap().message, "nope");

        // Notifications carry no id and are ignored by the dispatcher.
        let msg: RpcMessage =
            serde_json::from_str(r#"{"method":"account/rateLimits/updated"}"#).unwrap();
        assert!(msg.id.is_none());
    }

    #[test]
    fn request_line_is_newline_terminated_json() {
        let line = encode_line(&RpcRequest {
            jsonrpc: "2.0",
            id: Some(1),
            method: "initialize",
            params: json!({}),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 1);
        assert_eq!(value["method"], "initialize");

        let notification = encode_line(&RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: "initialized",
            params: json!({}),
        })
        .unwrap();
        let value: Value = serde_json::from_str(notification.trim_end()).unwrap();
        assert!(value.get("id").is_none());
    }

    /// Script that impersonates the app-server peer for one full fetch:
    /// initialize, initialized notification, rate limits, account read.
    fn write_fake_app_server(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("fake-codex");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "read line").unwrap();
        writeln!(file, "printf '{{\"id\":1,\"result\":{{}}}}\\n'").unwrap();
        writeln!(file, "read line").unwrap();
        writeln!(file, "read line").unwrap();
        writeln!(
            file,
            "printf '{{\"id\":2,\"result\":{{\"rateLimits\":{{\"limitId\":\"codex\",\"planType\":\"pro\",\"primary\":{{\"usedPercent\":20}},\"secondary\":{{\"usedPercent\":50}}}},\"rateLimitsByLimitId\":{{\"codex\":{{}},\"mini\":{{}}}}}}}}\\n'"
        )
        .unwrap();
        writeln!(file, "read line").unwrap();
        writeln!(
            file,
            "printf '{{\"id\":3,\"result\":{{\"account\":{{\"email\":\"a@example.com\"}}}}}}\\n'"
        )
        .unwrap();
        writeln!(file, "cat > /dev/null").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn session_round_trip_against_fake_peer() {
        let tmp = tempfile::tempdir().unwrap();
        let program = write_fake_app_server(tmp.path());
        std::fs::write(
            tmp.path().join("auth.json"),
            r#"{"tokens":{"access_token":"tok"}}"#,
        )
        .unwrap();

        let source = AppServerSource::with_program(
            tmp.path().to_str().unwrap(),
            program.to_str().unwrap(),
        );
        let deadline = Instant::now() + Duration::from_secs(5);

        let summary = source.fetch(deadline).await.unwrap();
        assert_eq!(summary.source, "app-server");
        assert_eq!(summary.plan_type, "pro");
        assert_eq!(summary.primary_window.used_percent, 20);
        assert_eq!(summary.secondary_window.used_percent, 50);
        assert_eq!(summary.account_email, "a@example.com");
        assert_eq!(summary.additional_limit_count, 1);

        source.close().await.unwrap();
    }

    #[tokio::test]
    async fn fetch_fails_cleanly_when_peer_exits_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fake-dead");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        std::fs::write(
            tmp.path().join("auth.json"),
            r#"{"tokens":{"access_token":"tok"}}"#,
        )
        .unwrap();

        let source =
            AppServerSource::with_program(tmp.path().to_str().unwrap(), path.to_str().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = source.fetch(deadline).await.unwrap_err();
        assert!(err.to_string().contains("initialize"), "got: {err}");
        // The session resets itself; closing afterwards is a no-op.
        source.close().await.unwrap();
    }
}
