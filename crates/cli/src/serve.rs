//! Daemon mode – newline-delimited JSON requests over a Unix socket.
//!
//! Methods: `call` (params are an action descriptor), `doctor`, `commands`.
//! Restore and forget descriptors must also carry `"confirm": true`.

use engine::types::*;
use engine::{Action, AppContext, CommandRegistry, TaskRunner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
pub async fn run_daemon(
    socket_path: PathBuf,
    ctx: Arc<AppContext>,
    registry: CommandRegistry,
    runner: TaskRunner,
    poll: Duration,
) -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    // Remove stale socket if it exists
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("cannot bind socket {}", socket_path.display()))?;

    tracing::info!(socket = %socket_path.display(), "snapctl daemon listening");

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);
        let registry = registry.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let response = handle_request(&line, &ctx, &registry, &runner, poll).await;
                let mut resp_json =
                    serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
                resp_json.push('\n');
                if writer.write_all(resp_json.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(not(unix))]
pub async fn run_daemon(
    socket_path: PathBuf,
    _ctx: Arc<AppContext>,
    _registry: CommandRegistry,
    _runner: TaskRunner,
    _poll: Duration,
) -> anyhow::Result<()> {
    anyhow::bail!(
        "daemon mode needs Unix domain sockets; cannot serve on {}",
        socket_path.display()
    )
}

fn error_response(id: String, code: ErrorCode, message: String) -> DaemonResponse {
    DaemonResponse {
        id,
        result: None,
        error: Some(ErrorInfo {
            code,
            message,
            details: serde_json::Value::Null,
        }),
    }
}

/// Takes the `confirm` flag off a call's params. Returns the refusal message
/// when the descriptor is destructive and was not confirmed.
fn take_confirmation(params: &mut serde_json::Value) -> Result<(), String> {
    let confirmed = params
        .as_object_mut()
        .and_then(|obj| obj.remove("confirm"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    match Action::from_json(params.clone()) {
        Ok(action) if action.is_destructive() && !confirmed => Err(format!(
            "{} needs \"confirm\": true",
            action.name()
        )),
        _ => Ok(()),
    }
}

pub(crate) async fn handle_request(
    line: &str,
    ctx: &Arc<AppContext>,
    registry: &CommandRegistry,
    runner: &TaskRunner,
    poll: Duration,
) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                "unknown".into(),
                ErrorCode::InvalidInput,
                format!("invalid JSON request: {}", e),
            );
        }
    };

    let result = match req.method.as_str() {
        "call" => {
            let mut params = req.params;
            if let Err(message) = take_confirmation(&mut params) {
                return error_response(req.id, ErrorCode::InvalidInput, message);
            }
            let handle = registry.submit(runner, params, Arc::clone(ctx));
            handle.wait(poll).await;
            let output = handle.drain_output();
            match handle.into_result() {
                Ok(mut r) => {
                    r.output = output;
                    r
                }
                Err(e) => return error_response(req.id, ErrorCode::InternalError, e.to_string()),
            }
        }
        "doctor" => {
            let ctx = Arc::clone(ctx);
            match tokio::task::spawn_blocking(move || engine::doctor::run_doctor(&ctx)).await {
                Ok(r) => r,
                Err(e) => return error_response(req.id, ErrorCode::InternalError, e.to_string()),
            }
        }
        "commands" => {
            let mut r = result_ok("commands", "registry", &new_run_id(), 0);
            r.data = Some(serde_json::json!({ "commands": registry.list() }));
            r
        }
        other => {
            return error_response(
                req.id,
                ErrorCode::InvalidInput,
                format!("unknown method: {}", other),
            );
        }
    };

    DaemonResponse {
        id: req.id,
        result: Some(result),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn request(line: &str) -> DaemonResponse {
        let ctx = Arc::new(AppContext::default_platform(Default::default()));
        let runner = TaskRunner::current().unwrap();
        handle_request(
            line,
            &ctx,
            &CommandRegistry::new(),
            &runner,
            Duration::from_millis(5),
        )
        .await
    }

    #[tokio::test]
    async fn test_commands_method_lists_registry() {
        let resp = request(r#"{"id":"1","method":"commands"}"#).await;
        assert_eq!(resp.id, "1");
        let data = resp.result.unwrap().data.unwrap();
        let names: Vec<&str> = data["commands"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(names.contains(&"list"));
        assert!(names.contains(&"check-binary"));
    }

    #[tokio::test]
    async fn test_call_without_repository_reports_not_configured() {
        let resp = request(r#"{"id":"2","method":"call","params":{"action":"list"}}"#).await;
        let r = resp.result.unwrap();
        assert_eq!(r.status, Status::Error);
        assert_eq!(r.error.unwrap().code, ErrorCode::NotConfigured);
    }

    #[tokio::test]
    async fn test_unconfirmed_forget_is_refused() {
        let resp =
            request(r#"{"id":"4","method":"call","params":{"action":"forget","snapshot":"a2103ca8"}}"#)
                .await;
        assert_eq!(resp.id, "4");
        assert!(resp.result.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("confirm"));
    }

    #[tokio::test]
    async fn test_confirmed_forget_reaches_registry() {
        let resp = request(
            r#"{"id":"5","method":"call","params":{"action":"forget","snapshot":"a2103ca8","confirm":true}}"#,
        )
        .await;
        // No repository in the default context, so the registry answers.
        let r = resp.result.unwrap();
        assert_eq!(r.error.unwrap().code, ErrorCode::NotConfigured);
    }

    #[test]
    fn test_confirm_flag_removed_from_descriptor() {
        let mut params = serde_json::json!({"action": "list", "confirm": false});
        assert!(take_confirmation(&mut params).is_ok());
        assert!(params.get("confirm").is_none());

        let mut params = serde_json::json!({"action": "restore", "snapshot": "a", "target": "/tmp/out", "confirm": "yes"});
        assert!(take_confirmation(&mut params).is_err());
    }

    #[tokio::test]
    async fn test_malformed_request_and_unknown_method() {
        let resp = request("not json").await;
        assert_eq!(resp.id, "unknown");
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidInput);

        let resp = request(r#"{"id":"3","method":"restart"}"#).await;
        assert_eq!(resp.id, "3");
        assert!(resp.error.unwrap().message.contains("restart"));
    }
}
