//! Scripted fakes shared by the unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{BinaryConfig, EngineConfig};
use crate::context::AppContext;
use crate::traits::*;

/// Engine stand-in answering by subcommand (first argument).
#[derive(Clone, Default)]
pub struct FakeProcess {
    pub binary: Option<PathBuf>,
    responses: Arc<Mutex<HashMap<String, ProcessOutput>>>,
    pub calls: Arc<Mutex<Vec<Invocation>>>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self {
            binary: Some(PathBuf::from("/usr/bin/restic")),
            ..Default::default()
        }
    }

    pub fn without_binary() -> Self {
        Self::default()
    }

    pub fn respond(self, subcommand: &str, exit_code: i32, stdout: &str) -> Self {
        self.responses.lock().unwrap().insert(
            subcommand.to_string(),
            ProcessOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
        self
    }

    /// Subcommands invoked so far, in order.
    pub fn subcommands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.args.first().cloned().unwrap_or_default())
            .collect()
    }

    pub fn last_call(&self, subcommand: &str) -> Option<Invocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|inv| inv.args.first().map(String::as_str) == Some(subcommand))
            .cloned()
    }

    fn answer(&self, inv: &Invocation) -> ProcessOutput {
        self.calls.lock().unwrap().push(inv.clone());
        let sub = inv.args.first().cloned().unwrap_or_default();
        self.responses
            .lock()
            .unwrap()
            .get(&sub)
            .cloned()
            .unwrap_or(ProcessOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("unexpected subcommand {}", sub),
            })
    }
}

impl ProcessOps for FakeProcess {
    fn locate_binary(&self, _cfg: &BinaryConfig) -> Option<PathBuf> {
        self.binary.clone()
    }

    fn run(&self, inv: &Invocation) -> CapResult<ProcessOutput> {
        Ok(self.answer(inv))
    }

    fn run_streaming(
        &self,
        inv: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> CapResult<ProcessOutput> {
        let out = self.answer(inv);
        for line in out.stdout.lines() {
            on_line(line);
        }
        Ok(out)
    }

    fn spawn_lines(&self, inv: &Invocation) -> CapResult<LineStream> {
        let out = self.answer(inv);
        let lines: Vec<String> = out.stdout.lines().map(String::from).collect();
        Ok(Box::new(lines.into_iter()))
    }
}

pub struct NullTransport;

#[async_trait::async_trait]
impl MetricsTransport for NullTransport {
    async fn push(&self, _url: &str, _auth: Option<(String, String)>, _body: String) -> CapResult<u16> {
        Ok(200)
    }
}

pub fn configured() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.repo.repository = Some("rest:https://user:pw@backup.example.com/repo".into());
    cfg.repo.password = Some("hunter2".into());
    cfg.backup.paths = vec![PathBuf::from("/home/alice")];
    cfg
}

pub fn context(fake: &FakeProcess, config: EngineConfig) -> AppContext {
    AppContext::new(Box::new(fake.clone()), Box::new(NullTransport), config)
}

/// `snapshots --json` body with one snapshot taken `age_secs` ago.
pub fn snapshots_json(age_secs: i64) -> String {
    let t = chrono::Utc::now() - chrono::TimeDelta::seconds(age_secs);
    format!(
        r#"[{{"id":"a2103ca811e8b081","short_id":"a2103ca8","time":"{}","hostname":"ws01","username":"alice"}}]"#,
        t.to_rfc3339()
    )
}
