//! Scenario runner – execute scripted action flows from YAML files.

use crate::commands::CommandRegistry;
use crate::context::AppContext;
use crate::tasks::TaskRunner;
use crate::types::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Load a scenario from a YAML string.
pub fn load_scenario(yaml: &str) -> Result<Scenario, String> {
    serde_yaml::from_str(yaml).map_err(|e| format!("failed to parse scenario YAML: {}", e))
}

/// Execute a scenario step by step on the task runner and return the
/// overall result. A step running past its `timeout_ms` is cancelled and
/// reported as a `TIMEOUT` error.
pub async fn run_scenario(
    scenario: &Scenario,
    ctx: Arc<AppContext>,
    registry: &CommandRegistry,
    runner: &TaskRunner,
    poll_interval: Duration,
) -> ScenarioResult {
    let mut step_results = Vec::new();
    let mut overall = Status::Pass;

    for (i, step) in scenario.steps.iter().enumerate() {
        let descriptor = serde_json::Value::Object(step.descriptor.clone());
        let handle = registry.submit(runner, descriptor, Arc::clone(&ctx));
        let start = Instant::now();
        let timeout = Duration::from_millis(step.timeout_ms);

        let mut output = Vec::new();
        while !handle.is_done() && start.elapsed() < timeout {
            output.extend(handle.drain_output());
            tokio::time::sleep(poll_interval).await;
        }
        output.extend(handle.drain_output());

        let mut r = match handle.try_result() {
            Some(Ok(r)) => r,
            Some(Err(e)) => result_err(
                "call",
                e.action(),
                &new_run_id(),
                start.elapsed().as_millis() as u64,
                ErrorCode::InternalError,
                e.to_string(),
            ),
            None => {
                handle.cancel();
                tracing::warn!(step = i, timeout_ms = step.timeout_ms, "scenario step timed out");
                result_err(
                    "call",
                    handle.label(),
                    &new_run_id(),
                    start.elapsed().as_millis() as u64,
                    ErrorCode::Timeout,
                    format!("step exceeded {} ms", step.timeout_ms),
                )
            }
        };
        r.output = output;

        if r.status != step.expect_status {
            tracing::warn!(
                step = i,
                expected = step.expect_status.as_str(),
                actual = r.status.as_str(),
                "scenario step status mismatch"
            );
            overall = Status::Fail;
        }
        step_results.push(r);
    }

    ScenarioResult {
        name: scenario.name.clone(),
        overall_status: overall,
        step_results,
    }
}
