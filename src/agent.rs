use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs as async_fs;
use tracing::{info, warn};

use crate::registry::ActionRegistry;

// ========================= Core Types =========================

/// A natural-language goal plus the loop's step budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    pub step_budget: usize,
    pub validate_output: bool,
}

impl Task {
    pub fn new(description: impl Into<String>, step_budget: usize) -> Self {
        Self {
            description: description.into(),
            step_budget,
            validate_output: false,
        }
    }

    pub fn with_validation(mut self) -> Self {
        self.validate_output = true;
        self
    }
}

/// Normalized outcome of one action invocation. Handlers never raise past
/// the dispatch boundary; whatever happens inside becomes one of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionResult {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extracted_content: Option<String>,
        #[serde(default)]
        include_in_memory: bool,
    },
    Failure { error: String },
}

impl ActionResult {
    pub fn ok() -> Self {
        Self::Success { extracted_content: None, include_in_memory: false }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::Success { extracted_content: Some(text.into()), include_in_memory: false }
    }

    /// Content the planner should keep seeing in full on every later step.
    pub fn retained(text: impl Into<String>) -> Self {
        Self::Success { extracted_content: Some(text.into()), include_in_memory: true }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure { error: error.into() }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// One (action, arguments, result) entry in a run's append-only history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub action: String,
    pub args: Value,
    pub result: ActionResult,
}

/// Longest argument string carried verbatim into a past step's view.
const ARG_PREVIEW_CHARS: usize = 120;

impl StepRecord {
    /// The condensed form handed to the planner. Retained steps ride in
    /// full; for everything else the result collapses to a one-line note
    /// and long argument values are elided, so planner input stays bounded
    /// as history grows.
    pub fn view(&self) -> StepView {
        let retained =
            matches!(&self.result, ActionResult::Success { include_in_memory: true, .. });
        let note = match &self.result {
            ActionResult::Success { extracted_content: Some(text), include_in_memory: true } => {
                text.clone()
            }
            ActionResult::Success { extracted_content: Some(text), include_in_memory: false } => {
                format!("ok ({} chars extracted)", text.len())
            }
            ActionResult::Success { extracted_content: None, .. } => "ok".to_string(),
            ActionResult::Failure { error } => format!("error: {}", error),
        };
        let args = if retained { self.args.clone() } else { condense_args(&self.args) };
        StepView { action: self.action.clone(), args, note }
    }
}

/// Recursively elide long string values so a large payload (a full report,
/// a page of code examples) does not ride in every later planner prompt.
fn condense_args(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > ARG_PREVIEW_CHARS => {
            let preview: String = s.chars().take(ARG_PREVIEW_CHARS).collect();
            Value::String(format!("{}... ({} chars)", preview, s.chars().count()))
        }
        Value::Array(items) => Value::Array(items.iter().map(condense_args).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), condense_args(v))).collect())
        }
        other => other.clone(),
    }
}

/// What the planner sees of a past step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepView {
    pub action: String,
    pub args: Value,
    pub note: String,
}

/// The planner's verdict for the next iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Act {
        action: String,
        #[serde(default)]
        args: Value,
    },
    Finish { report: String },
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("planner error: {0}")]
    Planner(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("corrupt document {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("duplicate action registered: {0}")]
    DuplicateAction(String),
    #[error("other error: {0}")]
    Other(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Incomplete,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RunMetrics {
    pub steps: usize,
    pub time_ms: u128,
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: Task,
    pub status: RunStatus,
    pub report: Option<String>,
    pub metrics: RunMetrics,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    /// Integration exit code: 0 completed, 2 budget exhausted. Fatal errors
    /// never produce a report; integrations map those to 1.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Incomplete => 2,
        }
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &Task, history: &[StepView]) -> Result<Decision, AgentError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self { accepted: true, reason: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self { accepted: false, reason: Some(reason.into()) }
    }
}

/// Secondary check a proposed final report must clear before the run counts
/// as completed, typically by re-querying the browser for observable state.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, task: &Task, report: &str) -> Result<Verdict, AgentError>;
}

/// Sink for run history as it happens.
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn write_run_start(&self, run_id: &str, task: &Task) -> Result<(), AgentError>;
    async fn write_step(&self, run_id: &str, step: &StepRecord) -> Result<(), AgentError>;
    async fn write_run_end(&self, run_id: &str, report: &RunReport) -> Result<(), AgentError>;
}

// ========================= Agent Core =========================

/// When the validation gate applies to a "finish" proposal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValidationPolicy {
    Never,
    #[default]
    TaskRequested,
    Always,
}

#[derive(Clone, Default)]
pub struct AgentConfig {
    pub validation: ValidationPolicy,
}

/// Cooperative cancellation: stops issuing planner calls; the in-flight
/// action is left to finish or fail on its own.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Agent<P: Planner> {
    planner: P,
    registry: Arc<ActionRegistry>,
    validator: Option<Arc<dyn Validator>>,
    sink: Arc<dyn RunSink>,
    cfg: AgentConfig,
    cancel: CancelHandle,
}

impl<P: Planner> Agent<P> {
    pub fn new(planner: P, registry: Arc<ActionRegistry>) -> Self {
        Self {
            planner,
            registry,
            validator: None,
            sink: Arc::new(NullRunSink),
            cfg: AgentConfig::default(),
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_config(mut self, cfg: AgentConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_run_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drive the plan -> dispatch -> observe cycle up to `task.step_budget`
    /// iterations. Unknown actions, bad arguments, and handler faults all
    /// come back to the planner as failure records; only an unusable
    /// planner or a validator transport fault aborts the run.
    pub async fn run(&self, task: &Task) -> Result<RunReport, AgentError> {
        let run_id = nanoid!();
        let start = Instant::now();
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut views: Vec<StepView> = Vec::new();

        self.sink.write_run_start(&run_id, task).await?;
        info!(run_id = %run_id, budget = task.step_budget, "run started");

        for i in 0..task.step_budget {
            if self.cancel.is_cancelled() {
                info!(run_id = %run_id, step = i, "run cancelled");
                return self.finish(&run_id, task, steps, start, RunStatus::Incomplete, None).await;
            }

            match self.planner.plan(task, &views).await? {
                Decision::Finish { report } => {
                    if let Some(reason) = self.gate(task, &report).await? {
                        warn!(step = i, %reason, "final report rejected, resuming");
                        let record = StepRecord {
                            step: i,
                            action: "finish".to_string(),
                            args: serde_json::json!({ "report": report }),
                            result: ActionResult::failure(format!("validation failed: {}", reason)),
                        };
                        self.sink.write_step(&run_id, &record).await?;
                        views.push(record.view());
                        steps.push(record);
                        continue;
                    }
                    info!(step = i, "task reported complete");
                    return self
                        .finish(&run_id, task, steps, start, RunStatus::Completed, Some(report))
                        .await;
                }
                Decision::Act { action, args } => {
                    info!(step = i, action = %action, "dispatching action");
                    let result = self.registry.dispatch(&action, args.clone()).await;
                    if let ActionResult::Failure { error } = &result {
                        warn!(step = i, action = %action, %error, "action failed");
                    }
                    let record = StepRecord { step: i, action, args, result };
                    self.sink.write_step(&run_id, &record).await?;
                    views.push(record.view());
                    steps.push(record);
                }
            }
        }

        self.finish(&run_id, task, steps, start, RunStatus::Incomplete, None).await
    }

    /// Returns the rejection reason when the gate applies and fails, `None`
    /// when the report may be accepted.
    async fn gate(&self, task: &Task, report: &str) -> Result<Option<String>, AgentError> {
        let applies = match self.cfg.validation {
            ValidationPolicy::Never => false,
            ValidationPolicy::TaskRequested => task.validate_output,
            ValidationPolicy::Always => true,
        };
        if !applies {
            return Ok(None);
        }
        let Some(validator) = &self.validator else {
            return Ok(None);
        };
        let verdict = validator.validate(task, report).await?;
        if verdict.accepted {
            Ok(None)
        } else {
            Ok(Some(verdict.reason.unwrap_or_else(|| "final output rejected".to_string())))
        }
    }

    async fn finish(
        &self,
        run_id: &str,
        task: &Task,
        steps: Vec<StepRecord>,
        start: Instant,
        status: RunStatus,
        report: Option<String>,
    ) -> Result<RunReport, AgentError> {
        let metrics = RunMetrics {
            steps: steps.len(),
            time_ms: start.elapsed().as_millis(),
            success: status == RunStatus::Completed,
        };
        let report = RunReport {
            run_id: run_id.to_string(),
            task: task.clone(),
            status,
            report,
            metrics,
            steps,
        };
        self.sink.write_run_end(run_id, &report).await?;
        info!(run_id = %report.run_id, status = ?report.status, steps = report.metrics.steps, "run finished");
        Ok(report)
    }
}

// ========================= Defaults & Helpers =========================

pub struct NullRunSink;

#[async_trait]
impl RunSink for NullRunSink {
    async fn write_run_start(&self, _run_id: &str, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_step(&self, _run_id: &str, _step: &StepRecord) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_run_end(&self, _run_id: &str, _report: &RunReport) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Persists each run under `<base>/<run_id>/`: the task, one file per step,
/// and the final report.
pub struct JsonRunSink {
    base_dir: PathBuf,
}

impl JsonRunSink {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    async fn write_json<T: Serialize + Sync>(
        &self,
        run_id: &str,
        name: &str,
        body: &T,
    ) -> Result<(), AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Store(format!("create_dir: {}", e)))?;
        let body = serde_json::to_vec_pretty(body).map_err(|e| AgentError::Store(e.to_string()))?;
        async_fs::write(dir.join(name), body)
            .await
            .map_err(|e| AgentError::Store(format!("write: {}", e)))
    }
}

#[async_trait]
impl RunSink for JsonRunSink {
    async fn write_run_start(&self, run_id: &str, task: &Task) -> Result<(), AgentError> {
        self.write_json(run_id, "task.json", task).await
    }

    async fn write_step(&self, run_id: &str, step: &StepRecord) -> Result<(), AgentError> {
        self.write_json(run_id, &format!("step_{:03}.json", step.step), step).await
    }

    async fn write_run_end(&self, run_id: &str, report: &RunReport) -> Result<(), AgentError> {
        self.write_json(run_id, "report.json", report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_content_rides_in_full() {
        let record = StepRecord {
            step: 0,
            action: "read_resume".into(),
            args: Value::Null,
            result: ActionResult::retained("ten years of herding compilers"),
        };
        assert_eq!(record.view().note, "ten years of herding compilers");
    }

    #[test]
    fn unretained_content_collapses_to_a_summary() {
        let record = StepRecord {
            step: 0,
            action: "extract_page".into(),
            args: Value::Null,
            result: ActionResult::content("x".repeat(5000)),
        };
        assert_eq!(record.view().note, "ok (5000 chars extracted)");
    }

    #[test]
    fn large_args_are_elided_from_the_view() {
        let record = StepRecord {
            step: 0,
            action: "save_report".into(),
            args: serde_json::json!({ "content": "x".repeat(5000) }),
            result: ActionResult::content("Saved report to report.md"),
        };
        let view = record.view();
        let content = view.args["content"].as_str().unwrap();
        assert!(content.len() < 200);
        assert!(content.ends_with("(5000 chars)"));
    }

    #[test]
    fn nested_args_are_elided_too() {
        let record = StepRecord {
            step: 0,
            action: "add_doc_entry".into(),
            args: serde_json::json!({
                "framework": "tokio",
                "code_examples": [{ "code": "y".repeat(1000) }]
            }),
            result: ActionResult::content("Saved documentation for tokio / select"),
        };
        let view = record.view();
        assert_eq!(view.args["framework"], "tokio");
        let code = view.args["code_examples"][0]["code"].as_str().unwrap();
        assert!(code.len() < 200);
    }

    #[test]
    fn retained_steps_keep_their_args_in_full() {
        let args = serde_json::json!({ "content": "z".repeat(500) });
        let record = StepRecord {
            step: 0,
            action: "load_calendar".into(),
            args: args.clone(),
            result: ActionResult::retained("{ \"records\": [] }"),
        };
        assert_eq!(record.view().args, args);
    }

    #[test]
    fn failure_note_carries_the_error() {
        let record = StepRecord {
            step: 3,
            action: "navigate".into(),
            args: serde_json::json!({ "url": "https://example.com" }),
            result: ActionResult::failure("connection refused"),
        };
        assert_eq!(record.view().note, "error: connection refused");
    }

    #[test]
    fn exit_codes_distinguish_termination_states() {
        let mut report = RunReport {
            run_id: "r".into(),
            task: Task::new("t", 1),
            status: RunStatus::Completed,
            report: None,
            metrics: RunMetrics::default(),
            steps: vec![],
        };
        assert_eq!(report.exit_code(), 0);
        report.status = RunStatus::Incomplete;
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn decision_decodes_from_planner_json() {
        let act: Decision =
            serde_json::from_str(r#"{"type":"act","action":"navigate","args":{"url":"https://a"}}"#)
                .unwrap();
        assert!(matches!(act, Decision::Act { ref action, .. } if action == "navigate"));

        let fin: Decision = serde_json::from_str(r#"{"type":"finish","report":"done"}"#).unwrap();
        assert!(matches!(fin, Decision::Finish { ref report } if report == "done"));
    }
}
