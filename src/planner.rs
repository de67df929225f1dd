use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::env;
use std::sync::Mutex;

use crate::agent::{AgentError, Decision, Planner, StepView, Task};
use crate::registry::CatalogEntry;

#[derive(Clone)]
pub struct PlannerConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,  // env LLM_API_KEY
    pub model: String,
    pub temperature: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            temperature: 0.2,
        }
    }
}

/// Chat-completions-backed planner. One request per loop iteration: the
/// action catalog rides in the system prompt, the task and condensed
/// history in the user message, and the reply must be a single Decision
/// JSON object. Transport retry/backoff is left to the integration.
pub struct HttpPlanner {
    http: Client,
    cfg: PlannerConfig,
    catalog: Vec<CatalogEntry>,
}

impl HttpPlanner {
    pub fn new(cfg: PlannerConfig, catalog: Vec<CatalogEntry>) -> Result<Self, AgentError> {
        if cfg.api_key.is_empty() {
            return Err(AgentError::Planner("LLM_API_KEY missing".into()));
        }
        Ok(Self { http: Client::new(), cfg, catalog })
    }

    fn system_prompt(&self) -> String {
        let catalog = serde_json::to_string_pretty(&self.catalog).unwrap_or_else(|_| "[]".into());
        format!(
            "You drive a web browser to complete a task, one step at a time.\n\
             Reply with a single JSON object and nothing else.\n\
             To run an action: {{\"type\":\"act\",\"action\":\"<name>\",\"args\":{{...}}}}\n\
             When the task is done: {{\"type\":\"finish\",\"report\":\"<final report>\"}}\n\
             If a step failed, read the error and try a corrected step.\n\n\
             Available actions:\n{}",
            catalog
        )
    }

    fn history_block(history: &[StepView]) -> String {
        if history.is_empty() {
            return "No steps taken yet.".to_string();
        }
        let mut block = String::from("Steps so far:\n");
        for (i, step) in history.iter().enumerate() {
            let args = serde_json::to_string(&step.args).unwrap_or_else(|_| "{}".into());
            block.push_str(&format!("{}. {}({}) -> {}\n", i + 1, step.action, args, step.note));
        }
        block
    }

    fn decode_decision(text: &str) -> Result<Decision, AgentError> {
        let trimmed = strip_fences(text);
        serde_json::from_str(trimmed)
            .map_err(|e| AgentError::Planner(format!("undecodable decision ({}): {}", e, trimmed)))
    }
}

/// Models love to wrap JSON in markdown fences.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end_matches('`').trim()
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, task: &Task, history: &[StepView]) -> Result<Decision, AgentError> {
        let url = format!("{}/chat/completions", self.cfg.api_base);
        let req = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "messages": [
                { "role": "system", "content": self.system_prompt() },
                { "role": "user",
                  "content": format!("Task: {}\n\n{}", task.description, Self::history_block(history)) }
            ]
        });

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| AgentError::Planner(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| AgentError::Planner(e.to_string()))?;
        if !status.is_success() {
            return Err(AgentError::Planner(format!("planner endpoint {}: {}", status, text)));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::Planner(format!("bad response json: {}", e)))?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Planner("response missing message content".into()))?;
        Self::decode_decision(content)
    }
}

// ========================= Scripted Planner =========================

/// Deterministic planner for tests and offline dry runs: pops decisions
/// from a queue, then keeps returning the fallback if one is set.
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<Decision>>,
    fallback: Option<Decision>,
}

impl ScriptedPlanner {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self { script: Mutex::new(decisions.into_iter().collect()), fallback: None }
    }

    /// Returned once the scripted decisions run out, forever.
    pub fn with_fallback(mut self, decision: Decision) -> Self {
        self.fallback = Some(decision);
        self
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _task: &Task, _history: &[StepView]) -> Result<Decision, AgentError> {
        let mut script = self.script.lock().map_err(|e| AgentError::Planner(e.to_string()))?;
        match script.pop_front() {
            Some(decision) => Ok(decision),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| AgentError::Planner("scripted planner exhausted".into())),
        }
    }
}
