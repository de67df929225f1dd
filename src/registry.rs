use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::agent::{ActionResult, AgentError};
use crate::browser::BrowserDriver;

type Handler = Arc<
    dyn Fn(Value, Option<Arc<dyn BrowserDriver>>) -> BoxFuture<'static, Result<ActionResult, AgentError>>
        + Send
        + Sync,
>;

/// A named, schema-typed unit of capability the loop can invoke.
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub params_schema: Option<Value>,
    pub needs_browser: bool,
    handler: Handler,
}

/// The catalog entry surfaced to the planner for one action.
#[derive(Clone, Debug, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Parameter type for actions that take no arguments.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoParams {}

/// Mapping from action name to handler. Built once at startup, read-only
/// afterwards; passed by reference into the agent loop rather than living
/// as a process-global.
pub struct ActionRegistry {
    actions: HashMap<String, ActionSpec>,
    order: Vec<String>,
    browser: Option<Arc<dyn BrowserDriver>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self { actions: HashMap::new(), order: Vec::new(), browser: None }
    }

    /// A registry whose browser-bound actions run against `driver`. Share
    /// one session across agents by handing each registry the same
    /// `SharedDriver` clone.
    pub fn with_browser(driver: Arc<dyn BrowserDriver>) -> Self {
        Self { actions: HashMap::new(), order: Vec::new(), browser: Some(driver) }
    }

    /// Register an action whose handler takes a typed parameter struct.
    /// Duplicate names are a startup-time programming error.
    pub fn register<P, F, Fut>(&mut self, name: &str, description: &str, f: F) -> Result<(), AgentError>
    where
        P: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, AgentError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |raw, _driver| {
            let f = f.clone();
            Box::pin(async move {
                let params: P = decode(raw)?;
                f(params).await
            })
        });
        self.insert(ActionSpec {
            name: name.to_string(),
            description: description.to_string(),
            params_schema: Some(schema_value::<P>()),
            needs_browser: false,
            handler,
        })
    }

    /// Register an action whose handler also receives the browser handle.
    pub fn register_with_browser<P, F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        f: F,
    ) -> Result<(), AgentError>
    where
        P: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(P, Arc<dyn BrowserDriver>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, AgentError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |raw, driver| {
            let f = f.clone();
            Box::pin(async move {
                let driver = driver.ok_or_else(|| {
                    AgentError::Browser("no browser session attached to the registry".to_string())
                })?;
                let params: P = decode(raw)?;
                f(params, driver).await
            })
        });
        self.insert(ActionSpec {
            name: name.to_string(),
            description: description.to_string(),
            params_schema: Some(schema_value::<P>()),
            needs_browser: true,
            handler,
        })
    }

    fn insert(&mut self, spec: ActionSpec) -> Result<(), AgentError> {
        if self.actions.contains_key(&spec.name) {
            return Err(AgentError::DuplicateAction(spec.name));
        }
        self.order.push(spec.name.clone());
        self.actions.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Look up, decode, and run. Unknown names, undecodable arguments, and
    /// handler faults all normalize to a failure result; nothing raises
    /// past this boundary.
    pub async fn dispatch(&self, name: &str, args: Value) -> ActionResult {
        let Some(spec) = self.actions.get(name) else {
            return ActionResult::failure(AgentError::UnknownAction(name.to_string()).to_string());
        };
        debug!(action = %name, "dispatch");
        let args = if args.is_null() { Value::Object(Default::default()) } else { args };
        let driver = if spec.needs_browser { self.browser.clone() } else { None };
        match (spec.handler)(args, driver).await {
            Ok(result) => result,
            Err(err) => ActionResult::failure(err.to_string()),
        }
    }

    /// Catalog in registration order, for the planner prompt.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.order
            .iter()
            .filter_map(|name| self.actions.get(name))
            .map(|spec| CatalogEntry {
                name: spec.name.clone(),
                description: spec.description.clone(),
                params: spec.params_schema.clone(),
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

fn decode<P: DeserializeOwned>(raw: Value) -> Result<P, AgentError> {
    serde_json::from_value(raw).map_err(|e| AgentError::InvalidArguments(e.to_string()))
}

fn schema_value<P: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(P)).unwrap_or(Value::Null)
}
