//! # Tool Registry
//!
//! Named async functions the tool-backed intents call: research, persona
//! management, evaluation, skill application and structural edits. Their
//! business logic lives in the embedding application.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Tool arguments
pub type ToolArgs = Map<String, Value>;

/// One callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, args: ToolArgs, project_id: &str) -> Result<String>;
}

type BoxedToolFn =
    dyn Fn(ToolArgs, String) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync;

/// Adapts an async closure into a [`Tool`]
pub struct FnTool {
    name: String,
    func: Box<BoxedToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(name: &str, func: F) -> Self
    where
        F: Fn(ToolArgs, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            func: Box::new(move |args, project| Box::pin(func(args, project))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: ToolArgs, project_id: &str) -> Result<String> {
        (self.func)(args, project_id.to_string()).await
    }
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Register an async closure under `name`
    pub fn register_fn<F, Fut>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(ToolArgs, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.register(Arc::new(FnTool::new(name, func)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub async fn call(&self, name: &str, args: ToolArgs, project_id: &str) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Tool not registered: {}", name))?;
        tracing::debug!(tool = %name, project_id = %project_id, "Calling tool");
        tool.call(args, project_id).await
    }
}
