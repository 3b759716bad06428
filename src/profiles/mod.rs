//! Profile collaborator seam.
//!
//! A profile is a named bundle of tools behind a uniform call interface.
//! Handlers receive the tenant's environment map on every call; they must
//! not cache it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

mod math;
mod time;

pub use math::MathProfile;
pub use time::TimeProfile;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

/// One tool descriptor as advertised by `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[async_trait]
pub trait Profile: Send + Sync {
    fn id(&self) -> &str;

    fn tools(&self) -> Vec<ToolSpec>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        env: &HashMap<String, String>,
    ) -> Result<String, ProfileError>;
}

/// Registry of available profiles, constructed at startup and handed to the
/// gateway. No module-level globals.
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<dyn Profile>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    /// Registry with the built-in profiles.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TimeProfile));
        registry.register(Arc::new(MathProfile));
        registry
    }

    pub fn register(&mut self, profile: Arc<dyn Profile>) {
        self.profiles.insert(profile.id().to_string(), profile);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Profile>> {
        self.profiles.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}
