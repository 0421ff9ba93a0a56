//! Registries mapping definition names to activity and workflow handlers.
//!
//! Activities are registered together with a [`RetryPolicy`]; typed variants
//! validate payloads at the activity boundary, so a malformed input is a
//! permanent failure of that activity rather than a crash.

use super::WorkflowHandler;
use crate::{ActivityError, WorkflowContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Retry policy applied by the activity executor. Only transient errors
/// consume attempts; a permanent error fails immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 means no retries.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_initial_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff delay before the next attempt, where `attempt` is the number
    /// of attempts already made (1 after the first failure).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = (self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exp as i32)) as u64;
        std::time::Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

#[derive(Clone)]
pub(crate) struct ActivityEntry {
    pub handler: Arc<dyn ActivityHandler>,
    pub policy: RetryPolicy,
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, ActivityEntry>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    pub(crate) fn get(&self, name: &str) -> Option<ActivityEntry> {
        self.inner.get(name).cloned()
    }

    pub fn list_activity_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, ActivityEntry>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.register_with_policy(name, RetryPolicy::default(), f)
    }

    pub fn register_with_policy<F, Fut>(mut self, name: impl Into<String>, policy: RetryPolicy, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(
            name.into(),
            ActivityEntry {
                handler: Arc::new(FnActivity(f)),
                policy,
            },
        );
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        self.register_typed_with_policy(name, RetryPolicy::default(), f)
    }

    pub fn register_typed_with_policy<In, Out, F, Fut>(self, name: impl Into<String>, policy: RetryPolicy, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f = f.clone();
            async move {
                // Schema validation at the boundary: malformed input never
                // reaches the handler and is never retried.
                let input: In = crate::codec::decode(&input_s)
                    .map_err(|e| ActivityError::permanent(format!("invalid input: {e}")))?;
                let out: Out = (f)(input).await?;
                crate::codec::encode(&out).map_err(|e| ActivityError::permanent(format!("encode output: {e}")))
            }
        };
        self.register_with_policy(name, policy, wrapper)
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}

// ---------------- Workflow registry

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn list_workflow_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<dyn WorkflowHandler>>,
    errors: Vec<String>,
}

impl WorkflowRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        use super::FnWorkflow;
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate workflow registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnWorkflow(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: WorkflowContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::codec::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<WorkflowRegistry, String> {
        if self.errors.is_empty() {
            Ok(WorkflowRegistry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}
