//! Handler registry and concurrent fan-out.

use crate::{DispatchError, DispatchResult, HandlerFailure, HandlerPattern};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use outbox_store::OutboxEvent;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Boxed async handler.
///
/// Handlers must be idempotent with respect to `event.id`; delivery is at
/// least once.
pub type HandlerFn =
    Arc<dyn Fn(Arc<OutboxEvent>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Execution settings for matched handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Run matched handlers concurrently. When false they run one after
    /// another in registration order.
    pub parallel: bool,
    /// Upper bound for one handler invocation.
    pub handler_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a dispatch where every matched handler succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub event_id: String,
    pub handlers_run: usize,
    pub duration_ms: u64,
}

#[derive(Clone)]
struct RegisteredHandler {
    name: String,
    pattern: HandlerPattern,
    handler: HandlerFn,
}

#[derive(Default)]
struct Registry {
    /// Registration order is preserved for sequential execution.
    entries: Vec<RegisteredHandler>,
    next_id: u64,
}

/// Routes outbox events to registered handlers.
#[derive(Clone)]
pub struct EventDispatcher {
    config: DispatcherConfig,
    registry: Arc<RwLock<Registry>>,
}

impl EventDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Register a handler under a generated name (`<pattern>#<n>`).
    ///
    /// Returns the generated name.
    pub async fn register<F, Fut>(&self, pattern: &str, handler: F) -> DispatchResult<String>
    where
        F: Fn(Arc<OutboxEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = HandlerPattern::parse(pattern)?;
        let mut registry = self.registry.write().await;
        registry.next_id += 1;
        let name = format!("{}#{}", pattern, registry.next_id);
        Self::insert(&mut registry, name.clone(), pattern, boxed(handler));
        Ok(name)
    }

    /// Register a handler with an explicit name. Names must be unique.
    pub async fn register_named<F, Fut>(
        &self,
        pattern: &str,
        name: &str,
        handler: F,
    ) -> DispatchResult<()>
    where
        F: Fn(Arc<OutboxEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = HandlerPattern::parse(pattern)?;
        let mut registry = self.registry.write().await;
        if registry.entries.iter().any(|entry| entry.name == name) {
            return Err(DispatchError::DuplicateHandler(name.to_string()));
        }
        Self::insert(&mut registry, name.to_string(), pattern, boxed(handler));
        Ok(())
    }

    fn insert(registry: &mut Registry, name: String, pattern: HandlerPattern, handler: HandlerFn) {
        debug!(handler = %name, pattern = %pattern, "Registered event handler");
        registry.entries.push(RegisteredHandler {
            name,
            pattern,
            handler,
        });
    }

    /// Remove every handler registered under `pattern`. Returns how many were removed.
    pub async fn unregister(&self, pattern: &str) -> usize {
        let Ok(pattern) = HandlerPattern::parse(pattern) else {
            return 0;
        };
        let mut registry = self.registry.write().await;
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.pattern != pattern);
        let removed = before - registry.entries.len();
        if removed > 0 {
            debug!(pattern = %pattern, removed, "Unregistered event handlers");
        }
        removed
    }

    /// Distinct registered patterns, sorted. Aggregate wildcards are listed by
    /// aggregate name only.
    pub async fn registered_patterns(&self) -> Vec<String> {
        let registry = self.registry.read().await;
        registry
            .entries
            .iter()
            .map(|entry| entry.pattern.label().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub async fn has_handlers(&self, event_type: &str) -> bool {
        let registry = self.registry.read().await;
        registry
            .entries
            .iter()
            .any(|entry| entry.pattern.matches(event_type))
    }

    pub async fn handler_count(&self) -> usize {
        self.registry.read().await.entries.len()
    }

    async fn matching(&self, event_type: &str) -> Vec<RegisteredHandler> {
        let registry = self.registry.read().await;
        registry
            .entries
            .iter()
            .filter(|entry| entry.pattern.matches(event_type))
            .cloned()
            .collect()
    }

    /// Run every handler matching the event.
    ///
    /// No matching handler is a success. Every matched handler runs to
    /// completion (or timeout) even when a sibling fails; all failures are
    /// returned together.
    pub async fn dispatch(&self, event: &OutboxEvent) -> DispatchResult<DispatchReport> {
        let started = Instant::now();
        let handlers = self.matching(&event.event_type).await;

        if handlers.is_empty() {
            debug!(event_id = %event.id, event_type = %event.event_type, "No handlers for event");
            return Ok(DispatchReport {
                event_id: event.id.clone(),
                handlers_run: 0,
                duration_ms: 0,
            });
        }

        let event = Arc::new(event.clone());
        let timeout = self.config.handler_timeout;

        let outcomes = if self.config.parallel {
            join_all(
                handlers
                    .iter()
                    .map(|entry| run_handler(entry, Arc::clone(&event), timeout)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(handlers.len());
            for entry in &handlers {
                outcomes.push(run_handler(entry, Arc::clone(&event), timeout).await);
            }
            outcomes
        };

        let failures: Vec<HandlerFailure> = outcomes.into_iter().filter_map(Result::err).collect();
        let duration_ms = started.elapsed().as_millis() as u64;

        if failures.is_empty() {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                handlers = handlers.len(),
                duration_ms,
                "Event dispatched"
            );
            return Ok(DispatchReport {
                event_id: event.id.clone(),
                handlers_run: handlers.len(),
                duration_ms,
            });
        }

        Err(DispatchError::HandlersFailed {
            event_id: event.id.clone(),
            failures,
        })
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

fn boxed<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Arc<OutboxEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

/// Run one handler in its own task, bounded by `timeout`.
async fn run_handler(
    entry: &RegisteredHandler,
    event: Arc<OutboxEvent>,
    timeout: Duration,
) -> Result<(), HandlerFailure> {
    let handler = Arc::clone(&entry.handler);
    let event_id = event.id.clone();
    // Calling the handler inside the task keeps a panic while building the
    // future contained as well.
    let mut task = tokio::spawn(async move { handler(event).await });

    let cause = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => return Ok(()),
        Ok(Ok(Err(e))) => format!("{:#}", e),
        Ok(Err(join_error)) if join_error.is_panic() => {
            format!("handler panicked: {}", panic_message(join_error.into_panic()))
        }
        Ok(Err(join_error)) => format!("handler task failed: {}", join_error),
        Err(_) => {
            task.abort();
            format!("handler timed out after {}ms", timeout.as_millis())
        }
    };

    warn!(
        event_id = %event_id,
        handler = %entry.name,
        pattern = %entry.pattern,
        cause = %cause,
        "Event handler failed"
    );

    Err(HandlerFailure {
        handler: entry.name.clone(),
        pattern: entry.pattern.to_string(),
        cause,
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
