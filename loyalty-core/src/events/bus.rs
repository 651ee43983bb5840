//! Event bus mapping event names to subscribed handlers.

use super::types::DomainEvent;
use crate::entities::OrderError;
use crate::services::WalletServiceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unexpected event: {0}")]
    UnexpectedEvent(&'static str),

    #[error(transparent)]
    Wallet(#[from] WalletServiceError),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// What the failure hook learns about a failed handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub event: &'static str,
    pub handler: &'static str,
    pub error: String,
}

pub type FailureHook = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

type Handlers = HashMap<&'static str, Vec<Arc<dyn EventHandler>>>;

#[derive(Default)]
struct BusInner {
    handlers: RwLock<Handlers>,
    failure_hook: Option<FailureHook>,
}

/// Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus that also reports every handler error to `hook`.
    pub fn with_failure_hook(hook: FailureHook) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::default(),
                failure_hook: Some(hook),
            }),
        }
    }

    pub fn subscribe(&self, event: &'static str, handler: Arc<dyn EventHandler>) {
        debug!(event, handler = handler.name(), "Handler subscribed");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Run every handler subscribed to the event on its own task.
    ///
    /// Returns at once. The returned [`Dispatch`] may be dropped.
    pub fn publish(&self, event: impl Into<DomainEvent>) -> Dispatch {
        let event = Arc::new(event.into());
        let name = event.name();
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(event = name, "No handlers for event");
        }

        let handles = handlers
            .into_iter()
            .map(|handler| {
                let event = event.clone();
                let hook = self.inner.failure_hook.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(&event).await {
                        error!(
                            event = name,
                            handler = handler.name(),
                            error = %e,
                            "Event handler failed"
                        );
                        if let Some(hook) = hook {
                            hook(&HandlerFailure {
                                event: name,
                                handler: handler.name(),
                                error: e.to_string(),
                            });
                        }
                    }
                })
            })
            .collect();

        Dispatch { handles }
    }
}

/// Handles of the tasks started by one publish.
#[must_use = "drop the dispatch for fire-and-forget, or await `settled`"]
pub struct Dispatch {
    handles: Vec<JoinHandle<()>>,
}

impl Dispatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait until every handler has finished.
    pub async fn settled(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Event handler task aborted");
            }
        }
    }
}
