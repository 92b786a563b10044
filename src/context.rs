use std::sync::Arc;

use crate::audit::{AuditEntry, AuditLog, MemoryAuditLog};
use crate::config::EngineConfig;
use crate::notify::{Notification, NotificationOutbox, Notifier};
use crate::store::{LedgerStore, LoanStore, MemoryStore};
use crate::validation::ValidationGate;

/// Collaborators shared by every engine component.
///
/// Built once per request (or per batch run) and passed to the components by
/// reference; there is no process-wide store client.
#[derive(Clone)]
pub struct EngineContext {
    pub ledger: Arc<dyn LedgerStore>,
    pub loans: Arc<dyn LoanStore>,
    pub audit: Arc<dyn AuditLog>,
    pub notifier: Arc<dyn Notifier>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        loans: Arc<dyn LoanStore>,
        audit: Arc<dyn AuditLog>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            loans,
            audit,
            notifier,
            config,
        }
    }

    pub fn gate(&self) -> ValidationGate {
        ValidationGate::new(self.config.clone())
    }

    /// An audit failure is logged but never undoes money that already moved.
    pub fn record(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = self.audit.append(entry) {
            tracing::error!(?action, error = %e, "failed to append audit entry");
        }
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext").field("config", &self.config).finish_non_exhaustive()
    }
}

/// In-process collaborators, for tests, demos and local runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub outbox: Arc<NotificationOutbox>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self, config: EngineConfig) -> EngineContext {
        EngineContext::new(
            self.store.clone(),
            self.store.clone(),
            self.audit.clone(),
            self.outbox.clone(),
            config,
        )
    }
}
