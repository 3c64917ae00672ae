//! Action registry.
//!
//! Every action shares one [`PluginContext`]: the client bundle and the
//! timing configuration. The host builds the context once, wraps it in an
//! [`Arc`] and asks [`PluginRegistry::new`] for the full set of actions,
//! which it then looks up by registration name.

use std::sync::Arc;

use tracing::debug;

use crate::action::backup::{ClaimBackupper, ClassBackupper, ContentBackupper, SnapshotBackupper};
use crate::action::delete::{ContentDeleter, SnapshotDeleter};
use crate::action::restore::{ClaimRestorer, ClassRestorer, ContentRestorer, SnapshotRestorer};
use crate::action::{BackupItemAction, DeleteItemAction, RestoreItemAction};
use crate::client::Clients;
use crate::config::Config;

/// State shared by every action.
pub struct PluginContext {
    /// Typed clients, live or in-memory.
    pub clients: Clients,
    /// Timeouts and poll intervals.
    pub config: Config,
}

impl PluginContext {
    /// Bundle `clients` and `config`.
    pub fn new(clients: Clients, config: Config) -> Self {
        Self { clients, config }
    }
}

/// All actions, keyed by their registration names.
pub struct PluginRegistry {
    backup: Vec<Arc<dyn BackupItemAction>>,
    restore: Vec<Arc<dyn RestoreItemAction>>,
    delete: Vec<Arc<dyn DeleteItemAction>>,
}

impl PluginRegistry {
    /// Build the ten actions over one shared context.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        let registry = Self {
            backup: vec![
                Arc::new(ClaimBackupper::new(ctx.clone())),
                Arc::new(SnapshotBackupper::new(ctx.clone())),
                Arc::new(ContentBackupper::new(ctx.clone())),
                Arc::new(ClassBackupper),
            ],
            restore: vec![
                Arc::new(ClaimRestorer::new(ctx.clone())),
                Arc::new(SnapshotRestorer::new(ctx.clone())),
                Arc::new(ContentRestorer::new(ctx.clone())),
                Arc::new(ClassRestorer),
            ],
            delete: vec![
                Arc::new(SnapshotDeleter::new(ctx.clone())),
                Arc::new(ContentDeleter::new(ctx)),
            ],
        };
        debug!(
            backup = registry.backup.len(),
            restore = registry.restore.len(),
            delete = registry.delete.len(),
            "registered item actions"
        );
        registry
    }

    /// Backup actions in registration order.
    pub fn backup_actions(&self) -> &[Arc<dyn BackupItemAction>] {
        &self.backup
    }

    /// Restore actions in registration order.
    pub fn restore_actions(&self) -> &[Arc<dyn RestoreItemAction>] {
        &self.restore
    }

    /// Backup-deletion actions in registration order.
    pub fn delete_actions(&self) -> &[Arc<dyn DeleteItemAction>] {
        &self.delete
    }

    /// Look up an action by [`BackupItemAction::name`].
    pub fn backup_action(&self, name: &str) -> Option<Arc<dyn BackupItemAction>> {
        self.backup.iter().find(|a| a.name() == name).cloned()
    }

    pub fn restore_action(&self, name: &str) -> Option<Arc<dyn RestoreItemAction>> {
        self.restore.iter().find(|a| a.name() == name).cloned()
    }

    pub fn delete_action(&self, name: &str) -> Option<Arc<dyn DeleteItemAction>> {
        self.delete.iter().find(|a| a.name() == name).cloned()
    }
}
