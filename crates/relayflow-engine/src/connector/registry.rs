//! Load-time registry mapping `(app_key, operation_key)` to handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{ActionHandler, App, AppMeta, DynamicDataHandler, TriggerDef};
use crate::types::StepKind;

/// Thread-safe catalog of apps.
///
/// Cheaply cloneable; clones share the same catalog. Operation indexes are
/// built once at [`register`](Self::register) so lookups never call back
/// into the app.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    apps: BTreeMap<String, AppEntry>,
}

struct AppEntry {
    app: Arc<dyn App>,
    meta: AppMeta,
    triggers: BTreeMap<String, TriggerDef>,
    actions: BTreeMap<String, Arc<dyn ActionHandler>>,
    dynamic_data: BTreeMap<String, Arc<dyn DynamicDataHandler>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an app, replacing any app with the same key.
    pub fn register(&self, app: Arc<dyn App>) {
        let meta = app.meta();
        let triggers: BTreeMap<String, TriggerDef> =
            app.triggers().into_iter().map(|t| (t.key(), t)).collect();
        let actions: BTreeMap<String, Arc<dyn ActionHandler>> = app
            .actions()
            .into_iter()
            .map(|a| (a.meta().key, a))
            .collect();
        let dynamic_data = app
            .dynamic_data()
            .into_iter()
            .map(|d| (d.key().to_string(), d))
            .collect();

        for key in triggers.keys().filter(|k| actions.contains_key(*k)) {
            tracing::warn!(
                app = %meta.key,
                operation = %key,
                "operation key used by both a trigger and an action"
            );
        }

        tracing::debug!(
            app = %meta.key,
            triggers = triggers.len(),
            actions = actions.len(),
            "registered app"
        );

        let key = meta.key.clone();
        self.inner.write().apps.insert(
            key,
            AppEntry {
                app,
                meta,
                triggers,
                actions,
                dynamic_data,
            },
        );
    }

    /// Remove an app. Returns `true` if it existed.
    pub fn remove(&self, app_key: &str) -> bool {
        self.inner.write().apps.remove(app_key).is_some()
    }

    pub fn app(&self, app_key: &str) -> Option<Arc<dyn App>> {
        self.inner.read().apps.get(app_key).map(|e| Arc::clone(&e.app))
    }

    pub fn app_meta(&self, app_key: &str) -> Option<AppMeta> {
        self.inner.read().apps.get(app_key).map(|e| e.meta.clone())
    }

    /// Metadata of every app, ordered by key.
    pub fn apps(&self) -> Vec<AppMeta> {
        self.inner
            .read()
            .apps
            .values()
            .map(|e| e.meta.clone())
            .collect()
    }

    pub fn trigger(&self, app_key: &str, operation_key: &str) -> Option<TriggerDef> {
        self.inner
            .read()
            .apps
            .get(app_key)
            .and_then(|e| e.triggers.get(operation_key).cloned())
    }

    pub fn action(&self, app_key: &str, operation_key: &str) -> Option<Arc<dyn ActionHandler>> {
        self.inner
            .read()
            .apps
            .get(app_key)
            .and_then(|e| e.actions.get(operation_key).cloned())
    }

    pub fn dynamic_data(&self, app_key: &str, key: &str) -> Option<Arc<dyn DynamicDataHandler>> {
        self.inner
            .read()
            .apps
            .get(app_key)
            .and_then(|e| e.dynamic_data.get(key).cloned())
    }

    /// Whether `(app_key, operation_key)` names a trigger or an action.
    /// Triggers win when an app reuses a key for both.
    pub fn operation_kind(&self, app_key: &str, operation_key: &str) -> Option<StepKind> {
        let inner = self.inner.read();
        let entry = inner.apps.get(app_key)?;
        if entry.triggers.contains_key(operation_key) {
            Some(StepKind::Trigger)
        } else if entry.actions.contains_key(operation_key) {
            Some(StepKind::Action)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().apps.is_empty()
    }
}
