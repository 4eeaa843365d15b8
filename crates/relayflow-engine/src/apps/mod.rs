//! Bundled reference apps.
//!
//! Enough connectors to run real flows end to end: a raw webhook, a cron
//! schedule, a JSON feed poller, a generic HTTP action and Slack. Register
//! them with [`register_reference_apps`] or pick them one by one.

pub mod common;
pub mod http;
pub mod json_feed;
pub mod scheduler;
pub mod slack;
pub mod webhook;

pub use http::HttpApp;
pub use json_feed::JsonFeedApp;
pub use scheduler::SchedulerApp;
pub use slack::SlackApp;
pub use webhook::WebhookApp;

use std::sync::Arc;

use crate::connector::{App, ConnectorRegistry};

/// Every reference app, in registration order.
pub fn reference_apps() -> Vec<Arc<dyn App>> {
    vec![
        Arc::new(WebhookApp),
        Arc::new(SchedulerApp),
        Arc::new(JsonFeedApp),
        Arc::new(HttpApp),
        Arc::new(SlackApp),
    ]
}

pub fn register_reference_apps(registry: &ConnectorRegistry) {
    for app in reference_apps() {
        registry.register(app);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepKind;

    #[test]
    fn catalog_indexes_every_operation() {
        let registry = ConnectorRegistry::new();
        register_reference_apps(&registry);
        assert_eq!(registry.len(), 5);

        let expected = [
            ("webhook", "catch_raw_webhook", StepKind::Trigger),
            ("scheduler", "every_cron_tick", StepKind::Trigger),
            ("json-feed", "new_items", StepKind::Trigger),
            ("http", "make_request", StepKind::Action),
            ("slack", "send_message", StepKind::Action),
        ];
        for (app, op, kind) in expected {
            assert_eq!(registry.operation_kind(app, op), Some(kind), "{app}.{op}");
        }
        assert!(registry.dynamic_data("slack", "list_channels").is_some());
    }
}
