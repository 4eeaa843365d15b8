use std::collections::HashSet;

use crate::connector::ConnectorRegistry;
use crate::types::{Flow, Step, StepKind};
use crate::variables::references;

/// Validate the shape of a step list.
///
/// Returns `Ok(())` if the steps form a valid flow, or `Err(Vec<String>)`
/// with a list of human-readable validation errors.
pub fn validate_steps(steps: &[Step]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    // 1. At least the trigger.
    if steps.is_empty() {
        errors.push("Flow has no steps".to_string());
    }

    // 2. Positions are 1..=N in order.
    for (i, step) in steps.iter().enumerate() {
        let expected = i as u32 + 1;
        if step.position != expected {
            errors.push(format!(
                "Step {} has position {}, expected {expected}",
                step.id, step.position
            ));
        }
    }

    // 3. Position 1 is a trigger, every other position an action.
    for step in steps {
        match (step.position, step.kind) {
            (1, StepKind::Trigger) => {}
            (1, StepKind::Action) => errors.push(format!(
                "Step at position 1 must be a trigger, found action {}.{}",
                step.app_key, step.operation_key
            )),
            (p, StepKind::Trigger) => errors.push(format!(
                "Step at position {p} must be an action, found trigger {}.{}",
                step.app_key, step.operation_key
            )),
            _ => {}
        }
    }

    // 4. No duplicate step IDs.
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(&step.id) {
            errors.push(format!("Duplicate step ID: {}", step.id));
        }
    }

    // 5. References point at earlier positions.
    for step in steps {
        for reference in references(&step.parameters_value()) {
            match reference {
                Ok(r) if r.position >= step.position => errors.push(format!(
                    "Step at position {} references step{}, which runs later",
                    step.position, r.position
                )),
                Ok(_) => {}
                Err(e) => errors.push(format!("Step at position {}: {e}", step.position)),
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a flow against the connectors that are actually registered:
/// every step names a known operation of the right kind with its required
/// arguments set.
pub fn validate_flow(flow: &Flow, registry: &ConnectorRegistry) -> Result<(), Vec<String>> {
    let mut errors = match validate_steps(&flow.steps) {
        Ok(()) => Vec::new(),
        Err(errors) => errors,
    };

    for step in &flow.steps {
        let label = format!("{}.{}", step.app_key, step.operation_key);
        if registry.app(&step.app_key).is_none() {
            errors.push(format!(
                "Step at position {} uses unknown app {}",
                step.position, step.app_key
            ));
            continue;
        }

        let arguments = match step.kind {
            StepKind::Trigger => registry
                .trigger(&step.app_key, &step.operation_key)
                .map(|t| t.meta()),
            StepKind::Action => registry
                .action(&step.app_key, &step.operation_key)
                .map(|a| a.meta()),
        };
        match arguments {
            None => errors.push(format!(
                "Step at position {} uses unknown {} {label}",
                step.position, step.kind
            )),
            Some(meta) => {
                for missing in meta.missing_arguments(&step.parameters) {
                    errors.push(format!(
                        "Step at position {} ({label}) is missing required argument {missing}",
                        step.position
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps;
    use serde_json::json;

    fn numbered(steps: Vec<Step>) -> Vec<Step> {
        steps
            .into_iter()
            .enumerate()
            .map(|(i, mut s)| {
                s.position = i as u32 + 1;
                s
            })
            .collect()
    }

    #[test]
    fn valid_steps() {
        let steps = numbered(vec![
            Step::trigger("webhook", "catch_raw_webhook"),
            Step::action("slack", "send_message").param("text", json!("{{step1.row.email}}")),
        ]);
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn empty_flow() {
        let errors = validate_steps(&[]).unwrap_err();
        assert!(errors[0].contains("no steps"));
    }

    #[test]
    fn position_gap() {
        let mut steps = numbered(vec![
            Step::trigger("webhook", "catch_raw_webhook"),
            Step::action("http", "make_request"),
        ]);
        steps[1].position = 3;
        let errors = validate_steps(&steps).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("expected 2")));
    }

    #[test]
    fn forward_and_self_references() {
        let steps = numbered(vec![
            Step::trigger("webhook", "catch_raw_webhook"),
            Step::action("http", "make_request").param("url", json!("{{step2.url}}")),
            Step::action("http", "make_request").param("url", json!("{{step4.url}}")),
        ]);
        let errors = validate_steps(&steps).unwrap_err();
        assert_eq!(errors.len(), 2, "{errors:?}");
    }

    #[test]
    fn malformed_reference() {
        let steps = numbered(vec![
            Step::trigger("webhook", "catch_raw_webhook"),
            Step::action("http", "make_request").param("url", json!("{{row.url}}")),
        ]);
        let errors = validate_steps(&steps).unwrap_err();
        assert!(errors[0].contains("invalid reference"));
    }

    #[test]
    fn registry_checks() {
        let registry = ConnectorRegistry::new();
        apps::register_reference_apps(&registry);

        let ok = Flow::new(
            "ok",
            vec![
                Step::trigger("webhook", "catch_raw_webhook"),
                Step::action("http", "make_request").param("url", json!("https://example.com")),
            ],
        )
        .unwrap();
        assert!(validate_flow(&ok, &registry).is_ok());

        let bad = Flow::new(
            "bad",
            vec![
                Step::trigger("webhook", "catch_raw_webhook"),
                Step::action("http", "make_request"),
                Step::action("nope", "thing"),
                Step::action("slack", "no_such_action"),
            ],
        )
        .unwrap();
        let errors = validate_flow(&bad, &registry).unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("missing required argument url")));
        assert!(errors.iter().any(|e| e.contains("unknown app nope")));
        assert!(errors.iter().any(|e| e.contains("unknown action slack.no_such_action")));
    }
}
