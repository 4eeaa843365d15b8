//! JSON Schema generation for the public data model.
//!
//! This module is only available when the `schemars` feature is enabled.

use schemars::{JsonSchema, schema_for};
use serde_json::Value;
use std::collections::BTreeMap;

/// Generate JSON Schema for a single type.
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

/// Generate all data model schemas, keyed by type name.
pub fn all_schemas() -> BTreeMap<String, Value> {
    let mut schemas = BTreeMap::new();

    // flows
    schemas.insert("Flow".into(), schema_of::<crate::Flow>());
    schemas.insert("Step".into(), schema_of::<crate::Step>());
    schemas.insert("StepKind".into(), schema_of::<crate::StepKind>());
    schemas.insert("TriggerState".into(), schema_of::<crate::TriggerState>());
    schemas.insert("TriggerData".into(), schema_of::<crate::TriggerData>());
    schemas.insert("FlowBundle".into(), schema_of::<crate::FlowBundle>());
    schemas.insert("Connection".into(), schema_of::<crate::Connection>());

    // executions
    schemas.insert("Execution".into(), schema_of::<crate::Execution>());
    schemas.insert(
        "ExecutionStatus".into(),
        schema_of::<crate::ExecutionStatus>(),
    );
    schemas.insert("ExecutionStep".into(), schema_of::<crate::ExecutionStep>());
    schemas.insert("StepStatus".into(), schema_of::<crate::StepStatus>());
    schemas.insert(
        "StepErrorPayload".into(),
        schema_of::<crate::StepErrorPayload>(),
    );
    schemas.insert("ConnectorError".into(), schema_of::<crate::ConnectorError>());

    // jobs
    schemas.insert("QueueName".into(), schema_of::<crate::QueueName>());
    schemas.insert("FlowRunJob".into(), schema_of::<crate::FlowRunJob>());
    schemas.insert("TriggerPollJob".into(), schema_of::<crate::TriggerPollJob>());
    schemas.insert("ActionJob".into(), schema_of::<crate::ActionJob>());
    schemas.insert("EmailJob".into(), schema_of::<crate::EmailJob>());

    // connectors and config
    schemas.insert("AppMeta".into(), schema_of::<crate::AppMeta>());
    schemas.insert("OperationMeta".into(), schema_of::<crate::OperationMeta>());
    schemas.insert("EngineConfig".into(), schema_of::<crate::EngineConfig>());

    schemas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_of_produces_valid_json_schema() {
        let schema = schema_of::<crate::Flow>();
        let obj = schema.as_object().unwrap();
        assert!(obj.contains_key("title") || obj.contains_key("type") || obj.contains_key("$ref"));
    }

    #[test]
    fn all_schemas_non_empty() {
        let schemas = all_schemas();
        assert!(schemas.len() >= 20, "got {}", schemas.len());
        for (name, schema) in &schemas {
            assert!(schema.is_object(), "Schema for {name} is not an object");
        }
    }
}
