//! Contracts the auto-wirer consumes: tool schemas and semantic resolution.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::wiring::candidates::CandidateSummary;

/// Required arguments and per-argument JSON schema of a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ToolSchema {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, json_type: &str) -> Self {
        self.properties
            .insert(name.into(), serde_json::json!({ "type": json_type }));
        self
    }

    /// Read `required` and `properties` out of a JSON-schema object.
    pub fn from_json_schema(schema: &Value) -> Option<Self> {
        let object = schema.as_object()?;
        let required = object
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let properties = object
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            required,
            properties,
        })
    }

    /// Declared JSON type of `arg`, if the schema names one.
    pub fn property_type(&self, arg: &str) -> Option<&str> {
        self.properties.get(arg)?.get("type")?.as_str()
    }

    pub fn property_schema(&self, arg: &str) -> Value {
        self.properties
            .get(arg)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Required arguments absent from `args`, in declaration order.
    pub fn missing(&self, args: &Map<String, Value>) -> Vec<String> {
        self.required
            .iter()
            .filter(|name| !args.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Supplies tool schemas. `Ok(None)` means the tool has no schema.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn tool_schema(&self, tool_name: &str) -> anyhow::Result<Option<ToolSchema>>;
}

/// In-memory schema source.
#[derive(Clone, Default)]
pub struct StaticSchemaSource {
    schemas: Arc<RwLock<HashMap<String, ToolSchema>>>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tool_name: impl Into<String>, schema: ToolSchema) {
        self.schemas.write().insert(tool_name.into(), schema);
    }

    pub fn with_schema(self, tool_name: impl Into<String>, schema: ToolSchema) -> Self {
        self.insert(tool_name, schema);
        self
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn tool_schema(&self, tool_name: &str) -> anyhow::Result<Option<ToolSchema>> {
        Ok(self.schemas.read().get(tool_name).cloned())
    }
}

/// One answer from the semantic resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
    /// Use the value of the candidate with this reference
    Reference { reference: String },
    /// Use this value as-is
    Literal { value: Value },
}

impl Resolution {
    /// Interpret a loosely shaped answer: `{"reference": ..}`,
    /// `{"value": ..}`, or any other JSON taken as a literal.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Resolution>(value.clone()) {
            Ok(resolution) if is_exact_shape(&value) => resolution,
            _ => Resolution::Literal { value },
        }
    }

    /// Parse a whole `{arg: answer}` object.
    pub fn parse_map(answers: &Value) -> HashMap<String, Resolution> {
        answers
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .map(|(arg, answer)| (arg.clone(), Resolution::from_value(answer.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn is_exact_shape(value: &Value) -> bool {
    match value.as_object() {
        Some(object) if object.len() == 1 => {
            object.get("reference").map(Value::is_string).unwrap_or(false)
                || object.contains_key("value")
        }
        _ => false,
    }
}

/// Best-effort fallback that maps still-missing arguments onto candidates.
///
/// Failures and timeouts are swallowed by the caller.
#[async_trait]
pub trait SemanticResolver: Send + Sync {
    async fn resolve(
        &self,
        tool_name: &str,
        missing: &Map<String, Value>,
        candidates: &[CandidateSummary],
    ) -> anyhow::Result<HashMap<String, Resolution>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_from_json() {
        let schema = ToolSchema::from_json_schema(&json!({
            "type": "object",
            "properties": {"ticker": {"type": "string"}, "limit": {"type": "integer"}},
            "required": ["ticker", "limit"]
        }))
        .unwrap();
        assert_eq!(schema.property_type("limit"), Some("integer"));
        assert_eq!(schema.property_type("other"), None);

        let mut args = Map::new();
        args.insert("limit".into(), json!(5));
        assert_eq!(schema.missing(&args), vec!["ticker".to_string()]);
    }

    #[test]
    fn test_resolution_shapes() {
        assert_eq!(
            Resolution::from_value(json!({"reference": "n1.ticker"})),
            Resolution::Reference { reference: "n1.ticker".into() }
        );
        assert_eq!(
            Resolution::from_value(json!({"value": 5})),
            Resolution::Literal { value: json!(5) }
        );
        assert_eq!(
            Resolution::from_value(json!("AAPL")),
            Resolution::Literal { value: json!("AAPL") }
        );
        assert_eq!(
            Resolution::from_value(json!({"reference": "x", "extra": 1})),
            Resolution::Literal { value: json!({"reference": "x", "extra": 1}) }
        );

        let parsed = Resolution::parse_map(&json!({"a": {"reference": "n.a"}, "b": 2}));
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticSchemaSource::new().with_schema("t", ToolSchema::new(["x"]));
        assert!(source.tool_schema("t").await.unwrap().is_some());
        assert!(source.tool_schema("u").await.unwrap().is_none());
    }
}
