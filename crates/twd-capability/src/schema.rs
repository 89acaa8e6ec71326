// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operation → tool schema generation.
//!
//! Builds a JSON Schema for each operation's inputs from its input-variable
//! elements (XSD → JSON type mapping, `Min`/`Max`/`unit` qualifiers) and
//! augments it with the two mandatory safety fields every tool carries:
//! `simulate` and `safety_reasoning`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;
use twd_types::{
    DiscoveredOperation, ElementCollection, ElementList, LangString, Operation, Property,
    RiskLevel, SubmodelElement, qualifier_raw, qualifier_string,
};

/// Specification of one LM-callable tool, derived from a twin operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (the operation's idShort).
    pub name: String,
    /// Human description, annotated with the risk level.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
    /// Containing submodel id.
    pub submodel_id: String,
    /// idShort path of the operation within the submodel.
    pub operation_path: String,
    /// Risk classification, from the `RiskLevel` qualifier.
    pub risk: RiskLevel,
    /// Delegation endpoint, from the `invocationDelegation` qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_url: Option<String>,
}

fn json_type_for(value_type: Option<&str>) -> &'static str {
    match value_type {
        Some(
            "xs:integer" | "xs:int" | "xs:long" | "xs:short" | "xs:byte" | "xs:unsignedInt"
            | "xs:unsignedLong" | "xs:unsignedShort" | "xs:unsignedByte",
        ) => "integer",
        Some("xs:decimal" | "xs:float" | "xs:double") => "number",
        Some("xs:boolean") => "boolean",
        // Time, URI and binary types all map to strings.
        _ => "string",
    }
}

fn english_text(descriptions: &[LangString]) -> Option<String> {
    descriptions
        .iter()
        .find(|d| d.language == "en")
        .or_else(|| descriptions.first())
        .map(|d| d.text.clone())
}

/// `Min`/`Max` qualifiers are matched case-insensitively.
fn constraint_value<'a>(
    qualifiers: &'a [twd_types::Qualifier],
    name: &str,
) -> Option<&'a Value> {
    qualifiers
        .iter()
        .find(|q| q.kind.eq_ignore_ascii_case(name))
        .and_then(|q| q.value.as_ref())
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn property_schema(property: &Property) -> Value {
    let json_type = json_type_for(property.value_type.as_deref());
    let mut schema = Map::new();
    schema.insert("type".into(), json!(json_type));

    let mut description = english_text(&property.description).unwrap_or_default();

    let min = constraint_value(&property.qualifiers, "Min").and_then(as_f64);
    let max = constraint_value(&property.qualifiers, "Max").and_then(as_f64);
    match json_type {
        "integer" => {
            if let Some(min) = min {
                schema.insert("minimum".into(), json!(min as i64));
            }
            if let Some(max) = max {
                schema.insert("maximum".into(), json!(max as i64));
            }
        }
        "number" => {
            if let Some(min) = min {
                schema.insert("minimum".into(), json!(min));
            }
            if let Some(max) = max {
                schema.insert("maximum".into(), json!(max));
            }
        }
        "string" => {
            if let Some(min) = min {
                schema.insert("minLength".into(), json!(min as u64));
            }
            if let Some(max) = max {
                schema.insert("maxLength".into(), json!(max as u64));
            }
        }
        _ => {}
    }

    if let Some(unit) = qualifier_string(&property.qualifiers, "unit") {
        description = format!("{description} (Unit: {unit})").trim().to_string();
    }
    if !description.is_empty() {
        schema.insert("description".into(), json!(description));
    }
    Value::Object(schema)
}

fn collection_schema(collection: &ElementCollection) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for element in &collection.value {
        let Some(id_short) = element.id_short().map(str::to_string) else {
            continue;
        };
        if let Some(schema) = element_schema(element) {
            properties.insert(id_short.clone(), schema);
        }
        let required_flag = qualifier_string(element.qualifiers(), "required");
        if required_flag.as_deref().is_some_and(|f| f.eq_ignore_ascii_case("true")) {
            required.push(Value::String(id_short));
        }
    }
    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), Value::Array(required));
    }
    Value::Object(schema)
}

fn list_schema(list: &ElementList) -> Value {
    let items = match list.type_value_list_element.as_deref() {
        Some("Property") => {
            json!({"type": json_type_for(list.value_type_list_element.as_deref())})
        }
        Some("SubmodelElementCollection") => match list.value.first() {
            Some(SubmodelElement::SubmodelElementCollection(first)) => collection_schema(first),
            _ => json!({"type": "object"}),
        },
        _ => json!({}),
    };
    json!({"type": "array", "items": items})
}

fn element_schema(element: &SubmodelElement) -> Option<Value> {
    match element {
        SubmodelElement::Property(p) => Some(property_schema(p)),
        SubmodelElement::SubmodelElementCollection(c) => Some(collection_schema(c)),
        SubmodelElement::SubmodelElementList(l) => Some(list_schema(l)),
        SubmodelElement::Operation(_) => None,
        SubmodelElement::Other(_) => Some(json!({"type": "string"})),
    }
}

/// Build the complete input schema for an operation.
///
/// Every declared input variable becomes a required property; `simulate` and
/// `safety_reasoning` are appended and required on every tool.
#[must_use]
pub fn build_input_schema(operation: &Operation) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for variable in &operation.input_variables {
        let element = &variable.value;
        let Some(id_short) = element.id_short().map(str::to_string) else {
            continue;
        };
        let schema = element_schema(element).unwrap_or_else(|| json!({"type": "string"}));
        properties.insert(id_short.clone(), schema);
        required.push(Value::String(id_short));
    }

    properties.insert(
        "simulate".into(),
        json!({
            "type": "boolean",
            "description": "If true, run in simulation mode without affecting real equipment",
        }),
    );
    properties.insert(
        "safety_reasoning".into(),
        json!({
            "type": "string",
            "minLength": 8,
            "description": "Brief justification for why this action is safe and appropriate",
        }),
    );
    required.push(json!("simulate"));
    required.push(json!("safety_reasoning"));

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn risk_note(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "This operation is safe for routine use.",
        RiskLevel::Medium => "This operation may affect process state.",
        RiskLevel::High => "This operation actuates equipment. Simulation recommended.",
        RiskLevel::Critical => "This operation is safety-critical. Requires approval.",
    }
}

fn build_description(operation: &Operation, risk: RiskLevel) -> String {
    let base = english_text(&operation.description)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| format!("Execute {}", operation.id_short));
    format!("{base} (Risk: {risk}). {}", risk_note(risk))
}

/// Derive a [`ToolSpec`] from a discovered operation.
#[must_use]
pub fn tool_spec_from(discovered: &DiscoveredOperation) -> ToolSpec {
    let operation = &discovered.operation;
    let risk = qualifier_string(&operation.qualifiers, "RiskLevel")
        .and_then(|value| {
            value
                .parse()
                .inspect_err(|_| {
                    warn!(
                        operation = %operation.id_short,
                        value = %value,
                        "unrecognised RiskLevel qualifier, defaulting to LOW"
                    );
                })
                .ok()
        })
        .unwrap_or_default();
    // Delegation URLs sometimes arrive as non-string qualifier values; only
    // strings are meaningful endpoints.
    let delegation_url = qualifier_raw(&operation.qualifiers, "invocationDelegation")
        .and_then(Value::as_str)
        .map(str::to_string);

    ToolSpec {
        name: operation.id_short.clone(),
        description: build_description(operation, risk),
        input_schema: build_input_schema(operation),
        submodel_id: discovered.submodel_id.clone(),
        operation_path: discovered.path.clone(),
        risk,
        delegation_url,
    }
}

/// Derive tool specs for every discovered operation.
#[must_use]
pub fn tool_specs(operations: &[DiscoveredOperation]) -> Vec<ToolSpec> {
    operations.iter().map(tool_spec_from).collect()
}
