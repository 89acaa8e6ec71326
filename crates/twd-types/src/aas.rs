// SPDX-License-Identifier: MIT OR Apache-2.0

//! Asset Administration Shell structures.
//!
//! Submodel elements are a sum type discriminated by the `modelType` tag.
//! Tags this crate does not model (`Entity`, `File`, ...) deserialize into
//! [`SubmodelElement::Other`] with their payload preserved verbatim, so a
//! shadow replica never drops twin content it does not understand.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a multi-language description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LangString {
    /// BCP-47 language tag (the twin mostly uses `en`).
    pub language: String,
    /// Display text in that language.
    pub text: String,
}

/// Typed name/value annotation on an element.
///
/// Qualifiers carry the metadata the agent actually governs on: `RiskLevel`,
/// `Min`/`Max`, `unit`, `required`, and `invocationDelegation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Qualifier {
    /// Qualifier type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Declared XSD value type, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    /// Qualifier value; strings and numbers both occur in the wild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A `Property` element: a single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Local name, unique within the parent.
    pub id_short: String,
    /// XSD value type (`xs:double`, `xs:string`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    /// Current value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Attached qualifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<Qualifier>,
    /// Multi-language description.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub description: Vec<LangString>,
}

/// A `SubmodelElementCollection`: a named group of nested elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementCollection {
    /// Local name, unique within the parent.
    pub id_short: String,
    /// Ordered child elements.
    #[serde(default)]
    pub value: Vec<SubmodelElement>,
    /// Attached qualifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<Qualifier>,
    /// Multi-language description.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub description: Vec<LangString>,
}

/// A `SubmodelElementList`: a homogeneous ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementList {
    /// Local name, unique within the parent.
    pub id_short: String,
    /// Model type of the list items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_value_list_element: Option<String>,
    /// XSD value type of the list items, when they are properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type_list_element: Option<String>,
    /// List items.
    #[serde(default)]
    pub value: Vec<SubmodelElement>,
    /// Attached qualifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<Qualifier>,
    /// Multi-language description.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub description: Vec<LangString>,
}

/// A variable slot of an [`Operation`]; wraps the element describing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationVariable {
    /// The wrapped element (usually a [`Property`]).
    pub value: SubmodelElement,
}

/// An invocable `Operation` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Local name, unique within the parent.
    pub id_short: String,
    /// Declared inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_variables: Vec<OperationVariable>,
    /// Declared outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_variables: Vec<OperationVariable>,
    /// Attached qualifiers (risk level, delegation URL).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<Qualifier>,
    /// Multi-language description.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub description: Vec<LangString>,
}

/// A submodel element, discriminated by its `modelType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modelType")]
pub enum SubmodelElement {
    /// Single typed value.
    Property(Property),
    /// Named group of nested elements.
    SubmodelElementCollection(ElementCollection),
    /// Homogeneous ordered list.
    SubmodelElementList(ElementList),
    /// Invocable operation.
    Operation(Operation),
    /// Any model type this crate does not interpret, kept verbatim.
    #[serde(untagged)]
    Other(Value),
}

impl SubmodelElement {
    /// The element's local name, if present.
    #[must_use]
    pub fn id_short(&self) -> Option<&str> {
        match self {
            Self::Property(p) => Some(&p.id_short),
            Self::SubmodelElementCollection(c) => Some(&c.id_short),
            Self::SubmodelElementList(l) => Some(&l.id_short),
            Self::Operation(o) => Some(&o.id_short),
            Self::Other(v) => v.get("idShort").and_then(Value::as_str),
        }
    }

    /// The `modelType` discriminator.
    #[must_use]
    pub fn model_type(&self) -> &str {
        match self {
            Self::Property(_) => "Property",
            Self::SubmodelElementCollection(_) => "SubmodelElementCollection",
            Self::SubmodelElementList(_) => "SubmodelElementList",
            Self::Operation(_) => "Operation",
            Self::Other(v) => v.get("modelType").and_then(Value::as_str).unwrap_or(""),
        }
    }

    /// Nested child elements, for container variants.
    #[must_use]
    pub fn children(&self) -> Option<&[SubmodelElement]> {
        match self {
            Self::SubmodelElementCollection(c) => Some(&c.value),
            Self::SubmodelElementList(l) => Some(&l.value),
            _ => None,
        }
    }

    /// Mutable access to nested child elements.
    pub fn children_mut(&mut self) -> Option<&mut Vec<SubmodelElement>> {
        match self {
            Self::SubmodelElementCollection(c) => Some(&mut c.value),
            Self::SubmodelElementList(l) => Some(&mut l.value),
            _ => None,
        }
    }

    /// The element's polymorphic `value`, as raw JSON.
    #[must_use]
    pub fn value_json(&self) -> Option<Value> {
        match self {
            Self::Property(p) => p.value.clone(),
            Self::SubmodelElementCollection(c) => {
                serde_json::to_value(&c.value).ok()
            }
            Self::SubmodelElementList(l) => serde_json::to_value(&l.value).ok(),
            Self::Operation(_) => None,
            Self::Other(v) => v.get("value").cloned(),
        }
    }

    /// The element's qualifiers.
    #[must_use]
    pub fn qualifiers(&self) -> &[Qualifier] {
        match self {
            Self::Property(p) => &p.qualifiers,
            Self::SubmodelElementCollection(c) => &c.qualifiers,
            Self::SubmodelElementList(l) => &l.qualifiers,
            Self::Operation(o) => &o.qualifiers,
            Self::Other(_) => &[],
        }
    }
}

/// Look up a qualifier of the given type and stringify its value.
#[must_use]
pub fn qualifier_string(qualifiers: &[Qualifier], kind: &str) -> Option<String> {
    qualifier_raw(qualifiers, kind).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Look up a qualifier of the given type and return its raw value.
#[must_use]
pub fn qualifier_raw<'a>(qualifiers: &'a [Qualifier], kind: &str) -> Option<&'a Value> {
    qualifiers
        .iter()
        .find(|q| q.kind == kind)
        .and_then(|q| q.value.as_ref())
}

/// A submodel: an identified, ordered sequence of elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submodel {
    /// Stable identifier (usually a URN).
    pub id: String,
    /// Optional local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    /// The element tree.
    #[serde(default)]
    pub submodel_elements: Vec<SubmodelElement>,
    /// Remaining submodel fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The root shell entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shell {
    /// Stable identifier.
    pub id: String,
    /// Optional local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    /// Remaining shell fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One key of a submodel reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefKey {
    /// The referenced identifier.
    pub value: String,
    /// Remaining key fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A reference from a shell to one of its submodels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmodelRef {
    /// Reference key chain; the first key carries the submodel id.
    #[serde(default)]
    pub keys: Vec<RefKey>,
}

impl SubmodelRef {
    /// The referenced submodel id, if the key chain is non-empty.
    #[must_use]
    pub fn submodel_id(&self) -> Option<&str> {
        self.keys.first().map(|k| k.value.as_str())
    }
}

/// A full twin snapshot: the shell plus every referenced submodel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinSnapshot {
    /// The root shell.
    pub shell: Shell,
    /// Referenced submodels, keyed by id.
    pub submodels: std::collections::BTreeMap<String, Submodel>,
}

/// An operation discovered inside a submodel, with its address.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredOperation {
    /// Containing submodel id.
    pub submodel_id: String,
    /// `/`-joined idShort path to the operation.
    pub path: String,
    /// The operation element itself.
    pub operation: Operation,
}

/// Walk a `/`-separated idShort path and return the matched element.
///
/// Returns `None` if any segment is missing or a non-terminal segment is not
/// a container.
#[must_use]
pub fn find_element<'a>(elements: &'a [SubmodelElement], path: &str) -> Option<&'a SubmodelElement> {
    let mut current = elements;
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        let found = current.iter().find(|e| e.id_short() == Some(segment))?;
        if segments.peek().is_none() {
            return Some(found);
        }
        current = found.children()?;
    }
    None
}

/// Walk a `/`-separated idShort path and return the element's value.
#[must_use]
pub fn property_value(elements: &[SubmodelElement], path: &str) -> Option<Value> {
    find_element(elements, path).and_then(SubmodelElement::value_json)
}

/// Replace the element addressed by `path` with `replacement`, in place.
///
/// Returns `true` when the target was found and swapped.
pub fn replace_element(
    elements: &mut Vec<SubmodelElement>,
    path: &str,
    replacement: SubmodelElement,
) -> bool {
    let mut current = elements;
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        let Some(index) = current
            .iter()
            .position(|e| e.id_short() == Some(segment))
        else {
            return false;
        };
        if segments.peek().is_none() {
            current[index] = replacement;
            return true;
        }
        match current[index].children_mut() {
            Some(children) => current = children,
            None => return false,
        }
    }
    false
}

/// Recursively collect every `Operation` in a submodel with its idShort path.
///
/// Only collections are descended into; operations never nest inside lists
/// in the twins this agent governs.
#[must_use]
pub fn collect_operations(submodel: &Submodel) -> Vec<DiscoveredOperation> {
    let mut out = Vec::new();
    collect_into(&submodel.submodel_elements, &submodel.id, "", &mut out);
    out
}

fn collect_into(
    elements: &[SubmodelElement],
    submodel_id: &str,
    prefix: &str,
    out: &mut Vec<DiscoveredOperation>,
) {
    for element in elements {
        let Some(id_short) = element.id_short() else {
            continue;
        };
        let path = if prefix.is_empty() {
            id_short.to_string()
        } else {
            format!("{prefix}/{id_short}")
        };
        match element {
            SubmodelElement::Operation(op) => out.push(DiscoveredOperation {
                submodel_id: submodel_id.to_string(),
                path,
                operation: op.clone(),
            }),
            SubmodelElement::SubmodelElementCollection(c) => {
                collect_into(&c.value, submodel_id, &path, out);
            }
            _ => {}
        }
    }
}
