// SPDX-License-Identifier: MIT OR Apache-2.0

//! Topic grammar for twin repository events.
//!
//! ```text
//! aas-repository/<repoId>/shells[/<idB64u>]/{created|updated|deleted}
//! submodel-repository/<repoId>/submodels/<idB64u>[/submodelElements/<idShort-path>]/{created|updated|deleted}
//! ```
//!
//! Entity identifiers inside topics are unpadded URL-safe Base64.

use std::str::FromStr;
use twd_types::b64url_encode;

/// Event verb at the end of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEventKind {
    /// Entity was created.
    Created,
    /// Entity was updated.
    Updated,
    /// Entity was deleted.
    Deleted,
}

impl BusEventKind {
    /// The lowercase verb as it appears in topics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for BusEventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            _ => Err(()),
        }
    }
}

/// Which repository kind a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoKind {
    /// The shell repository.
    AasRepository,
    /// The submodel repository.
    SubmodelRepository,
}

impl FromStr for RepoKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aas-repository" => Ok(Self::AasRepository),
            "submodel-repository" => Ok(Self::SubmodelRepository),
            _ => Err(()),
        }
    }
}

/// A decoded topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    /// Repository kind.
    pub repo_kind: RepoKind,
    /// Repository scope id.
    pub repo_id: String,
    /// Event verb.
    pub event: BusEventKind,
    /// Decoded entity id for per-entity events; `None` at collection level.
    pub entity_id: Option<String>,
    /// idShort path for element-scoped submodel events.
    pub element_path: Option<String>,
}

/// A topic subscription with its QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter, possibly with wildcards.
    pub topic: String,
    /// MQTT QoS level (0, 1 or 2).
    pub qos: u8,
}

/// Subscriptions covering every shell event in a repository.
#[must_use]
pub fn aas_subscriptions(repo_id: &str) -> Vec<Subscription> {
    vec![Subscription {
        topic: format!("aas-repository/{repo_id}/shells/#"),
        qos: 0,
    }]
}

/// Subscriptions covering every submodel event in a repository.
#[must_use]
pub fn submodel_subscriptions(repo_id: &str) -> Vec<Subscription> {
    vec![Subscription {
        topic: format!("submodel-repository/{repo_id}/submodels/#"),
        qos: 0,
    }]
}

/// Subscriptions for deployments with separate shell and submodel repo ids.
#[must_use]
pub fn split_subscriptions(aas_repo_id: &str, submodel_repo_id: &str) -> Vec<Subscription> {
    let mut subs = aas_subscriptions(aas_repo_id);
    subs.extend(submodel_subscriptions(submodel_repo_id));
    subs
}

/// Build the topic announcing an element update inside a submodel.
#[must_use]
pub fn element_update_topic(repo_id: &str, submodel_id: &str, element_path: &str) -> String {
    let encoded = b64url_encode(submodel_id);
    format!("submodel-repository/{repo_id}/submodels/{encoded}/submodelElements/{element_path}/updated")
}

/// Parse a topic into its components.
///
/// Returns `None` for topics outside the grammar. An entity id that fails
/// Base64 decoding is kept verbatim, since some brokers republish raw ids.
#[must_use]
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 4 {
        return None;
    }
    let repo_kind: RepoKind = parts[0].parse().ok()?;
    let repo_id = parts[1].to_string();

    if parts.len() == 4 {
        // Collection-level event, e.g. aas-repository/<id>/shells/created.
        let event: BusEventKind = parts[3].parse().ok()?;
        return Some(ParsedTopic {
            repo_kind,
            repo_id,
            event,
            entity_id: None,
            element_path: None,
        });
    }

    let entity_id = twd_types::b64url_decode(parts[3]).unwrap_or_else(|_| parts[3].to_string());

    let mut event_index = 4;
    let mut element_path = None;
    if parts.len() > 5 && parts[4] == "submodelElements" {
        event_index = parts.len() - 1;
        element_path = Some(parts[5..event_index].join("/"));
    }

    let event: BusEventKind = parts[event_index].parse().ok()?;
    Some(ParsedTopic {
        repo_kind,
        repo_id,
        event,
        entity_id: Some(entity_id),
        element_path,
    })
}
