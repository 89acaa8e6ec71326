// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event-bus client for twin repository events.
//!
//! The twin publishes created/updated/deleted notifications for shells and
//! submodels over MQTT; [`topics`] implements the topic grammar and
//! [`client`] the connection with exponential-backoff reconnect, message
//! handlers, and reconnect hooks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod topics;

pub use client::{BusConfig, BusMessage, ConnectionStats, EventBusClient, MessageHandler, ReconnectHandler};
pub use topics::{
    BusEventKind, ParsedTopic, RepoKind, Subscription, aas_subscriptions, element_update_topic,
    parse_topic, split_subscriptions, submodel_subscriptions,
};
