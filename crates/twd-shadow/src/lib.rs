// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shadow state manager: a live, eventually-consistent replica of twin state.
//!
//! Initialization is a strict sequence: subscriptions and handlers are
//! installed on the bus client *before* the first HTTP snapshot, so an event
//! observed after the snapshot is never missed — it is either reflected in
//! the snapshot or applied afterwards and overwrites it. Every failed event
//! application and every bus reconnection triggers a full resync.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use twd_bus::{BusEventKind, BusMessage, EventBusClient, ParsedTopic, RepoKind, parse_topic, split_subscriptions};
use twd_twin::{TwinClient, TwinError};
use twd_types::{
    DiscoveredOperation, Shell, Submodel, SubmodelElement, collect_operations, find_element,
    property_value, replace_element,
};

/// Errors from shadow operations.
#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    /// The snapshot or resync HTTP call failed.
    #[error(transparent)]
    Twin(#[from] TwinError),
    /// An event payload could not be decoded.
    #[error("event payload decode failed: {0}")]
    Payload(#[from] serde_json::Error),
    /// An element-scoped event addressed a path the replica does not have.
    #[error("element path {path} not found in submodel {submodel_id}")]
    UnknownPath {
        /// Target submodel.
        submodel_id: String,
        /// Missing idShort path.
        path: String,
    },
}

/// Identity of the twin the shadow tracks.
#[derive(Debug, Clone)]
pub struct ShadowConfig {
    /// Shell id to replicate.
    pub aas_id: String,
    /// Repository id for shell-repository topics.
    pub aas_repo_id: String,
    /// Repository id for submodel-repository topics; defaults to the shell's.
    pub submodel_repo_id: Option<String>,
}

impl ShadowConfig {
    fn submodel_repo_id(&self) -> &str {
        self.submodel_repo_id.as_deref().unwrap_or(&self.aas_repo_id)
    }
}

#[derive(Debug, Default)]
struct ShadowState {
    shell: Option<Shell>,
    submodels: BTreeMap<String, Submodel>,
    last_sync: Option<Instant>,
    last_update: BTreeMap<String, Instant>,
}

/// Thread-safe eventually-consistent replica of the twin.
///
/// One mutex guards the whole state; every query deep-copies its result so
/// callers never hold the lock across their own work.
pub struct ShadowManager {
    twin: Arc<TwinClient>,
    config: ShadowConfig,
    state: Mutex<ShadowState>,
    initialized: AtomicBool,
    event_count: AtomicU64,
}

impl ShadowManager {
    /// Create an empty shadow for the given twin.
    #[must_use]
    pub fn new(twin: Arc<TwinClient>, config: ShadowConfig) -> Self {
        Self {
            twin,
            config,
            state: Mutex::new(ShadowState::default()),
            initialized: AtomicBool::new(false),
            event_count: AtomicU64::new(0),
        }
    }

    /// Install bus subscriptions and handlers, then take the first snapshot.
    ///
    /// Must be called before the bus client is started, so no event can slip
    /// between handler installation and the snapshot.
    ///
    /// # Errors
    ///
    /// Fails when the initial snapshot cannot be fetched.
    pub async fn initialize(self: &Arc<Self>, bus: &Arc<EventBusClient>) -> Result<(), ShadowError> {
        info!(
            aas_id = %self.config.aas_id,
            aas_repo_id = %self.config.aas_repo_id,
            submodel_repo_id = %self.config.submodel_repo_id(),
            "initializing shadow"
        );

        bus.set_subscriptions(split_subscriptions(
            &self.config.aas_repo_id,
            self.config.submodel_repo_id(),
        ));

        let on_message = Arc::clone(self);
        bus.add_handler(Arc::new(move |message: BusMessage| {
            let shadow = Arc::clone(&on_message);
            Box::pin(async move { shadow.handle_bus_message(&message).await })
        }));

        let on_reconnect = Arc::clone(self);
        bus.add_reconnect_handler(Arc::new(move || {
            let shadow = Arc::clone(&on_reconnect);
            Box::pin(async move {
                info!(aas_id = %shadow.config.aas_id, "bus reconnected, resyncing shadow");
                if let Err(err) = shadow.full_sync().await {
                    error!(error = %err, "post-reconnect resync failed");
                }
            })
        }));

        self.full_sync().await?;
        self.initialized.store(true, Ordering::Release);

        let state = self.state.lock().await;
        info!(
            aas_id = %self.config.aas_id,
            submodel_count = state.submodels.len(),
            "shadow initialized"
        );
        Ok(())
    }

    /// Whether the initial snapshot completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of bus events processed.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Seconds since the last sync or applied update; infinite before the
    /// first snapshot.
    pub async fn freshness_seconds(&self) -> f64 {
        let state = self.state.lock().await;
        state
            .last_sync
            .map_or(f64::INFINITY, |t| t.elapsed().as_secs_f64())
    }

    /// Seconds since a specific submodel was last updated; infinite if it is
    /// not tracked.
    pub async fn submodel_freshness(&self, submodel_id: &str) -> f64 {
        let state = self.state.lock().await;
        state
            .last_update
            .get(submodel_id)
            .map_or(f64::INFINITY, |t| t.elapsed().as_secs_f64())
    }

    /// Fetch the complete twin over HTTP and replace the replica.
    ///
    /// # Errors
    ///
    /// Propagates twin client failures; the previous state is kept on error.
    pub async fn full_sync(&self) -> Result<(), ShadowError> {
        let mut state = self.state.lock().await;
        let snapshot = self.twin.get_full_twin(&self.config.aas_id).await?;
        let now = Instant::now();
        state.last_update = snapshot.submodels.keys().map(|id| (id.clone(), now)).collect();
        state.shell = Some(snapshot.shell);
        state.submodels = snapshot.submodels;
        state.last_sync = Some(now);
        debug!(submodel_count = state.submodels.len(), "full sync completed");
        Ok(())
    }

    /// Process one raw bus message.
    ///
    /// Foreign topics and repositories are dropped; a failed application
    /// falls open toward correctness by forcing a full resync.
    pub async fn handle_bus_message(&self, message: &BusMessage) {
        let Some(parsed) = parse_topic(&message.topic) else {
            return;
        };
        let expected = match parsed.repo_kind {
            RepoKind::AasRepository => self.config.aas_repo_id.as_str(),
            RepoKind::SubmodelRepository => self.config.submodel_repo_id(),
        };
        if parsed.repo_id != expected {
            return;
        }

        self.event_count.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.apply_event(&parsed, &message.payload).await {
            warn!(
                topic = %message.topic,
                error = %err,
                "failed to apply event, triggering resync"
            );
            if let Err(err) = self.full_sync().await {
                error!(error = %err, "resync after failed event application failed");
            }
        }
    }

    async fn apply_event(&self, parsed: &ParsedTopic, payload: &[u8]) -> Result<(), ShadowError> {
        let mut state = self.state.lock().await;
        match parsed.repo_kind {
            RepoKind::AasRepository => Self::apply_shell_event(&mut state, &self.config, parsed, payload)?,
            RepoKind::SubmodelRepository => {
                Self::apply_submodel_event(&mut state, parsed, payload)?;
            }
        }
        Ok(())
    }

    fn apply_shell_event(
        state: &mut ShadowState,
        config: &ShadowConfig,
        parsed: &ParsedTopic,
        payload: &[u8],
    ) -> Result<(), ShadowError> {
        match &parsed.entity_id {
            None => {
                // Collection-level event; only a creation of our shell matters.
                if parsed.event == BusEventKind::Created {
                    let shell: Shell = serde_json::from_slice(payload)?;
                    if shell.id == config.aas_id {
                        state.shell = Some(shell);
                        state.last_sync = Some(Instant::now());
                    }
                }
            }
            Some(entity_id) if entity_id == &config.aas_id => match parsed.event {
                BusEventKind::Created | BusEventKind::Updated => {
                    state.shell = Some(serde_json::from_slice(payload)?);
                    state.last_sync = Some(Instant::now());
                    debug!(aas_id = %config.aas_id, "shell updated from bus");
                }
                BusEventKind::Deleted => {
                    state.shell = None;
                    warn!(aas_id = %config.aas_id, "shell deleted from bus");
                }
            },
            Some(_) => {}
        }
        Ok(())
    }

    fn apply_submodel_event(
        state: &mut ShadowState,
        parsed: &ParsedTopic,
        payload: &[u8],
    ) -> Result<(), ShadowError> {
        let Some(submodel_id) = parsed.entity_id.clone() else {
            return Ok(());
        };
        if !state.submodels.contains_key(&submodel_id) {
            // Not referenced by our shell; nothing to patch.
            return Ok(());
        }

        match parsed.event {
            BusEventKind::Deleted => {
                state.submodels.remove(&submodel_id);
                state.last_update.remove(&submodel_id);
                debug!(submodel_id = %submodel_id, "submodel deleted from bus");
                return Ok(());
            }
            BusEventKind::Updated => {
                if let Some(path) = &parsed.element_path {
                    let element: SubmodelElement = serde_json::from_slice(payload)?;
                    let Some(submodel) = state.submodels.get_mut(&submodel_id) else {
                        return Ok(());
                    };
                    if !replace_element(&mut submodel.submodel_elements, path, element) {
                        return Err(ShadowError::UnknownPath {
                            submodel_id,
                            path: path.clone(),
                        });
                    }
                } else {
                    let submodel: Submodel = serde_json::from_slice(payload)?;
                    state.submodels.insert(submodel_id.clone(), submodel);
                }
            }
            BusEventKind::Created => return Ok(()),
        }

        let now = Instant::now();
        state.last_update.insert(submodel_id.clone(), now);
        state.last_sync = Some(now);
        debug!(
            submodel_id = %submodel_id,
            element_path = parsed.element_path.as_deref().unwrap_or(""),
            "submodel updated from bus"
        );
        Ok(())
    }

    // -- Query interface ----------------------------------------------------

    /// Snapshot of the shell.
    pub async fn get_shell(&self) -> Option<Shell> {
        self.state.lock().await.shell.clone()
    }

    /// Snapshot of one submodel.
    pub async fn get_submodel(&self, submodel_id: &str) -> Option<Submodel> {
        self.state.lock().await.submodels.get(submodel_id).cloned()
    }

    /// Snapshot of every tracked submodel.
    pub async fn get_all_submodels(&self) -> BTreeMap<String, Submodel> {
        self.state.lock().await.submodels.clone()
    }

    /// Walk a `/`-separated path and return the property value.
    pub async fn get_property_value(&self, submodel_id: &str, id_short_path: &str) -> Option<Value> {
        let state = self.state.lock().await;
        let submodel = state.submodels.get(submodel_id)?;
        property_value(&submodel.submodel_elements, id_short_path)
    }

    /// Walk a `/`-separated path and return the whole element.
    pub async fn get_element_by_path(
        &self,
        submodel_id: &str,
        id_short_path: &str,
    ) -> Option<SubmodelElement> {
        let state = self.state.lock().await;
        let submodel = state.submodels.get(submodel_id)?;
        find_element(&submodel.submodel_elements, id_short_path).cloned()
    }

    /// Every operation in every tracked submodel, with its address.
    pub async fn get_operations(&self) -> Vec<DiscoveredOperation> {
        let state = self.state.lock().await;
        state
            .submodels
            .values()
            .flat_map(collect_operations)
            .collect()
    }
}
