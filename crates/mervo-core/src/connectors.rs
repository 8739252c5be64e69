//! Connector manifests and the registry that gates enqueueing.
//!
//! A connector is a producer of outbound events. Its manifest declares which
//! event types it may emit; the API refuses to enqueue a delivery attributed
//! to a connector for an event type the manifest does not list.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CoreError, MervoError, Result};

/// Event type that matches every event.
pub const WILDCARD_EVENT: &str = "*";

/// Declaration of a connector's identity and accepted events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorManifest {
    /// Unique connector id.
    pub id: String,
    /// Optional alternate lookup key, e.g. `slack_notifier` for `slack-notifier`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Permissions the connector needs from the host.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Event types the connector emits, or `*`.
    pub supported_events: Vec<String>,
}

impl ConnectorManifest {
    /// Validates required fields.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when the id or name is blank, when
    /// no events are declared, or when an event type is blank.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidInput("connector id is required".to_string()));
        }
        if self.key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(CoreError::InvalidInput(format!("connector {} has a blank key", self.id)));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput(format!("connector {} has no name", self.id)));
        }
        if self.supported_events.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "connector {} declares no supported events",
                self.id
            )));
        }
        if self.supported_events.iter().any(|event| event.trim().is_empty()) {
            return Err(CoreError::InvalidInput(format!(
                "connector {} declares a blank event type",
                self.id
            )));
        }
        Ok(())
    }

    /// Returns true when `reference` is this connector's id or key.
    pub fn answers_to(&self, reference: &str) -> bool {
        self.id == reference || self.key.as_deref() == Some(reference)
    }

    /// Returns true when the manifest lists `event_type` or the wildcard.
    pub fn supports(&self, event_type: &str) -> bool {
        self.supported_events.iter().any(|event| event == WILDCARD_EVENT || event == event_type)
    }
}

/// Registered connectors, shared between request handlers.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    manifests: Arc<RwLock<HashMap<String, ConnectorManifest>>>,
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry holding every manifest in `manifests`.
    ///
    /// # Errors
    ///
    /// Fails on the first manifest [`register`](Self::register) refuses.
    pub async fn from_manifests(
        manifests: impl IntoIterator<Item = ConnectorManifest>,
    ) -> Result<Self> {
        let registry = Self::new();
        for manifest in manifests {
            registry.register(manifest).await?;
        }
        Ok(registry)
    }

    /// Validates and registers a manifest.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for an invalid manifest, or when its
    /// id or key already resolves to a registered connector.
    pub async fn register(&self, manifest: ConnectorManifest) -> Result<()> {
        manifest.validate()?;

        let mut manifests = self.manifests.write().await;
        let taken = manifests.values().find(|existing| {
            existing.answers_to(&manifest.id)
                || manifest.key.as_deref().is_some_and(|key| existing.answers_to(key))
        });
        if let Some(existing) = taken {
            return Err(CoreError::InvalidInput(format!(
                "connector {} collides with registered connector {}",
                manifest.id, existing.id
            )));
        }
        manifests.insert(manifest.id.clone(), manifest);
        Ok(())
    }

    /// Returns the manifest whose id or key is `reference`.
    pub async fn get(&self, reference: &str) -> Option<ConnectorManifest> {
        let manifests = self.manifests.read().await;
        resolve(&manifests, reference).cloned()
    }

    /// Every registered manifest, ordered by id.
    pub async fn list(&self) -> Vec<ConnectorManifest> {
        let mut all: Vec<_> = self.manifests.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Returns true when `connector_id` resolves to a connector that accepts
    /// `event_type`.
    pub async fn accepts(&self, connector_id: &str, event_type: &str) -> bool {
        let manifests = self.manifests.read().await;
        resolve(&manifests, connector_id).is_some_and(|manifest| manifest.supports(event_type))
    }

    /// Checks a producer may enqueue `event_type` for `connector_id`.
    ///
    /// # Errors
    ///
    /// Returns `MervoError::UnsupportedEvent` when the connector is unknown,
    /// the event type is missing, or the manifest does not accept it.
    pub async fn authorize(
        &self,
        connector_id: &str,
        event_type: Option<&str>,
    ) -> std::result::Result<(), MervoError> {
        let event_type = event_type.unwrap_or_default();
        if !event_type.is_empty() && self.accepts(connector_id, event_type).await {
            return Ok(());
        }
        let event_type = if event_type.is_empty() { "<none>" } else { event_type };
        Err(MervoError::UnsupportedEvent {
            connector_id: connector_id.to_string(),
            event_type: event_type.to_string(),
        })
    }
}

fn resolve<'a>(
    manifests: &'a HashMap<String, ConnectorManifest>,
    reference: &str,
) -> Option<&'a ConnectorManifest> {
    manifests
        .get(reference)
        .or_else(|| manifests.values().find(|manifest| manifest.answers_to(reference)))
}
