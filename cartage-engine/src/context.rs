//! Collaborators shared by every component of one transfer session.

use std::fmt;
use std::sync::Arc;

use cartage_core::{DatabaseAdapter, EventDispatcher, SchemaMapping, TransferConfig};

/// Settings, collaborators and the event dispatcher of a session.
///
/// Cloning is cheap; clones share the adapters and the dispatcher.
#[derive(Clone)]
pub struct TransferContext {
    /// Session settings.
    pub config: TransferConfig,
    /// Feature database.
    pub database: Arc<dyn DatabaseAdapter>,
    /// Names and classification of feature types.
    pub schema: Arc<dyn SchemaMapping>,
    /// Event dispatcher of the session.
    pub events: EventDispatcher,
}

impl fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferContext")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl TransferContext {
    /// Context over `database` and `schema` with a fresh dispatcher.
    pub fn new(
        config: TransferConfig,
        database: Arc<dyn DatabaseAdapter>,
        schema: Arc<dyn SchemaMapping>,
    ) -> Self {
        Self {
            config,
            database,
            schema,
            events: EventDispatcher::new(),
        }
    }

    /// Replace the dispatcher, e.g. to share one with a front end.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Human-readable name of `type_id`, falling back to its number.
    #[must_use]
    pub fn type_name(&self, type_id: cartage_core::FeatureTypeId) -> String {
        self.schema
            .type_name(type_id)
            .unwrap_or_else(|| format!("type {type_id}"))
    }
}
