//! Shared controller context

use crate::config::OperatorConfig;
use crate::store::{KubeStore, ResourceStore};
use kube::Client;
use std::sync::Arc;

/// Shared context for all controllers.
pub struct Context {
    pub client: Client,
    pub store: Arc<dyn ResourceStore>,
    pub config: OperatorConfig,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
        Self {
            client,
            store,
            config,
        }
    }
}
