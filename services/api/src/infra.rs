use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};
use transport_enrollment::config::{AppConfig, StoreConfig};
use transport_enrollment::enrollment::{
    InMemoryEntityStore, NotificationError, Notifier, StaticIdentityProvider, TemplateKey,
};
use transport_enrollment::error::AppError;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Writes outbound messages to the log; stands in for a mail gateway.
#[derive(Debug, Default, Clone)]
pub(crate) struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        email: &str,
        template: TemplateKey,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError> {
        if !email.contains('@') {
            return Err(NotificationError::Rejected(email.to_string()));
        }
        info!(
            email,
            template = template.key(),
            ?variables,
            "notification sent"
        );
        Ok(())
    }
}

/// Opens the snapshot-backed store when a path is configured, otherwise a volatile one.
pub(crate) async fn open_store(config: &StoreConfig) -> Result<InMemoryEntityStore, AppError> {
    match &config.path {
        Some(path) => Ok(InMemoryEntityStore::open(path, config.timeout).await?),
        None => {
            warn!("ENROLLMENT_STORE_PATH not set; enrollment data lives in memory only");
            Ok(InMemoryEntityStore::new(config.timeout))
        }
    }
}

pub(crate) fn identity_provider(config: &AppConfig) -> StaticIdentityProvider {
    let provider = StaticIdentityProvider::new(config.tokens.iter().cloned());
    if provider.is_empty() {
        warn!("ENROLLMENT_TOKENS is empty; every authenticated route will answer 401");
    }
    provider
}
