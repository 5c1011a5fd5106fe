//! Inbound surface of the relay.
//!
//! The protocol listener (an external service that speaks the acquisition
//! protocol and validates instances) calls `handle_instance` once per
//! received instance and acknowledges at the protocol level based on the
//! synchronous result. Dispatch is always asynchronous relative to this
//! call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::config::AppConfig;
use crate::dispatch::{ArchiveCipher, DispatchPipeline, HttpArchiveSender, RetryPolicy};
use crate::error::RelayError;
use crate::session::tracker::StudyTracker;
use crate::storage::{InstanceKey, InstanceStore};

pub struct Relay {
    store: InstanceStore,
    tracker: Arc<StudyTracker>,
}

impl Relay {
    pub fn new(store: InstanceStore, tracker: Arc<StudyTracker>) -> Self {
        Self { store, tracker }
    }

    /// Wires the production pipeline from configuration.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let cipher = cfg
            .encryption_key_hex
            .as_deref()
            .map(ArchiveCipher::from_hex)
            .transpose()?;

        let sender = Arc::new(HttpArchiveSender::new(
            cfg.api_endpoint.clone(),
            cfg.api_key.clone(),
            cfg.request_timeout(),
        )?);

        let pipeline = DispatchPipeline::new(
            cfg.storage_dir.clone(),
            sender,
            RetryPolicy::new(cfg.max_retries, cfg.backoff_base()),
            cipher,
            cfg.delete_after_send,
        );

        let tracker = StudyTracker::new(cfg.idle_timeout(), Arc::new(pipeline));
        let store = InstanceStore::new(cfg.storage_dir.clone());

        Ok(Self::new(store, tracker))
    }

    /// Persists one instance and debounces its study's idle deadline.
    ///
    /// Returns the stored path on success (protocol ACK), an error for the
    /// listener to NACK. A storage failure never touches the study timer:
    /// a deadline must only be extended by data that actually hit disk.
    #[instrument(
        skip(self, payload),
        target = "relay",
        fields(study_uid = %key.study_uid, bytes = payload.len())
    )]
    pub async fn handle_instance(
        &self,
        key: &InstanceKey,
        payload: &[u8],
    ) -> Result<PathBuf, RelayError> {
        if !self.tracker.is_accepting() {
            return Err(RelayError::Draining);
        }

        let path = self.store.store(key, payload).await?;
        self.tracker.touch(&key.study_uid);
        Ok(path)
    }

    /// Stops accepting instances and drains in-flight dispatches for up to
    /// `grace`. Pending idle timers are released; their studies stay on
    /// disk for a later rescan.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.shutdown(grace).await;
    }
}
