use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Base directory for stored instances and produced archives.
    pub storage_dir: PathBuf,

    // =========================
    // Study aggregation
    // =========================
    /// Quiet period per study, in seconds.
    ///
    /// Every stored instance resets the study's deadline to now + this
    /// value; the study is pushed only once the period elapses with no new
    /// arrivals.
    ///
    /// There is no protocol-level "study finished" signal, so this is a
    /// heuristic:
    /// - too low => studies split across several archives
    /// - too high => delivery latency on every study
    pub idle_timeout_secs: u64,

    // =========================
    // Transmission
    // =========================
    /// Upload endpoint receiving the archive via POST.
    pub api_endpoint: String,

    /// Bearer token for the upload endpoint.
    pub api_key: String,

    /// Maximum delivery attempts per dispatch.
    ///
    /// Bounds how long a study stays in flight when the endpoint is down.
    /// On exhaustion the study directory and archive remain on disk for
    /// manual recovery.
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds. Doubles on each
    /// subsequent attempt (1s, 2s, 4s, ...).
    pub backoff_base_ms: u64,

    /// Per-request HTTP bound, in seconds. Prevents a hung upload from
    /// pinning a dispatch indefinitely.
    pub request_timeout_secs: u64,

    // =========================
    // Archive handling
    // =========================
    /// Optional XChaCha20-Poly1305 key, 64 hex characters. When set, the
    /// archive is sealed before transmission; the digest header always
    /// covers the plaintext archive.
    pub encryption_key_hex: Option<String>,

    /// Remove the study directory after a confirmed send. Off by default:
    /// losing data is worse than leaking disk.
    pub delete_after_send: bool,

    // =========================
    // Lifecycle
    // =========================
    /// How long shutdown waits for in-flight dispatches before giving up,
    /// in seconds.
    pub shutdown_grace_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("API_KEY").context("API_KEY must be set")?;

        let api_endpoint = std::env::var("API_ENDPOINT")
            .unwrap_or_else(|_| "https://api.example.com".to_string());

        let storage_dir = std::env::var("STORAGE_DIR")
            .unwrap_or_else(|_| "/tmp/dicom_storage".to_string())
            .into();

        let encryption_key_hex = std::env::var("ENCRYPTION_KEY").ok();

        Ok(Self {
            storage_dir,
            idle_timeout_secs: env_u64("IDLE_TIMEOUT_SECS", 60),
            api_endpoint,
            api_key,
            max_retries: env_u32("MAX_RETRIES", 5),
            backoff_base_ms: env_u64("BACKOFF_BASE_MS", 1_000),
            request_timeout_secs: env_u64("REQUEST_TIMEOUT_SECS", 30),
            encryption_key_hex,
            delete_after_send: env_bool("DELETE_AFTER_SEND"),
            shutdown_grace_secs: env_u64("SHUTDOWN_GRACE_SECS", 20),
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
