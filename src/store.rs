//! Persistence boundary (§3 `Store`, ambient C13).
//!
//! The CORE talks to persistence only through the [`Store`] trait so the selector, tracker and
//! server never depend on how upstream identity or settings happen to be kept. The concrete
//! [`MemoryStore`] shipped here seeds itself from the parsed [`AppConfig`] and keeps everything
//! in memory for the lifetime of the process — there is no admin/management surface on top of
//! it, just the read/write operations the CORE itself needs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::{AppConfig, RotationMethod};
use crate::errors::CoreError;
use crate::model::{RequestRecord, Upstream, UpstreamId, UpstreamStatus};

/// Rotation and inbound-facing settings, reloadable as a unit (§3, §9 `ReloadSettings`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub rotation_method: RotationMethod,
    pub time_based_interval_s: u64,
    pub remove_unhealthy: bool,
    pub fallback: bool,
    pub fallback_max_retries: usize,
    pub follow_redirect: bool,
    pub timeout_s: u64,
    pub retries: usize,
    pub allowed_protocols: std::collections::HashSet<crate::model::Scheme>,
    pub max_response_time_ms: u64,
    pub min_success_rate: f64,
    pub auth_enabled: bool,
    pub auth_username: String,
    pub auth_password: String,
    pub rate_limit_enabled: bool,
    pub rate_limit_interval_s: u64,
    pub rate_limit_max_requests: u64,
    pub healthcheck_timeout_s: u64,
    pub healthcheck_workers: usize,
    pub healthcheck_url: String,
    pub healthcheck_expected_status: u16,
    pub healthcheck_headers: Vec<(String, String)>,
    pub healthcheck_interval_s: u64,
}

impl Settings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            rotation_method: config.rotation.method,
            time_based_interval_s: config.rotation.time_based_interval_s,
            remove_unhealthy: config.rotation.remove_unhealthy,
            fallback: config.rotation.fallback,
            fallback_max_retries: config.rotation.fallback_max_retries,
            follow_redirect: config.rotation.follow_redirect,
            timeout_s: config.rotation.timeout_s,
            retries: config.rotation.retries,
            allowed_protocols: config.rotation.allowed_schemes(),
            max_response_time_ms: config.rotation.max_response_time_ms,
            min_success_rate: config.rotation.min_success_rate,
            auth_enabled: config.auth.enabled,
            auth_username: config.auth.username.clone(),
            auth_password: config.auth.password.clone(),
            rate_limit_enabled: config.rate_limit.enabled,
            rate_limit_interval_s: config.rate_limit.interval_s,
            rate_limit_max_requests: config.rate_limit.max_requests,
            healthcheck_timeout_s: config.healthcheck.timeout_s,
            healthcheck_workers: config.healthcheck.workers,
            healthcheck_url: config.healthcheck.url.clone(),
            healthcheck_expected_status: config.healthcheck.expected_status,
            healthcheck_headers: config.healthcheck.parsed_headers(),
            healthcheck_interval_s: config.healthcheck.interval_s,
        }
    }
}

/// The CORE's sole persistence seam. Every method is async so a real backing store (database,
/// remote KV) can be dropped in without touching callers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_upstreams(&self) -> Result<Vec<Arc<Upstream>>, CoreError>;
    async fn get_upstream(&self, id: UpstreamId) -> Result<Arc<Upstream>, CoreError>;
    async fn update_upstream_status(
        &self,
        id: UpstreamId,
        status: UpstreamStatus,
    ) -> Result<(), CoreError>;
    async fn get_settings(&self) -> Result<Settings, CoreError>;
    async fn update_settings(&self, settings: Settings) -> Result<(), CoreError>;
    async fn record_request(&self, record: RequestRecord) -> Result<(), CoreError>;
}

pub struct MemoryStore {
    upstreams: Mutex<HashMap<UpstreamId, Arc<Upstream>>>,
    next_id: Mutex<u64>,
    settings: Mutex<Settings>,
    history: Mutex<Vec<RequestRecord>>,
    history_cap: usize,
}

impl MemoryStore {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mut upstreams = HashMap::new();
        let mut next_id = 1u64;

        for entry in &config.upstreams {
            let scheme = entry
                .scheme
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let id = UpstreamId(next_id);
            next_id += 1;
            let upstream = Arc::new(
                Upstream::new(id, entry.address.clone(), scheme)
                    .with_credentials(entry.username.clone(), entry.password.clone()),
            );
            upstreams.insert(id, upstream);
        }

        if let Some(path) = &config.server.upstreams_path {
            for (line_no, line) in read_lines(Path::new(path))?.into_iter().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let parsed = Upstream::from_line(line)
                    .map_err(|e| anyhow::anyhow!("{path}:{}: {e}", line_no + 1))?;
                let id = UpstreamId(next_id);
                next_id += 1;
                upstreams.insert(
                    id,
                    Arc::new(Upstream {
                        id,
                        ..parsed
                    }),
                );
            }
        }

        if upstreams.is_empty() {
            anyhow::bail!("no upstreams loaded from config or upstreams_path");
        }

        Ok(Self {
            upstreams: Mutex::new(upstreams),
            next_id: Mutex::new(next_id),
            settings: Mutex::new(Settings::from_config(config)),
            history: Mutex::new(Vec::new()),
            history_cap: 10_000,
        })
    }
}

fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read upstreams file {}: {e}", path.to_string_lossy()))?;
    Ok(content.lines().map(|l| l.to_string()).collect())
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_upstreams(&self) -> Result<Vec<Arc<Upstream>>, CoreError> {
        let upstreams = self.upstreams.lock().expect("poisoned");
        Ok(upstreams.values().cloned().collect())
    }

    async fn get_upstream(&self, id: UpstreamId) -> Result<Arc<Upstream>, CoreError> {
        let upstreams = self.upstreams.lock().expect("poisoned");
        upstreams
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::StoreFatal(format!("unknown upstream id {id}")))
    }

    async fn update_upstream_status(
        &self,
        id: UpstreamId,
        status: UpstreamStatus,
    ) -> Result<(), CoreError> {
        let upstream = self.get_upstream(id).await?;
        upstream.stats.set_status(status);
        Ok(())
    }

    async fn get_settings(&self) -> Result<Settings, CoreError> {
        Ok(self.settings.lock().expect("poisoned").clone())
    }

    async fn update_settings(&self, settings: Settings) -> Result<(), CoreError> {
        *self.settings.lock().expect("poisoned") = settings;
        Ok(())
    }

    async fn record_request(&self, record: RequestRecord) -> Result<(), CoreError> {
        let mut history = self.history.lock().expect("poisoned");
        history.push(record);
        if history.len() > self.history_cap {
            let overflow = history.len() - self.history_cap;
            history.drain(0..overflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> AppConfig {
        AppConfig::from_toml_str(
            r#"
[server]
listen = ["127.0.0.1:8080"]

[[upstream]]
address = "127.0.0.1:9001"
scheme = "http"

[[upstream]]
address = "127.0.0.1:9002"
scheme = "socks5"
username = "alice"
password = "secret"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn seeds_upstreams_from_inline_config() {
        let store = MemoryStore::from_config(&base_config()).unwrap();
        let upstreams = store.list_upstreams().await.unwrap();
        assert_eq!(upstreams.len(), 2);
    }

    #[tokio::test]
    async fn loads_additional_upstreams_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http://10.0.0.5:8888").unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "socks4a://10.0.0.6:1080").unwrap();

        let mut config = base_config();
        config.server.upstreams_path = Some(file.path().to_string_lossy().to_string());

        let store = MemoryStore::from_config(&config).unwrap();
        let upstreams = store.list_upstreams().await.unwrap();
        assert_eq!(upstreams.len(), 4);
    }

    #[tokio::test]
    async fn update_settings_round_trips() {
        let store = MemoryStore::from_config(&base_config()).unwrap();
        let mut settings = store.get_settings().await.unwrap();
        settings.retries = 7;
        store.update_settings(settings).await.unwrap();
        assert_eq!(store.get_settings().await.unwrap().retries, 7);
    }

    #[tokio::test]
    async fn unknown_upstream_id_errors() {
        let store = MemoryStore::from_config(&base_config()).unwrap();
        let err = store.get_upstream(UpstreamId(9999)).await.unwrap_err();
        assert!(matches!(err, CoreError::StoreFatal(_)));
    }
}
