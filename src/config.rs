//! Configuration: endpoints, their budgets, and request defaults.
//!
//! Loaded from YAML with a fallback chain; every field has a default so a
//! partial file is fine.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TokenlaneError;
use crate::llm::{ChatTransport, EndpointAuth, HttpProxy};
use crate::scheduler::{Manager, TimeoutPolicy, Worker, WorkerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub poll_interval_ms: u64,
    pub window_ms: u64,
    pub defaults: RequestDefaults,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            poll_interval_ms: 100,
            window_ms: 60_000,
            defaults: RequestDefaults::default(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_tokens: 800,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStyle {
    ApiKey,
    Bearer,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub auth: AuthStyle,
    /// Environment variable holding the key or token
    pub api_key_env: Option<String>,
    /// Model to put in the request body, for endpoints that route by body
    pub body_model: Option<String>,
    pub models: Vec<String>,
    pub concurrency: usize,
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u32>,
    pub timeouts_ms: Vec<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            auth: AuthStyle::ApiKey,
            api_key_env: None,
            body_model: None,
            models: Vec::new(),
            concurrency: 4,
            tokens_per_minute: 40_000,
            requests_per_minute: None,
            timeouts_ms: vec![30_000, 60_000, 120_000],
        }
    }
}

impl EndpointConfig {
    /// Resolve credentials from the environment
    pub fn resolve_auth(&self) -> crate::Result<EndpointAuth> {
        if self.auth == AuthStyle::None {
            return Ok(EndpointAuth::None);
        }
        let var = self.api_key_env.as_deref().ok_or_else(|| {
            TokenlaneError::Config(format!("endpoint '{}' needs api_key_env for {:?} auth", self.name, self.auth))
        })?;
        let secret = std::env::var(var)
            .map_err(|_| TokenlaneError::Config(format!("environment variable {} not set", var)))?;

        Ok(match self.auth {
            AuthStyle::ApiKey => EndpointAuth::ApiKey(secret),
            AuthStyle::Bearer => EndpointAuth::Bearer(secret),
            AuthStyle::None => EndpointAuth::None,
        })
    }

    pub fn worker_config(&self, poll_interval: Duration, window: Duration) -> WorkerConfig {
        let mut config = WorkerConfig::new(
            self.name.clone(),
            self.models.iter().cloned(),
            self.concurrency,
            self.tokens_per_minute,
        )
        .with_timeout_policy(TimeoutPolicy::new(
            self.timeouts_ms.iter().copied().map(Duration::from_millis).collect(),
        ))
        .with_poll_interval(poll_interval)
        .with_window(window);
        if let Some(rpm) = self.requests_per_minute {
            config = config.with_requests_per_minute(rpm);
        }
        config
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1))
    }

    /// Default `env_logger` filter; `RUST_LOG` still overrides it
    pub fn log_filter(&self) -> &str {
        self.log_level.as_deref().filter(|l| !l.trim().is_empty()).unwrap_or("info")
    }

    /// Check the endpoint list is usable
    pub fn validate(&self) -> crate::Result<()> {
        if self.endpoints.is_empty() {
            return Err(TokenlaneError::Config("no endpoints configured".to_string()));
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(TokenlaneError::Config("endpoint without a name".to_string()));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(TokenlaneError::Config(format!("duplicate endpoint name '{}'", endpoint.name)));
            }
            if endpoint.url.is_empty() {
                return Err(TokenlaneError::Config(format!("endpoint '{}' has no url", endpoint.name)));
            }
            if endpoint.models.is_empty() {
                return Err(TokenlaneError::Config(format!("endpoint '{}' serves no models", endpoint.name)));
            }
            if endpoint.concurrency == 0 || endpoint.tokens_per_minute == 0 {
                return Err(TokenlaneError::Config(format!(
                    "endpoint '{}' needs non-zero concurrency and tokens_per_minute",
                    endpoint.name
                )));
            }
            if endpoint.requests_per_minute == Some(0) {
                return Err(TokenlaneError::Config(format!(
                    "endpoint '{}' sets requests_per_minute to 0",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }

    /// Build one HTTP-backed worker per endpoint and a manager over them
    pub fn build_manager(&self) -> crate::Result<Arc<Manager>> {
        self.validate()?;

        let mut workers = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let mut proxy = HttpProxy::new(endpoint.url.clone(), endpoint.resolve_auth()?)?;
            if let Some(model) = &endpoint.body_model {
                proxy = proxy.with_model(model.clone());
            }
            let transport: Arc<dyn ChatTransport> = Arc::new(proxy);
            workers.push(Worker::new(
                endpoint.worker_config(self.poll_interval(), self.window()),
                transport,
            ));
        }

        Ok(Manager::new(workers))
    }
}
