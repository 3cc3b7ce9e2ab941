use std::time::Duration;

use serde::Deserialize;

use crate::domain::StageModel;

const DEFAULT_STAGES: &str = "INQUIRY,PROPOSAL,BOOKED,COMPLETED";

/// Board server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub cors_origin: String,
    pub stages: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let stages: Vec<String> = std::env::var("PIPELINE_STAGES")
            .unwrap_or_else(|_| DEFAULT_STAGES.into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        // Reject a malformed pipeline up front rather than at first request.
        StageModel::from_ids(&stages)?;

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(21547),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:pipeline.db".into()),
            cors_origin: std::env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:21548,http://127.0.0.1:21548".into()),
            stages,
        })
    }

    pub fn stage_model(&self) -> Result<StageModel, anyhow::Error> {
        Ok(StageModel::from_ids(&self.stages)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 21547,
            database_url: "sqlite:pipeline.db".into(),
            cors_origin: "http://localhost:21548,http://127.0.0.1:21548".into(),
            stages: DEFAULT_STAGES.split(',').map(String::from).collect(),
        }
    }
}

/// Settings for one client sync session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub ws_url: String,
    pub session_id: String,
    pub request_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let defaults = Self::default();
        let api_url =
            std::env::var("PIPELINE_API_URL").unwrap_or_else(|_| defaults.api_url.clone());
        let ws_url = std::env::var("PIPELINE_WS_URL").unwrap_or_else(|_| derive_ws_url(&api_url));

        Ok(Self {
            api_url,
            ws_url,
            session_id: std::env::var("PIPELINE_SESSION_ID")
                .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
            request_timeout: env_duration_secs("PIPELINE_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            reconnect_initial: env_duration_ms("PIPELINE_RECONNECT_INITIAL_MS")
                .unwrap_or(defaults.reconnect_initial),
            reconnect_max: env_duration_ms("PIPELINE_RECONNECT_MAX_MS")
                .unwrap_or(defaults.reconnect_max),
        })
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let api_url = "http://127.0.0.1:21547".to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            session_id: uuid::Uuid::new_v4().to_string(),
            request_timeout: Duration::from_secs(15),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// `http://host:port` → `ws://host:port/ws/board`.
pub fn derive_ws_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/board")
}

fn env_duration_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
