use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rvh_adapters::{SteamSettings, DEFAULT_STEAM_BASE_URL};
use rvh_storage::HttpClientConfig;
use tracing::warn;

use crate::pool::{OverflowPolicy, WorkerPoolConfig};

#[derive(Debug, Clone)]
pub struct RvhConfig {
    pub database_url: Option<String>,
    pub pages: usize,
    pub per_page: usize,
    pub fan_in_timeout: Duration,
    pub dispatch_workers: usize,
    pub dispatch_queue: usize,
    pub dispatch_overflow: OverflowPolicy,
    pub page_workers: usize,
    pub page_queue: usize,
    pub stub_base_url: String,
    pub steam_base_url: String,
    pub steam_filter: String,
    pub steam_language: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
    pub sources_file: PathBuf,
    pub web_port: u16,
}

impl Default for RvhConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pages: 3,
            per_page: 5,
            fan_in_timeout: Duration::from_secs(10),
            dispatch_workers: 4,
            dispatch_queue: 200,
            dispatch_overflow: OverflowPolicy::RunInline,
            page_workers: 4,
            page_queue: 64,
            stub_base_url: "http://127.0.0.1:8080".to_string(),
            steam_base_url: DEFAULT_STEAM_BASE_URL.to_string(),
            steam_filter: "funny".to_string(),
            steam_language: "russian".to_string(),
            user_agent: "Mozilla/5.0 (compatible; rvh-bot/0.1)".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            schedule_cron: "*/30 * * * * *".to_string(),
            sources_file: PathBuf::from("sources.yaml"),
            web_port: 8080,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable env value");
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

impl RvhConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let web_port = env_parse("RVH_WEB_PORT", d.web_port);
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            pages: env_parse("RVH_PAGES", d.pages),
            per_page: env_parse("RVH_PER_PAGE", d.per_page),
            fan_in_timeout: Duration::from_secs(env_parse(
                "RVH_FAN_IN_TIMEOUT_SECS",
                d.fan_in_timeout.as_secs(),
            )),
            dispatch_workers: env_parse("RVH_DISPATCH_WORKERS", d.dispatch_workers),
            dispatch_queue: env_parse("RVH_DISPATCH_QUEUE", d.dispatch_queue),
            dispatch_overflow: env_parse("RVH_DISPATCH_OVERFLOW", d.dispatch_overflow),
            page_workers: env_parse("RVH_PAGE_WORKERS", d.page_workers),
            page_queue: env_parse("RVH_PAGE_QUEUE", d.page_queue),
            // the stub endpoint lives on our own web port unless pointed elsewhere
            stub_base_url: env_string("RVH_STUB_BASE_URL", format!("http://127.0.0.1:{web_port}")),
            steam_base_url: env_string("RVH_STEAM_BASE_URL", d.steam_base_url),
            steam_filter: env_string("RVH_STEAM_FILTER", d.steam_filter),
            steam_language: env_string("RVH_STEAM_LANGUAGE", d.steam_language),
            user_agent: env_string("RVH_USER_AGENT", d.user_agent),
            http_timeout_secs: env_parse("RVH_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
            scheduler_enabled: std::env::var("RVH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            schedule_cron: env_string("RVH_SCHEDULE_CRON", d.schedule_cron),
            sources_file: std::env::var("RVH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.sources_file),
            web_port,
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn steam(&self) -> SteamSettings {
        SteamSettings {
            base_url: self.steam_base_url.clone(),
            filter: self.steam_filter.clone(),
            language: self.steam_language.clone(),
        }
    }

    pub fn dispatch_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            name: "dispatch".to_string(),
            workers: self.dispatch_workers,
            queue_capacity: self.dispatch_queue,
            overflow: self.dispatch_overflow,
        }
    }

    /// Page fetches never overflow destructively; the collector waits for room.
    pub fn page_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            name: "page".to_string(),
            workers: self.page_workers,
            queue_capacity: self.page_queue,
            overflow: OverflowPolicy::Block,
        }
    }
}
