use std::path::PathBuf;
use std::time::Duration;

use crate::render::RendererConfig;

/// Settings shared by `serve` and `scrape`. Every flag falls back to a
/// `CHATLINK_*` environment variable.
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// SQLite database file
    #[arg(long, env = "CHATLINK_DB", default_value = "chatlink.sqlite")]
    pub db_path: PathBuf,

    /// WebDriver binary started for every render
    #[arg(long, env = "CHATLINK_WEBDRIVER", default_value = "chromedriver")]
    pub webdriver: String,

    /// URL of an already running WebDriver server (skips spawning one)
    #[arg(long, env = "CHATLINK_WEBDRIVER_URL")]
    pub webdriver_url: Option<String>,

    /// Seconds to wait for the conversation to appear
    #[arg(long, env = "CHATLINK_RENDER_TIMEOUT_SECS", default_value_t = 100)]
    pub render_timeout_secs: u64,

    /// Comma-separated hosts links may point at; `*` allows any host
    #[arg(
        long,
        env = "CHATLINK_ALLOWED_HOSTS",
        default_value = "chatgpt.com,chat.openai.com"
    )]
    pub allowed_hosts: String,
}

impl Config {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            driver_path: self.webdriver.clone(),
            webdriver_url: self.webdriver_url.clone(),
            ..RendererConfig::default()
        }
    }

    /// Lower-cased host list; empty means any host is accepted.
    pub fn allowed_hosts(&self) -> Vec<String> {
        let hosts: Vec<String> = self
            .allowed_hosts
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.iter().any(|h| h == "*") {
            return Vec::new();
        }
        hosts
    }
}
