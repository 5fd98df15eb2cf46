use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::extract::{ASSISTANT_TURN_SELECTOR, USER_TURN_SELECTOR};

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(100);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Navigation gets a little longer than the render deadline so that the
/// deadline, not the HTTP client, reports the timeout.
const NAVIGATION_SLACK: Duration = Duration::from_secs(1);

const CHROME_ARGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--no-sandbox",
    "--disable-dev-shm-usage",
];

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to launch webdriver `{driver}`: {source}")]
    Launch {
        driver: String,
        #[source]
        source: std::io::Error,
    },
    #[error("webdriver not ready: {0}")]
    DriverNotReady(String),
    #[error("webdriver error `{error}`: {message}")]
    WebDriver { error: String, message: String },
    #[error("webdriver request failed: {0}")]
    Transport(String),
    #[error("messages did not appear within {0:?}")]
    Timeout(Duration),
    #[error("render cancelled by caller")]
    Cancelled,
    #[error("render task failed: {0}")]
    Task(String),
}

impl From<reqwest::Error> for RenderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RenderError::Transport(format!("TimeoutError: {}", e))
        } else if e.is_connect() {
            RenderError::Transport(format!("ConnectError: {}", e))
        } else {
            RenderError::Transport(format!("RequestError: {}", e))
        }
    }
}

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
}

/// Renders a page in a fresh headless browser and returns its HTML once
/// both user and assistant messages are present.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage, RenderError>;
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Driver binary spawned per render, e.g. `chromedriver`.
    pub driver_path: String,
    /// Extra arguments placed before `--port=N`.
    pub driver_args: Vec<String>,
    /// Port handed to the spawned driver; a free one is picked when unset.
    pub driver_port: Option<u16>,
    /// Attach to an already running driver instead of spawning one.
    pub webdriver_url: Option<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Limit for single WebDriver commands. Navigation uses the render
    /// deadline instead.
    pub request_timeout: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            driver_path: "chromedriver".to_string(),
            driver_args: Vec::new(),
            driver_port: None,
            webdriver_url: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

// ── WebDriver renderer ───────────────────────────────────────────────────────

pub struct WebDriverRenderer {
    config: RendererConfig,
    client: Client,
}

impl WebDriverRenderer {
    pub fn new(config: RendererConfig) -> Result<Self, RenderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl PageRenderer for WebDriverRenderer {
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage, RenderError> {
        let job = RenderJob {
            config: self.config.clone(),
            client: self.client.clone(),
            url: url.to_string(),
            timeout,
        };

        // The job runs detached so its cleanup survives this future being
        // dropped; dropping `_cancel` tells it to stop early.
        let (_cancel, cancelled) = oneshot::channel::<()>();
        tokio::spawn(job.run(cancelled))
            .await
            .unwrap_or_else(|e| Err(RenderError::Task(e.to_string())))
    }
}

// ── Render job ───────────────────────────────────────────────────────────────

struct RenderJob {
    config: RendererConfig,
    client: Client,
    url: String,
    timeout: Duration,
}

impl RenderJob {
    async fn run(self, mut cancelled: oneshot::Receiver<()>) -> Result<RenderedPage, RenderError> {
        let started = Instant::now();
        let result = match self.config.webdriver_url.clone() {
            Some(base_url) => self.render_with(&base_url, &mut cancelled).await,
            None => self.render_spawned(&mut cancelled).await,
        };

        match &result {
            Ok(page) => info!(
                url = %self.url,
                bytes = page.html.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "rendered page"
            ),
            Err(e) => warn!(url = %self.url, error = %e, "render failed"),
        }
        result
    }

    async fn render_with(
        &self,
        base_url: &str,
        cancelled: &mut oneshot::Receiver<()>,
    ) -> Result<RenderedPage, RenderError> {
        let session = Session::create(&self.client, base_url).await?;
        let result = tokio::select! {
            result = session.capture(&self.url, self.timeout, self.config.poll_interval) => result,
            _ = cancelled => Err(RenderError::Cancelled),
        };
        session.delete().await;
        result
    }

    async fn render_spawned(
        &self,
        cancelled: &mut oneshot::Receiver<()>,
    ) -> Result<RenderedPage, RenderError> {
        let mut driver = DriverProcess::spawn(&self.config)?;
        let ready = tokio::select! {
            ready = driver.wait_ready(&self.client, self.config.startup_timeout) => ready,
            _ = &mut *cancelled => Err(RenderError::Cancelled),
        };
        let result = match ready {
            Ok(()) => {
                let base_url = driver.base_url.clone();
                self.render_with(&base_url, cancelled).await
            }
            Err(e) => Err(e),
        };
        driver.shutdown().await;
        result
    }
}

// ── Browser session ──────────────────────────────────────────────────────────

struct Session<'a> {
    client: &'a Client,
    base_url: String,
    id: String,
}

impl<'a> Session<'a> {
    async fn create(client: &'a Client, base_url: &str) -> Result<Session<'a>, RenderError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": CHROME_ARGS },
                }
            }
        });
        let value = command(client, Method::POST, &format!("{}/session", base_url), Some(body)).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::WebDriver {
                error: "invalid response".to_string(),
                message: "new session response has no sessionId".to_string(),
            })?
            .to_string();
        debug!(session = %id, "created browser session");
        Ok(Session {
            client,
            base_url,
            id,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}/{}", self.base_url, self.id, path)
    }

    async fn capture(
        &self,
        url: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<RenderedPage, RenderError> {
        let navigate = self
            .client
            .post(self.endpoint("url"))
            .timeout(timeout.saturating_add(NAVIGATION_SLACK));

        tokio::time::timeout(timeout, async {
            send(navigate, Some(json!({ "url": url }))).await?;
            self.wait_for_messages(poll_interval).await
        })
        .await
        .map_err(|_| RenderError::Timeout(timeout))??;

        let source = command(self.client, Method::GET, &self.endpoint("source"), None).await?;
        let html = match source {
            Value::String(html) => html,
            other => {
                return Err(RenderError::WebDriver {
                    error: "invalid response".to_string(),
                    message: format!("page source is not a string: {}", other),
                })
            }
        };

        Ok(RenderedPage {
            url: url.to_string(),
            html,
        })
    }

    async fn wait_for_messages(&self, poll_interval: Duration) -> Result<(), RenderError> {
        loop {
            if self.has_element(USER_TURN_SELECTOR).await?
                && self.has_element(ASSISTANT_TURN_SELECTOR).await?
            {
                return Ok(());
            }
            sleep(poll_interval).await;
        }
    }

    async fn has_element(&self, css: &str) -> Result<bool, RenderError> {
        let found = command(
            self.client,
            Method::POST,
            &self.endpoint("elements"),
            Some(json!({ "using": "css selector", "value": css })),
        )
        .await?;
        Ok(found.as_array().map_or(false, |els| !els.is_empty()))
    }

    async fn delete(self) {
        let url = format!("{}/session/{}", self.base_url, self.id);
        match command(self.client, Method::DELETE, &url, None).await {
            Ok(_) => debug!(session = %self.id, "deleted browser session"),
            Err(e) => warn!(session = %self.id, error = %e, "failed to delete browser session"),
        }
    }
}

/// Send one WebDriver command and unwrap the `value` member of the reply.
async fn command(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, RenderError> {
    send(client.request(method, url), body).await
}

async fn send(mut request: RequestBuilder, body: Option<Value>) -> Result<Value, RenderError> {
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let mut payload: Value = response.json().await?;
    let value = payload.get_mut("value").map(Value::take).unwrap_or(Value::Null);

    if !status.is_success() {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        return Err(RenderError::WebDriver {
            error: field("error"),
            message: field("message"),
        });
    }
    Ok(value)
}

// ── Driver process ───────────────────────────────────────────────────────────

struct DriverProcess {
    child: Child,
    base_url: String,
}

impl DriverProcess {
    fn spawn(config: &RendererConfig) -> Result<Self, RenderError> {
        let launch_err = |source| RenderError::Launch {
            driver: config.driver_path.clone(),
            source,
        };
        let port = match config.driver_port {
            Some(port) => port,
            None => free_port().map_err(launch_err)?,
        };
        let child = Command::new(&config.driver_path)
            .args(&config.driver_args)
            .arg(format!("--port={}", port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;
        debug!(pid = child.id(), port, "spawned webdriver");

        Ok(Self {
            child,
            base_url: format!("http://127.0.0.1:{}", port),
        })
    }

    async fn wait_ready(&mut self, client: &Client, timeout: Duration) -> Result<(), RenderError> {
        let deadline = Instant::now() + timeout;
        let status_url = format!("{}/status", self.base_url);
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(RenderError::DriverNotReady(format!(
                    "driver exited early ({})",
                    status
                )));
            }
            if let Ok(resp) = client.get(&status_url).send().await {
                if let Ok(body) = resp.json::<Value>().await {
                    if body["value"]["ready"].as_bool() == Some(true) {
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(RenderError::DriverNotReady(format!(
                    "no ready status within {:?}",
                    timeout
                )));
            }
            sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    /// Kill and reap the driver. SIGKILL does not reach the browser the
    /// driver launched, so the session must be deleted before this.
    async fn shutdown(mut self) {
        let pid = self.child.id();
        match self.child.kill().await {
            Ok(()) => debug!(pid, "stopped webdriver"),
            Err(e) => debug!(pid, error = %e, "webdriver already stopped"),
        }
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
