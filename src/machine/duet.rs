//! HTTP client for Duet controllers running RepRapFirmware 2 or 3.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{MachineControl, MachineError, MachinePosition, MachineStatus};

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Free command buffer slots required before sending on RRF3 standalone boards.
const MIN_BUFFER_SPACE: u64 = 150;

/// Buffer polls before giving up on waiting for free space.
const MAX_BUFFER_POLLS: u32 = 10;

/// Which HTTP API the controller exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `rr_*` endpoints served by the board itself. `session` is set for
    /// RRF3 on standalone boards, which need `rr_connect` around requests
    /// and a free command buffer before G-code is posted.
    Legacy { session: bool },
    /// DuetSoftwareFramework on a single-board computer (`/machine/*`).
    Dsf,
}

/// Configuration for the controller connection.
#[derive(Debug, Clone)]
pub struct DuetConfig {
    pub base_url: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts.
    pub retry_delay: Duration,
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            password: "reprap".to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl DuetConfig {
    /// Create a config for the given controller URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Client for a Duet board or DuetSoftwareFramework host.
pub struct DuetClient {
    config: DuetConfig,
    client: Client,
    flavor: ApiFlavor,
    firmware: String,
}

impl DuetClient {
    /// Connect and detect the firmware flavour.
    ///
    /// Tries the legacy `rr_status` endpoint first and falls back to
    /// `/machine/status`.
    pub async fn connect(config: DuetConfig) -> Result<Self, MachineError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        info!(url = %config.base_url, "connecting to controller");

        let mut this = Self {
            config,
            client,
            flavor: ApiFlavor::Dsf,
            firmware: String::new(),
        };

        match this.get_json("/rr_status?type=2").await {
            Ok(status) if status.get("coords").is_some() => {
                let _ = this.get_text("/rr_reply").await;
                let name = status["firmwareName"].as_str().unwrap_or("RepRapFirmware");
                let version = status["firmwareVersion"].as_str().unwrap_or("");
                let rrf2 = version.is_empty() || version.starts_with('2');
                if version.is_empty() {
                    warn!("unknown board and firmware combination, assuming RRF2");
                }
                this.flavor = ApiFlavor::Legacy { session: !rrf2 };
                this.firmware = format!("{} {}", name, version).trim().to_string();
                info!(firmware = %this.firmware, flavor = ?this.flavor, "connected");
                return Ok(this);
            }
            Ok(_) => debug!("rr_status reply has no coordinates"),
            Err(e) => debug!(error = %e, "rr_status not available"),
        }

        match this.get_json("/machine/status").await {
            Ok(status) => {
                let status = unwrap_result(status);
                if let Some(board) = status.pointer("/boards/0") {
                    let name = board["firmwareName"].as_str().unwrap_or("RepRapFirmware");
                    let version = board["firmwareVersion"].as_str().unwrap_or("");
                    this.flavor = ApiFlavor::Dsf;
                    this.firmware = format!("{} {}", name, version).trim().to_string();
                    info!(firmware = %this.firmware, "connected via DuetSoftwareFramework");
                    return Ok(this);
                }
                Err(MachineError::UnsupportedFirmware(this.config.base_url.clone()))
            }
            Err(e) => {
                debug!(error = %e, "machine/status not available");
                Err(MachineError::UnsupportedFirmware(this.config.base_url.clone()))
            }
        }
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    /// Firmware name and version reported at connect time.
    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn needs_session(&self) -> bool {
        matches!(self.flavor, ApiFlavor::Legacy { session: true })
    }

    /// Fetch the full status document for the current flavour.
    async fn status_document(&self) -> Result<Value, MachineError> {
        match self.flavor {
            ApiFlavor::Legacy { .. } => {
                self.open_session().await?;
                let status = self.get_json("/rr_status?type=2").await;
                let _ = self.get_text("/rr_reply").await;
                self.close_session().await;
                status
            }
            ApiFlavor::Dsf => self.get_json("/machine/status").await.map(unwrap_result),
        }
    }

    async fn open_session(&self) -> Result<(), MachineError> {
        if !self.needs_session() {
            return Ok(());
        }
        let path = format!("/rr_connect?password={}", self.config.password);
        self.get_text(&path).await.map(|_| ())
    }

    async fn close_session(&self) {
        if self.needs_session() {
            if let Err(e) = self.get_text("/rr_disconnect").await {
                debug!(error = %e, "rr_disconnect failed");
            }
        }
    }

    /// Wait for free space in the firmware's command buffer.
    async fn wait_for_buffer(&self) {
        for _ in 0..MAX_BUFFER_POLLS {
            let space = self
                .get_json("/rr_gcode")
                .await
                .ok()
                .and_then(|v| v["buff"].as_u64())
                .unwrap_or(0);
            let _ = self.get_text("/rr_reply").await;
            if space >= MIN_BUFFER_SPACE {
                return;
            }
            debug!(space, "command buffer low, delaying");
            sleep(Duration::from_millis(600)).await;
        }
        warn!("command buffer did not drain, sending anyway");
    }

    async fn get_json(&self, path: &str) -> Result<Value, MachineError> {
        let text = self.get_text(path).await?;
        serde_json::from_str(&text).map_err(|e| MachineError::ParseError(e.to_string()))
    }

    async fn get_text(&self, path: &str) -> Result<String, MachineError> {
        let url = format!("{}{}", self.config.base_url, path);
        let (client, url) = (&self.client, &url);
        self.with_retries(|| async move {
            let response = client.get(url).send().await?;
            Self::into_text(response).await
        })
        .await
    }

    async fn post_text(&self, path: &str, body: &str) -> Result<String, MachineError> {
        let url = format!("{}{}", self.config.base_url, path);
        let (client, url) = (&self.client, &url);
        self.with_retries(|| async move {
            let response = client.post(url).body(body.to_string()).send().await?;
            Self::into_text(response).await
        })
        .await
    }

    async fn into_text(response: reqwest::Response) -> Result<String, MachineError> {
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(MachineError::CommandRejected {
                code: status.as_u16(),
                reason,
            });
        }
        Ok(response.text().await?)
    }

    /// Run a request, retrying transport failures and 5xx replies.
    async fn with_retries<F, Fut>(&self, mut attempt_fn: F) -> Result<String, MachineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<String, MachineError>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < max_attempts && Self::is_retryable_error(&e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "controller request failed, retrying"
                    );
                    sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check if an error is retryable (network errors, timeouts, server errors).
    fn is_retryable_error(error: &MachineError) -> bool {
        match error {
            MachineError::RequestFailed(_) => true,
            MachineError::CommandRejected { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

impl MachineControl for DuetClient {
    async fn status(&self) -> Result<MachineStatus, MachineError> {
        let doc = self.status_document().await?;
        let raw = match self.flavor {
            ApiFlavor::Legacy { .. } => doc["status"].as_str(),
            ApiFlavor::Dsf => doc.pointer("/state/status").and_then(Value::as_str),
        };
        raw.map(MachineStatus::parse)
            .ok_or_else(|| MachineError::ParseError("status missing from reply".to_string()))
    }

    async fn position(&self) -> Result<MachinePosition, MachineError> {
        let doc = self.status_document().await?;
        match self.flavor {
            ApiFlavor::Legacy { .. } => legacy_position(&doc),
            ApiFlavor::Dsf => dsf_position(&doc),
        }
    }

    async fn current_tool(&self) -> Result<i32, MachineError> {
        let doc = self.status_document().await?;
        let tool = match self.flavor {
            ApiFlavor::Legacy { .. } => doc["currentTool"].as_i64(),
            ApiFlavor::Dsf => doc.pointer("/state/currentTool").and_then(Value::as_i64),
        };
        tool.map(|t| t as i32)
            .ok_or_else(|| MachineError::ParseError("currentTool missing from reply".to_string()))
    }

    async fn tool_offset(&self, tool: u32) -> Result<MachinePosition, MachineError> {
        let doc = self.status_document().await?;
        let letters = match self.flavor {
            ApiFlavor::Legacy { .. } => axis_names(&doc["axisNames"]),
            ApiFlavor::Dsf => dsf_axis_letters(&doc),
        };
        let offset = tool_offsets(&doc, tool, &letters)?;
        debug!(tool, offset = %offset, "tool offset");
        Ok(offset)
    }

    async fn tool_count(&self) -> Result<usize, MachineError> {
        let doc = self.status_document().await?;
        doc["tools"]
            .as_array()
            .map(Vec::len)
            .ok_or_else(|| MachineError::ParseError("tool table missing from reply".to_string()))
    }

    async fn execute(&self, command: &str) -> Result<(), MachineError> {
        debug!(command, "gcode");
        match self.flavor {
            ApiFlavor::Legacy { session } => {
                self.open_session().await?;
                if session {
                    self.wait_for_buffer().await;
                }
                let url = format!("{}/rr_gcode", self.config.base_url);
                let (client, url) = (&self.client, &url);
                let result = self
                    .with_retries(|| async move {
                        let response = client
                            .get(url)
                            .query(&[("gcode", command)])
                            .send()
                            .await?;
                        Self::into_text(response).await
                    })
                    .await;
                let _ = self.get_text("/rr_reply").await;
                self.close_session().await;
                result.map(|_| ())
            }
            ApiFlavor::Dsf => self.post_text("/machine/code", command).await.map(|reply| {
                if !reply.trim().is_empty() {
                    debug!(reply = %reply.trim(), "controller reply");
                }
            }),
        }
    }

    async fn query_model(&self, keys: &[&str]) -> Result<Value, MachineError> {
        match self.flavor {
            ApiFlavor::Legacy { .. } => {
                self.open_session().await?;
                let path = format!("/rr_model?key={}", keys.join("."));
                let reply = self.get_json(&path).await;
                self.close_session().await;
                let reply = unwrap_result(reply?);
                if reply.is_null() {
                    return Err(MachineError::ModelKeyMissing(keys.join(".")));
                }
                Ok(reply)
            }
            ApiFlavor::Dsf => {
                let doc = self.status_document().await?;
                walk_model(&doc, keys).cloned()
            }
        }
    }
}

/// Unwrap the `{"result": ...}` envelope some endpoints add.
fn unwrap_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Axis names from an RRF2 reply, which sends either `"XYZ"` or `["X","Y","Z"]`.
fn axis_names(value: &Value) -> Vec<char> {
    match value {
        Value::String(s) => s.chars().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().and_then(|s| s.chars().next()))
            .collect(),
        _ => vec!['X', 'Y', 'Z'],
    }
}

fn dsf_axis_letters(doc: &Value) -> Vec<char> {
    doc.pointer("/move/axes")
        .and_then(Value::as_array)
        .map(|axes| {
            axes.iter()
                .filter_map(|a| a["letter"].as_str().and_then(|s| s.chars().next()))
                .collect()
        })
        .unwrap_or_default()
}

fn legacy_position(doc: &Value) -> Result<MachinePosition, MachineError> {
    let coords = doc
        .pointer("/coords/xyz")
        .and_then(Value::as_array)
        .ok_or_else(|| MachineError::ParseError("coords.xyz missing from reply".to_string()))?;
    let names = axis_names(&doc["axisNames"]);
    Ok(MachinePosition::from_pairs(
        names
            .into_iter()
            .zip(coords.iter())
            .filter_map(|(axis, v)| v.as_f64().map(|v| (axis, v))),
    ))
}

fn dsf_position(doc: &Value) -> Result<MachinePosition, MachineError> {
    let axes = doc
        .pointer("/move/axes")
        .and_then(Value::as_array)
        .ok_or_else(|| MachineError::ParseError("move.axes missing from reply".to_string()))?;
    Ok(MachinePosition::from_pairs(axes.iter().filter_map(|axis| {
        let letter = axis["letter"].as_str()?.chars().next()?;
        Some((letter, axis["userPosition"].as_f64()?))
    })))
}

fn tool_offsets(doc: &Value, tool: u32, letters: &[char]) -> Result<MachinePosition, MachineError> {
    let offsets = doc["tools"]
        .get(tool as usize)
        .and_then(|t| t["offsets"].as_array())
        .ok_or(MachineError::UnknownTool(tool))?;
    Ok(MachinePosition::from_pairs(
        letters
            .iter()
            .copied()
            .zip(offsets.iter())
            .filter_map(|(axis, v)| v.as_f64().map(|v| (axis, v))),
    ))
}

pub(super) fn walk_model<'a>(doc: &'a Value, keys: &[&str]) -> Result<&'a Value, MachineError> {
    let mut current = doc;
    for key in keys {
        let next = match current {
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => current.get(*key),
        };
        current = next.ok_or_else(|| MachineError::ModelKeyMissing(keys.join(".")))?;
    }
    Ok(current)
}
