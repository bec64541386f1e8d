use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Local;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::FeishuConfig;
use crate::record::Record;

use super::table;

const TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";
const UPLOAD_PATH: &str = "/open-apis/drive/v1/files/upload_all";
const MESSAGE_PATH: &str = "/open-apis/im/v1/messages";

/// Tokens are refreshed this long before the server-reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Posts each write as a CSV file attachment to a Feishu chat.
pub struct FeishuSink {
    cfg: FeishuConfig,
    base_url: String,
    http: reqwest::Client,
    token: Option<CachedToken>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    expire: u64,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct UploadData {
    file_key: String,
}

impl FeishuSink {
    pub fn new(cfg: &FeishuConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building Feishu HTTP client")?;

        Ok(Self {
            cfg: cfg.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http,
            token: None,
        })
    }

    pub fn name(&self) -> &str {
        "feishu"
    }

    pub async fn write(&mut self, metric: &str, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let token = self.access_token().await.context("obtaining access token")?;
        let content = table::render(&records).context("rendering CSV attachment")?;
        let file_name = format!("{metric}_{}.csv", Local::now().format("%Y%m%d%H%M%S"));

        let file_key = self
            .upload(&token, &file_name, content)
            .await
            .with_context(|| format!("uploading {file_name}"))?;

        self.send_message(&token, metric, &file_key)
            .await
            .context("sending file message")?;

        info!(metric, records = records.len(), file = %file_name, "posted CSV to Feishu");

        Ok(())
    }

    /// Nothing is held locally; close only drops the cached token.
    pub async fn close(&mut self) -> Result<()> {
        self.token = None;
        Ok(())
    }

    async fn access_token(&mut self) -> Result<String> {
        if let Some(token) = &self.token {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}{TOKEN_PATH}", self.base_url);
        let resp: TokenResponse = self
            .http
            .post(&url)
            .json(&json!({
                "app_id": self.cfg.app_id,
                "app_secret": self.cfg.app_secret,
            }))
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("decoding token response")?;

        if resp.code != 0 {
            bail!("token request failed: {} (code {})", resp.msg, resp.code);
        }

        let lifetime = Duration::from_secs(resp.expire);
        self.token = Some(CachedToken {
            value: resp.tenant_access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });

        debug!(expires_in = resp.expire, "refreshed Feishu tenant token");

        Ok(resp.tenant_access_token)
    }

    async fn upload(&self, token: &str, file_name: &str, content: Vec<u8>) -> Result<String> {
        let size = content.len();
        let part = Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str("text/csv")?;

        let form = Form::new()
            .text("file_name", file_name.to_string())
            .text("parent_type", "explorer")
            .text("parent_node", "")
            .text("size", size.to_string())
            .text("file_type", "csv")
            .part("file", part);

        let url = format!("{}{UPLOAD_PATH}", self.base_url);
        let resp: ApiEnvelope<UploadData> = self
            .http
            .post(&url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .json()
            .await
            .context("decoding upload response")?;

        if resp.code != 0 {
            bail!("upload failed: {} (code {})", resp.msg, resp.code);
        }

        resp.data
            .map(|d| d.file_key)
            .filter(|key| !key.is_empty())
            .context("upload response has no file_key")
    }

    async fn send_message(&self, token: &str, metric: &str, file_key: &str) -> Result<()> {
        let content = json!({
            "file_key": file_key,
            "title": message_title(&self.cfg.message_title, metric),
        });

        let url = format!("{}{MESSAGE_PATH}", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(&[("receive_id_type", self.cfg.receive_id_type.as_str())])
            .bearer_auth(token)
            .json(&json!({
                "receive_id": self.cfg.receive_id,
                "msg_type": "file",
                "content": content.to_string(),
            }))
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("message send failed with status {status}: {}", body.trim());
        }

        let resp: ApiEnvelope<serde_json::Value> =
            response.json().await.context("decoding message response")?;
        if resp.code != 0 {
            bail!("message send failed: {} (code {})", resp.msg, resp.code);
        }

        Ok(())
    }
}

fn message_title(prefix: &str, metric: &str) -> String {
    format!("{prefix} - {metric}")
}
