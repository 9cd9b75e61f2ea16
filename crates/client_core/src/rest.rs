use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use reqwest::{multipart, Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shared::{
    domain::{BrowserKey, MessageId},
    error::ChatError,
    protocol::{
        EditMessageResponse, HistoryPage, RegisterBrowserResponse, RemoteAppConfig,
        SendMessageResponse, UpdateBrowserResponse, UpdateUserDataResponse, UploadResponse,
    },
};

use crate::signature;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(20_000);

const SIGNATURE_HEADER: &str = "X-Chat-Signature";
const APP_KEY_HEADER: &str = "X-Chat-App-Key";
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Invoked with (bytes sent so far, total bytes) as each upload chunk goes
/// out.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Serialize)]
struct RegisterBrowserRequest<'a> {
    chat_app_key: &'a str,
    user_data: &'a HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct UpdateBrowserRequest<'a> {
    chat_app_key: &'a str,
    browser_key: &'a str,
    user_data: &'a HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct UpdateUserDataRequest<'a> {
    chat_app_key: &'a str,
    browser_key: &'a str,
    data: &'a HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_app_key: &'a str,
    browser_key: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a HashMap<String, Value>>,
}

#[derive(Debug, Serialize)]
struct EditMessageRequest<'a> {
    chat_app_key: &'a str,
    browser_key: &'a str,
    message_id: i64,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct GetMessagesRequest<'a> {
    chat_app_key: &'a str,
    browser_key: &'a str,
    page: u32,
    per_page: u32,
}

/// Typed REST operations against the chat backend. Every request carries the
/// app-key signature and times out after the configured duration.
pub struct RestGateway {
    http: Client,
    base_url: String,
    app_key: String,
    signature: String,
}

impl RestGateway {
    pub fn new(
        base_url: &str,
        app_key: &str,
        app_secret: &str,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ChatError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            signature: signature::sign(app_key, app_secret),
        })
    }

    pub async fn get_config(&self) -> Result<RemoteAppConfig, ChatError> {
        let response = self
            .http
            .get(format!("{}/config", self.base_url))
            .query(&[("key", self.app_key.as_str()), ("sig", self.signature.as_str())])
            .send()
            .await
            .map_err(request_error)?;
        decode(response).await
    }

    pub async fn register_browser(
        &self,
        user_data: &HashMap<String, Value>,
        endpoint: Option<&str>,
    ) -> Result<RegisterBrowserResponse, ChatError> {
        self.post_json(
            "/register-browser",
            &RegisterBrowserRequest {
                chat_app_key: &self.app_key,
                user_data,
                endpoint,
            },
        )
        .await
    }

    pub async fn update_browser(
        &self,
        browser_key: &BrowserKey,
        user_data: &HashMap<String, Value>,
    ) -> Result<UpdateBrowserResponse, ChatError> {
        self.post_json(
            "/browser/update",
            &UpdateBrowserRequest {
                chat_app_key: &self.app_key,
                browser_key: &browser_key.0,
                user_data,
            },
        )
        .await
    }

    /// Merge-only profile update; the server preserves unspecified fields.
    pub async fn update_user_data(
        &self,
        browser_key: &BrowserKey,
        data: &HashMap<String, Value>,
    ) -> Result<UpdateUserDataResponse, ChatError> {
        self.post_json(
            "/browser/update-data",
            &UpdateUserDataRequest {
                chat_app_key: &self.app_key,
                browser_key: &browser_key.0,
                data,
            },
        )
        .await
    }

    pub async fn send_message(
        &self,
        browser_key: &BrowserKey,
        message: &str,
        endpoint: Option<&str>,
        metadata: Option<&HashMap<String, Value>>,
    ) -> Result<SendMessageResponse, ChatError> {
        self.post_json(
            "/send-message",
            &SendMessageRequest {
                chat_app_key: &self.app_key,
                browser_key: &browser_key.0,
                message,
                endpoint,
                metadata,
            },
        )
        .await
    }

    pub async fn edit_message(
        &self,
        browser_key: &BrowserKey,
        message_id: MessageId,
        content: &str,
    ) -> Result<EditMessageResponse, ChatError> {
        self.post_json(
            "/edit-message",
            &EditMessageRequest {
                chat_app_key: &self.app_key,
                browser_key: &browser_key.0,
                message_id: message_id.0,
                content,
            },
        )
        .await
    }

    pub async fn get_messages(
        &self,
        browser_key: &BrowserKey,
        page: u32,
        per_page: u32,
    ) -> Result<HistoryPage, ChatError> {
        self.post_json(
            "/messages",
            &GetMessagesRequest {
                chat_app_key: &self.app_key,
                browser_key: &browser_key.0,
                page: page.max(1),
                per_page,
            },
        )
        .await
    }

    /// Streams the payload as a multipart upload, reporting progress per
    /// chunk. A cancellation observed before the response arrives wins over
    /// completion.
    pub async fn upload_attachment(
        &self,
        browser_key: &BrowserKey,
        bytes: Vec<u8>,
        filename: &str,
        endpoint: Option<&str>,
        progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
    ) -> Result<UploadResponse, ChatError> {
        let cancel = cancel.unwrap_or_default();
        let total = bytes.len() as u64;

        let chunks: Vec<Vec<u8>> = bytes
            .chunks(UPLOAD_CHUNK_SIZE)
            .map(<[u8]>::to_vec)
            .collect();
        let sent = Arc::new(AtomicU64::new(0));
        let stream_cancel = cancel.clone();
        let body_stream = futures::stream::iter(chunks).map(move |chunk| {
            if stream_cancel.is_cancelled() {
                return Err(std::io::Error::other("upload cancelled"));
            }
            let sent_so_far = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                + chunk.len() as u64;
            if let Some(report) = &progress {
                report(sent_so_far, total);
            }
            Ok(chunk)
        });

        let part = multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(body_stream),
            total,
        )
        .file_name(filename.to_string());
        let mut form = multipart::Form::new()
            .text("chat_app_key", self.app_key.clone())
            .text("browser_key", browser_key.0.clone());
        if let Some(endpoint) = endpoint {
            form = form.text("endpoint", endpoint.to_string());
        }
        let form = form.part("image", part);

        debug!(filename, total, "uploading attachment");
        let request = self
            .http
            .post(format!("{}/upload-image", self.base_url))
            .header(SIGNATURE_HEADER, &self.signature)
            .header(APP_KEY_HEADER, &self.app_key)
            .multipart(form)
            .send();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ChatError::UploadCancelled),
            response = request => {
                let response = response.map_err(|err| {
                    if cancel.is_cancelled() {
                        ChatError::UploadCancelled
                    } else {
                        request_error(err)
                    }
                })?;
                decode(response).await
            }
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ChatError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header(SIGNATURE_HEADER, &self.signature)
            .header(APP_KEY_HEADER, &self.app_key)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ChatError> {
    let status = response.status();
    let body = response.text().await.map_err(request_error)?;
    if !status.is_success() {
        return Err(ChatError::Server {
            status: status.as_u16(),
            message: extract_server_message(status, &body),
        });
    }
    serde_json::from_str(&body)
        .map_err(|err| ChatError::MalformedResponse(err.to_string()))
}

/// Extraction precedence for a structured error body: a single `error`
/// field, else joined values of a validation `errors` map, else a generic
/// `message`, else a fallback naming the HTTP status.
fn extract_server_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return error.to_string();
        }
        if let Some(errors) = value.get("errors").and_then(Value::as_object) {
            let joined = errors
                .values()
                .flat_map(|entry| match entry {
                    Value::String(message) => vec![message.clone()],
                    Value::Array(messages) => messages
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            if !joined.is_empty() {
                return joined;
            }
        }
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    format!("request failed with HTTP status {status}")
}

fn request_error(err: reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::Timeout
    } else {
        ChatError::Network(err.to_string())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
