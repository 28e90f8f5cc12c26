//! Bot API wire types and the HTTP transport.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Server-side long-poll timeout of `getUpdates`.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_LIMIT: u32 = 100;
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

// client deadline on top of the long-poll so the server answers first
const POLL_MARGIN: Duration = Duration::from_secs(5);

pub const UPDATE_TYPE_MESSAGE: &str = "message";
pub const CHAT_TYPE_PRIVATE: &str = "private";
pub const PARSE_MODE_MARKDOWN_V2: &str = "MarkdownV2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub limit: u32,
    pub timeout: u64,
    pub allowed_updates: Vec<String>,
}

impl GetUpdates {
    pub fn new(offset: Option<i64>, timeout: Duration) -> Self {
        Self {
            offset,
            limit: POLL_LIMIT,
            timeout: timeout.as_secs(),
            allowed_updates: vec![UPDATE_TYPE_MESSAGE.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessage {
    pub chat_id: i64,
    pub text: String,
    pub parse_mode: String,
    pub disable_notification: bool,
}

impl SendMessage {
    /// Quiet MarkdownV2 message.
    pub fn markdown(chat_id: i64, text: String) -> Self {
        Self {
            chat_id,
            text,
            parse_mode: PARSE_MODE_MARKDOWN_V2.to_string(),
            disable_notification: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("request failed with code {status}: {body}")]
    Status { status: u16, body: String },
    #[error("can't decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api error: {0}")]
    Api(String),
    #[error("empty result")]
    EmptyResult,
}

impl ChatError {
    fn http(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ChatError::Timeout;
        }
        // the url carries the bot token
        ChatError::Http(e.without_url())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ChatError::Timeout)
    }
}

/// Long-poll fetch and send of text messages.
pub trait ChatTransport: Send + Sync {
    fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Update>, ChatError>> + Send;

    fn send_message(
        &self,
        request: &SendMessage,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ChatError::http)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call<I, O>(&self, method: &str, body: &I, timeout: Duration) -> Result<O, ChatError>
    where
        I: Serialize + Sync + ?Sized,
        O: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(ChatError::http)?;

        let status = resp.status();
        let raw = resp.bytes().await.map_err(ChatError::http)?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&raw).into_owned();
            warn!(method, status = status.as_u16(), response = %body, "http error");
            return Err(ChatError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let out: ApiResponse<O> = serde_json::from_slice(&raw)?;
        if !out.ok {
            return Err(ChatError::Api(out.description.unwrap_or_default()));
        }
        out.result.ok_or(ChatError::EmptyResult)
    }
}

impl ChatTransport for HttpChatApi {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, ChatError> {
        let body = GetUpdates::new(offset, timeout);
        self.call("getUpdates", &body, timeout + POLL_MARGIN).await
    }

    async fn send_message(&self, request: &SendMessage) -> Result<Message, ChatError> {
        self.call("sendMessage", request, SEND_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_updates_body_omits_missing_offset() {
        let first = serde_json::to_value(GetUpdates::new(None, POLL_TIMEOUT)).unwrap();
        assert_eq!(
            first,
            serde_json::json!({"limit": 100, "timeout": 10, "allowed_updates": ["message"]})
        );

        let next = serde_json::to_value(GetUpdates::new(Some(43), POLL_TIMEOUT)).unwrap();
        assert_eq!(next["offset"], 43);
    }

    #[test]
    fn decodes_update_with_private_chat() {
        let raw = r#"{"ok":true,"result":[{"update_id":7,"message":{"message_id":1,
            "from":{"id":42,"is_bot":false},"chat":{"id":42,"type":"private"},
            "text":"/hw_usage"}}]}"#;
        let resp: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let update = &resp.result.unwrap()[0];
        let msg = update.message.as_ref().unwrap();
        assert_eq!(msg.from.as_ref().unwrap().id, 42);
        assert_eq!(msg.chat.kind, CHAT_TYPE_PRIVATE);
        assert_eq!(msg.text, "/hw_usage");
    }

    #[test]
    fn send_message_is_quiet_markdown() {
        let body = serde_json::to_value(SendMessage::markdown(5, "hi".into())).unwrap();
        assert_eq!(body["parse_mode"], "MarkdownV2");
        assert_eq!(body["disable_notification"], true);
        assert_eq!(body["chat_id"], 5);
    }

    #[test]
    fn method_url_strips_trailing_slash() {
        let api = HttpChatApi::new("http://localhost:8081/", "T0KEN").unwrap();
        assert_eq!(api.method_url("getMe"), "http://localhost:8081/botT0KEN/getMe");
    }
}
