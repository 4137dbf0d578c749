//! Notifier which publishes to an [ntfy](https://ntfy.sh) topic.

use crate::config::NtfyConfig;
use crate::notify::{Notification, Notifier, Result};
use base64::Engine;
use http::{Client, Method, Request, RequestBuilder, StringResponse};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const USER_AGENT: &str = concat!("imap-ntfy/", env!("CARGO_PKG_VERSION"));

/// Publishes notifications with a plain text body and metadata in headers.
pub struct Ntfy {
    client: Arc<Client>,
}

impl Ntfy {
    /// Create a new instance publishing to the topic in `config`.
    #[must_use]
    pub fn new(config: &NtfyConfig) -> Self {
        let mut builder = Client::builder(config.topic.clone())
            .user_agent(USER_AGENT)
            .request_timeout(config.timeout)
            .connect_timeout(config.timeout);

        if config.topic.scheme() == "http" {
            builder = builder.allow_http();
        }

        if let Some(token) = &config.token {
            builder = builder.bearer_token(SecretString::from(token.expose_secret().to_owned()));
        }

        Self {
            client: builder.build(),
        }
    }
}

impl Notifier for Ntfy {
    fn send(&self, notification: &Notification) -> Result<()> {
        let body = self.client.execute(&PublishRequest(notification))?;
        // Any 2xx is a delivery. Proxies and older servers may answer without the JSON object.
        let id = serde_json::from_str::<Published>(&body)
            .ok()
            .and_then(|published| published.id);
        debug!(
            "Published ntfy message id={}",
            id.as_deref().unwrap_or("<none>")
        );
        Ok(())
    }
}

/// Subset of the message object ntfy replies with.
#[derive(Debug, Deserialize)]
struct Published {
    id: Option<String>,
}

struct PublishRequest<'a>(&'a Notification);

impl Request for PublishRequest<'_> {
    type Response = StringResponse;
    const METHOD: Method = Method::Post;

    fn url(&self) -> String {
        String::new()
    }

    fn build(&self, mut builder: RequestBuilder) -> http::Result<RequestBuilder> {
        let n = self.0;
        if let Some(title) = &n.title {
            builder = builder.header("Title", encode_header(title));
        }
        if let Some(icon) = &n.icon {
            builder = builder.header("Icon", encode_header(icon));
        }
        if !n.tags.is_empty() {
            builder = builder.header("Tags", encode_header(&n.tags.join(",")));
        }
        Ok(builder
            .header("Priority", n.priority.to_string())
            .bytes(n.body.as_bytes().to_vec()))
    }
}

/// HTTP header values must be visible ASCII. ntfy accepts RFC 2047 encoded words for anything
/// else.
fn encode_header(value: &str) -> String {
    if value.bytes().all(|b| b == b' ' || b.is_ascii_graphic()) {
        return value.to_owned();
    }
    format!(
        "=?UTF-8?B?{}?=",
        base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
    )
}
