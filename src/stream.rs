//! Live event stream over server-sent events.
//!
//! A [`Stream`] is built by [`Client::stream`](crate::Client::stream) with
//! the resolved URL and the session's token. Nothing happens until
//! [`Stream::start`] is awaited; it then reads events until the server closes
//! the connection. Reconnecting is up to the caller.

use std::collections::HashMap;
use std::fmt;

use futures_util::StreamExt;
use log::{debug, trace};
use oauth2::AccessToken;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// One event received from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event name, e.g. `update`, `notification` or `delete`.
    pub name: String,
    /// The event data, decoded as JSON when possible.
    pub payload: Value,
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

pub struct Stream {
    url: Url,
    access_token: Option<AccessToken>,
    http_client: reqwest::Client,
    handlers: HashMap<String, Vec<Handler>>,
    log_target: String,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("url", &self.url.as_str())
            .field("access_token", &self.access_token)
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Stream {
    pub fn new(url: Url, access_token: Option<AccessToken>) -> Self {
        Self {
            url,
            access_token,
            http_client: reqwest::Client::new(),
            handlers: HashMap::new(),
            log_target: env!("CARGO_PKG_NAME").to_string(),
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = http_client;
        self
    }

    #[must_use]
    pub fn with_log_target(mut self, log_target: String) -> Self {
        self.log_target = log_target;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    /// Call `handler` for every event named `event`.
    pub fn on<F>(&mut self, event: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers
            .entry(event.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    fn emit(&self, event: &Event) {
        match self.handlers.get(&event.name) {
            Some(handlers) => handlers.iter().for_each(|handler| handler(event)),
            None => trace!(target: self.log_target.as_str(), "No handler for '{}' event", event.name),
        }
    }

    /// Connect and dispatch events until the server ends the stream.
    pub async fn start(&self) -> Result<()> {
        let mut request = self.http_client.get(self.url.clone());
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token.secret());
        }

        debug!(target: self.log_target.as_str(), "Connecting to stream {}", self.url);
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let mut bytes = response.bytes_stream();
        let mut buffer = Vec::new();
        let mut parser = EventParser::default();

        while let Some(chunk) = bytes.next().await {
            buffer.extend_from_slice(&chunk?);

            // Process complete lines
            while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(event) = parser.feed(line.trim_end_matches(['\r', '\n'])) {
                    trace!(target: self.log_target.as_str(), "Received '{}' event", event.name);
                    self.emit(&event);
                }
            }
        }

        if let Some(event) = parser.finish() {
            self.emit(&event);
        }
        debug!(target: self.log_target.as_str(), "Stream {} closed by server", self.url);
        Ok(())
    }
}

/// Incremental parser for `text/event-stream` framing.
#[derive(Debug, Default)]
pub struct EventParser {
    name: Option<String>,
    data: Vec<String>,
}

impl EventParser {
    /// Feed one line without its terminator. Returns an event once a blank
    /// line completes it.
    pub fn feed(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            return self.finish();
        }
        if line.starts_with(':') {
            // heartbeat
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    /// Flush a pending event, if any.
    pub fn finish(&mut self) -> Option<Event> {
        let name = self.name.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.drain(..).collect::<Vec<_>>().join("\n");
        let payload = serde_json::from_str(&data).unwrap_or_else(|_| Value::String(data));

        Some(Event {
            name: name.unwrap_or_else(|| "message".to_string()),
            payload,
        })
    }
}
