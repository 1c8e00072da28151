use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use oauth2::{AccessToken, ClientId, ClientSecret};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// Position of a session in the registration → authorization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Unregistered,
    Registered,
    Authorized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Authorized => "authorized",
        })
    }
}

/// Application credentials handed out by the registration endpoint.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub client_id: ClientId,
    pub client_secret: ClientSecret,
}

/// A bearer token together with the moment it was granted.
///
/// Keeping both in one value means a session can never hold a token without
/// its timestamp, or the other way around.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub access_token: AccessToken,
    pub authorized_at: DateTime<Utc>,
}

/// Registration and authorization state of one client.
///
/// Only [`Client::register`](crate::Client::register) and
/// [`Client::authorize`](crate::Client::authorize) change a session, each at
/// most once.
///
/// Credentials are only valid on the instance that issued them, so the
/// session records that instance and every later request goes there.
#[derive(Debug, Clone)]
pub struct Session {
    name: String,
    scopes: Vec<String>,
    instance: Url,
    credentials: Option<AppCredentials>,
    authorization: Option<Authorization>,
}

impl Session {
    pub(crate) fn new(name: String, scopes: Vec<String>, instance: Url) -> Self {
        Self {
            name,
            scopes,
            instance,
            credentials: None,
            authorization: None,
        }
    }

    pub(crate) fn resume(
        mut self,
        credentials: Option<AppCredentials>,
        authorization: Option<Authorization>,
    ) -> Self {
        self.credentials = credentials;
        self.authorization = authorization;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested scopes, in the order they were configured.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// The instance all requests of this session are sent to.
    pub fn instance(&self) -> &Url {
        &self.instance
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.credentials.as_ref().map(|c| &c.client_id)
    }

    pub fn client_secret(&self) -> Option<&ClientSecret> {
        self.credentials.as_ref().map(|c| &c.client_secret)
    }

    pub fn credentials(&self) -> Option<&AppCredentials> {
        self.credentials.as_ref()
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.authorization.as_ref().map(|a| &a.access_token)
    }

    pub fn authorized_at(&self) -> Option<DateTime<Utc>> {
        self.authorization.as_ref().map(|a| a.authorized_at)
    }

    pub fn state(&self) -> SessionState {
        if self.authorization.is_some() {
            SessionState::Authorized
        } else if self.credentials.is_some() {
            SessionState::Registered
        } else {
            SessionState::Unregistered
        }
    }

    pub(crate) fn set_credentials(&mut self, credentials: AppCredentials, instance: Url) {
        if self.credentials.is_none() {
            self.credentials = Some(credentials);
            self.instance = instance;
        }
    }

    pub(crate) fn set_authorization(&mut self, authorization: Authorization) {
        if self.authorization.is_none() {
            self.authorization = Some(authorization);
        }
    }
}

/// Canonical form of a scope set: sorted, deduplicated, space separated.
pub fn normalize_scopes<I, S>(scopes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut scopes: Vec<String> = scopes
        .into_iter()
        .flat_map(|s| {
            s.as_ref()
                .split_whitespace()
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect();
    scopes.sort();
    scopes.dedup();
    scopes.join(" ")
}

/// Parse the `created_at` of a token response.
///
/// The service sends unix seconds; RFC 3339 strings are accepted as well.
pub(crate) fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| Error::Timestamp(n.to_string())),
        Value::String(s) => {
            if let Ok(secs) = s.parse::<i64>() {
                return parse_timestamp(&Value::from(secs));
            }
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Timestamp(format!("{s}: {e}")))
        }
        other => Err(Error::Timestamp(other.to_string())),
    }
}
