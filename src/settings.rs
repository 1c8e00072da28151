use chrono::{DateTime, Utc};
use oauth2::{AccessToken, ClientId, ClientSecret};
use serde::Deserialize;
use url::Url;

/// Client configuration.
///
/// `client_id`/`client_secret` and `access_token` let a client resume a
/// session persisted by an earlier run instead of registering again. A
/// resumed `access_token` needs the credentials it was issued to.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub name: String,
    #[serde(default = "default_instance")]
    pub instance: Url,
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub client_secret: Option<ClientSecret>,
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub authorized_at: Option<DateTime<Utc>>,
    /// Log target every diagnostic of this client is emitted under.
    #[serde(default = "default_log_target")]
    pub log_target: String,
}

fn default_instance() -> Url {
    Url::parse("https://mastodon.social").expect("valid default URL")
}

fn default_api_version() -> u8 {
    1
}

fn default_redirect_uri() -> String {
    "urn:ietf:wg:oauth:2.0:oob".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["read".to_string(), "write".to_string(), "follow".to_string()]
}

fn default_log_target() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

impl Settings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: default_instance(),
            api_version: default_api_version(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            website: String::new(),
            client_id: None,
            client_secret: None,
            access_token: None,
            authorized_at: None,
            log_target: default_log_target(),
        }
    }

    #[must_use]
    pub fn with_instance(mut self, instance: Url) -> Self {
        self.instance = instance;
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, api_version: u8) -> Self {
        self.api_version = api_version;
        self
    }

    #[must_use]
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = website.into();
        self
    }

    /// Resume from application credentials obtained by an earlier registration.
    #[must_use]
    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(ClientId::new(client_id.into()));
        self.client_secret = Some(ClientSecret::new(client_secret.into()));
        self
    }

    /// Resume from an access token obtained by an earlier authorization.
    #[must_use]
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(AccessToken::new(access_token.into()));
        self
    }

    #[must_use]
    pub fn with_log_target(mut self, log_target: impl Into<String>) -> Self {
        self.log_target = log_target.into();
        self
    }
}
