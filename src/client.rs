use std::fmt;
use std::sync::{Arc, Weak};

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use oauth2::basic::BasicClient;
use oauth2::{AccessToken, AuthUrl, CsrfToken, RedirectUrl, Scope, TokenUrl};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use url::Url;

use crate::dispatcher::{ApiRequest, Dispatcher, HttpDispatcher, Method};
use crate::endpoint::{
    self, StreamQuery, StreamTarget, TimelineQuery, TimelineTarget, APPS_PATH, AUTHORIZE_PATH,
    TOKEN_PATH,
};
use crate::entity::{self, ApiError, Entity, EntityKind};
use crate::error::{remote_message, Error, Result};
use crate::schema::{Args, Kind, Shape};
use crate::session::{
    normalize_scopes, parse_timestamp, AppCredentials, Authorization, Session, SessionState,
};
use crate::settings::Settings;
use crate::stream::Stream;

pub(crate) struct Inner {
    settings: Settings,
    session: RwLock<Session>,
    dispatcher: Box<dyn Dispatcher>,
}

/// Client for one account on one instance.
///
/// Cloning is cheap; all clones share the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Client`], held by entities.
#[derive(Clone, Default)]
pub struct ClientRef(Weak<Inner>);

impl ClientRef {
    /// The client, if it is still alive.
    pub fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(|inner| Client { inner })
    }
}

impl fmt::Debug for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRef")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.settings.name)
            .field("configured_instance", &self.inner.settings.instance.as_str())
            .finish()
    }
}

/// Arguments of [`Client::register`]. Absent fields fall back to [`Settings`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Deserialize)]
struct Registration {
    instance: String,
    redirect_uris: String,
    scopes: Vec<String>,
    website: String,
}

/// Arguments of [`Client::authorize`].
///
/// With an `access_code` the authorization-code grant is used, otherwise the
/// password grant with `username`/`password`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthorizeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AuthorizeOptions {
    pub fn access_code(code: impl Into<String>) -> Self {
        Self {
            access_code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            access_code: None,
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

#[derive(Deserialize)]
struct Grant {
    access_code: String,
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    scope: String,
}

/// Arguments of [`Client::update_account`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

/// Arguments of [`Client::post_status`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoiler_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

impl PostStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }
}

pub const VISIBILITIES: &[&str] = &["direct", "private", "unlisted", "public"];

impl Client {
    /// Create a client talking HTTP to `settings.instance`.
    ///
    /// No request is made until [`register`](Self::register) or another
    /// operation is called.
    pub fn new(settings: Settings) -> Result<Self> {
        let dispatcher = HttpDispatcher::new().with_log_target(settings.log_target.clone());
        Self::with_dispatcher(settings, dispatcher)
    }

    /// Create a client with a custom transport.
    pub fn with_dispatcher(settings: Settings, dispatcher: impl Dispatcher + 'static) -> Result<Self> {
        if settings.name.trim().is_empty() {
            return Err(Error::validation("settings", "name", "must not be empty"));
        }
        if settings.scopes.is_empty() {
            return Err(Error::validation("settings", "scopes", "must not be empty"));
        }

        let credentials = match (settings.client_id.clone(), settings.client_secret.clone()) {
            (Some(client_id), Some(client_secret)) => Some(AppCredentials {
                client_id,
                client_secret,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::validation("settings", "client_secret", "missing"))
            }
            (None, Some(_)) => return Err(Error::validation("settings", "client_id", "missing")),
        };
        if settings.access_token.is_some() && credentials.is_none() {
            return Err(Error::validation(
                "settings",
                "access_token",
                "requires client_id and client_secret",
            ));
        }
        let authorization = settings.access_token.clone().map(|access_token| Authorization {
            access_token,
            authorized_at: settings.authorized_at.unwrap_or_else(Utc::now),
        });

        let session = Session::new(
            settings.name.clone(),
            settings.scopes.clone(),
            settings.instance.clone(),
        )
        .resume(credentials, authorization);
        trace!(target: settings.log_target.as_str(), "Created client in {} state", session.state());

        Ok(Client {
            inner: Arc::new(Inner {
                settings,
                session: RwLock::new(session),
                dispatcher: Box::new(dispatcher),
            }),
        })
    }

    /// A handle that does not keep this client alive.
    pub fn downgrade(&self) -> ClientRef {
        ClientRef(Arc::downgrade(&self.inner))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Snapshot of the current session.
    pub async fn session(&self) -> Session {
        self.inner.session.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.session.read().await.state()
    }

    pub async fn access_token(&self) -> Option<AccessToken> {
        self.inner.session.read().await.access_token().cloned()
    }

    fn log_target(&self) -> &str {
        &self.inner.settings.log_target
    }

    /// The instance requests go to: the one the application was registered
    /// with, or the configured one before registration.
    pub async fn instance(&self) -> Url {
        self.inner.session.read().await.instance().clone()
    }

    async fn url(&self, path: &str) -> Result<Url> {
        endpoint::api_url(&self.instance().await, self.inner.settings.api_version, path)
    }

    /// Register this application with the instance.
    ///
    /// Does nothing if the session is already registered. Must not run
    /// concurrently with another `register` or `authorize` on the same client.
    pub async fn register(&self, options: RegisterOptions) -> Result<&Self> {
        if self.state().await >= SessionState::Registered {
            info!(target: self.log_target(), "Client is already registered, skipping registration");
            return Ok(self);
        }

        let settings = &self.inner.settings;
        let registration: Registration = Shape::new("register")
            .defaulted("instance", Kind::Uri, settings.instance.as_str())
            .defaulted("redirect_uris", Kind::Str, settings.redirect_uri.clone())
            .defaulted("scopes", Kind::StrList, settings.scopes.clone())
            .defaulted("website", Kind::Str, settings.website.clone())
            .resolve(&options)?;

        let instance = Url::parse(&registration.instance)?;
        let mut body = json!({
            "client_name": settings.name,
            "redirect_uris": registration.redirect_uris,
            "scopes": normalize_scopes(&registration.scopes),
        });
        if !registration.website.is_empty() {
            body["website"] = Value::String(registration.website);
        }

        debug!(target: self.log_target(), "Registering application '{}' with {}", settings.name, instance);
        let url = endpoint::api_url(&instance, settings.api_version, APPS_PATH)?;
        let response = self.send(Method::Post, url, Some(body)).await?;

        let app = match self.coerce(response, EntityKind::Application)? {
            Entity::Application(app) => app,
            Entity::Error(e) => {
                warn!(target: self.log_target(), "Registration failed: {}", describe(&e));
                return Err(e.into());
            }
            other => {
                return Err(Error::Remote {
                    error: "invalid_response".into(),
                    description: Some(format!("expected an application, got {other:?}")),
                })
            }
        };
        let credentials = match (app.client_id, app.client_secret) {
            (Some(client_id), Some(client_secret)) => AppCredentials {
                client_id,
                client_secret,
            },
            _ => {
                return Err(Error::Remote {
                    error: "invalid_response".into(),
                    description: Some("registration response lacks client credentials".into()),
                })
            }
        };

        self.inner
            .session
            .write()
            .await
            .set_credentials(credentials, instance);
        debug!(target: self.log_target(), "Application registered");
        Ok(self)
    }

    /// Obtain an access token for the registered application.
    ///
    /// Fails with [`Error::State`] if the session is not registered yet, and
    /// does nothing if it is already authorized. When the token endpoint
    /// answers with an error body the failure is logged and the session stays
    /// unauthorized; check [`access_token`](Self::access_token) afterwards.
    /// Fails with [`Error::ScopeMismatch`] when the granted scopes differ
    /// from the requested ones, in which case the token is discarded.
    ///
    /// Must not run concurrently with another `register` or `authorize` on
    /// the same client.
    pub async fn authorize(&self, options: AuthorizeOptions) -> Result<&Self> {
        let session = self.session().await;
        let credentials = session.credentials().cloned().ok_or(Error::State {
            operation: "authorize",
            required: SessionState::Registered,
            actual: session.state(),
        })?;
        if session.state() == SessionState::Authorized {
            info!(target: self.log_target(), "Client is already authorized, skipping authorization");
            return Ok(self);
        }

        let grant: Grant = Shape::new("authorize")
            .defaulted("access_code", Kind::Str, "")
            .defaulted("username", Kind::Str, "")
            .defaulted("password", Kind::Str, "")
            .resolve(&options)?;

        let mut body = json!({
            "client_id": credentials.client_id.as_str(),
            "client_secret": credentials.client_secret.secret(),
            "redirect_uri": self.inner.settings.redirect_uri,
        });
        if grant.access_code.is_empty() {
            body["grant_type"] = json!("password");
            body["username"] = json!(grant.username);
            body["password"] = json!(grant.password);
        } else {
            body["grant_type"] = json!("authorization_code");
            body["code"] = json!(grant.access_code);
        }

        let api_version = self.inner.settings.api_version;
        let url = endpoint::api_url(session.instance(), api_version, TOKEN_PATH)?;
        let response = self.send(Method::Post, url, Some(body)).await?;
        if entity::is_error_payload(&response) {
            let e: ApiError = serde_json::from_value(response)?;
            warn!(target: self.log_target(), "Authorization failed: {}", describe(&e));
            return Ok(self);
        }

        let token: TokenGrant = serde_json::from_value(response)?;
        let granted = normalize_scopes([token.scope.as_str()]);
        let requested = normalize_scopes(session.scopes());
        if granted != requested {
            error!(
                target: self.log_target(),
                "Granted scopes '{}' differ from requested scopes '{}', discarding token",
                granted, requested
            );
            return Err(Error::ScopeMismatch { requested, granted });
        }

        let authorized_at = match &token.created_at {
            Some(created_at) => parse_timestamp(created_at)?,
            None => Utc::now(),
        };
        self.inner
            .session
            .write()
            .await
            .set_authorization(Authorization {
                access_token: AccessToken::new(token.access_token),
                authorized_at,
            });
        debug!(target: self.log_target(), "Client authorized with scopes '{}'", granted);
        Ok(self)
    }

    /// URL the user visits to approve this application and obtain an
    /// access code for [`authorize`](Self::authorize).
    pub async fn authorization_url(&self) -> Result<Url> {
        let session = self.session().await;
        let credentials = session.credentials().cloned().ok_or(Error::State {
            operation: "authorization_url",
            required: SessionState::Registered,
            actual: session.state(),
        })?;

        let api_version = self.inner.settings.api_version;
        let oauth_client = BasicClient::new(
            credentials.client_id,
            Some(credentials.client_secret),
            AuthUrl::from_url(endpoint::api_url(session.instance(), api_version, AUTHORIZE_PATH)?),
            Some(TokenUrl::from_url(endpoint::api_url(
                session.instance(),
                api_version,
                TOKEN_PATH,
            )?)),
        )
        .set_redirect_uri(RedirectUrl::new(self.inner.settings.redirect_uri.clone())?);

        let (url, _state) = oauth_client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(session.scopes().iter().cloned().map(Scope::new))
            .url();
        Ok(url)
    }

    /// Raw GET of an API path, e.g. `instance/peers`.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::Get, self.url(path).await?, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(Method::Post, self.url(path).await?, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.send(Method::Patch, self.url(path).await?, Some(body)).await
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value> {
        let bearer = self
            .inner
            .session
            .read()
            .await
            .access_token()
            .map(|token| token.secret().clone());

        trace!(target: self.log_target(), "Dispatching {} {}", method, url);
        self.inner
            .dispatcher
            .dispatch(ApiRequest {
                method,
                url,
                body,
                bearer,
            })
            .await
    }

    fn coerce(&self, value: Value, kind: EntityKind) -> Result<Entity> {
        let entity = entity::coerce(value, kind, &self.downgrade())?;
        if let Entity::Error(e) = &entity {
            warn!(target: self.log_target(), "Remote error: {}", describe(e));
        }
        Ok(entity)
    }

    /// Fetch a timeline as a collection of statuses.
    pub async fn timeline(&self, query: TimelineQuery) -> Result<Entity> {
        let target = TimelineTarget::resolve(&query)?;
        let url = target.url(&self.instance().await, self.inner.settings.api_version)?;
        let response = self.send(Method::Get, url, None).await?;
        self.coerce(response, EntityKind::Status)
    }

    /// Build a handle to a live event stream. The connection is opened by
    /// [`Stream::start`].
    pub async fn stream(&self, query: StreamQuery) -> Result<Stream> {
        let target = StreamTarget::resolve(&query)?;
        let settings = &self.inner.settings;
        let url = target.url(&self.instance().await, settings.api_version)?;
        debug!(target: self.log_target(), "Building stream for {}", url);

        Ok(Stream::new(url, self.access_token().await).with_log_target(settings.log_target.clone()))
    }

    /// Fetch an account, or the authorized user's own account when `id` is `None`.
    pub async fn get_account(&self, id: Option<&str>) -> Result<Entity> {
        let args = Shape::new("get_account")
            .optional("id", Kind::NonEmpty)
            .validate(id_args(id))?;
        let path = match args.get("id").and_then(Value::as_str) {
            Some(id) => format!("accounts/{id}"),
            None => "accounts/verify_credentials".to_string(),
        };
        let response = self.get(&path).await?;
        self.coerce(response, EntityKind::Account)
    }

    pub async fn update_account(&self, update: UpdateAccount) -> Result<Entity> {
        let body: Args = Shape::new("update_account")
            .optional("display_name", Kind::Str)
            .optional("note", Kind::Str)
            .optional("locked", Kind::Bool)
            .resolve(&update)?;
        let response = self
            .patch("accounts/update_credentials", Value::Object(body))
            .await?;
        self.coerce(response, EntityKind::Account)
    }

    pub async fn account_statuses(&self, id: &str) -> Result<Entity> {
        let id = required_id("account_statuses", id)?;
        let response = self.get(&format!("accounts/{id}/statuses")).await?;
        self.coerce(response, EntityKind::Status)
    }

    pub async fn follow(&self, id: &str) -> Result<Entity> {
        let id = required_id("follow", id)?;
        let response = self.post(&format!("accounts/{id}/follow"), json!({})).await?;
        self.coerce(response, EntityKind::Relationship)
    }

    pub async fn unfollow(&self, id: &str) -> Result<Entity> {
        let id = required_id("unfollow", id)?;
        let response = self.post(&format!("accounts/{id}/unfollow"), json!({})).await?;
        self.coerce(response, EntityKind::Relationship)
    }

    pub async fn post_status(&self, status: PostStatus) -> Result<Entity> {
        let body: Args = Shape::new("post_status")
            .required("status", Kind::NonEmpty)
            .optional("in_reply_to_id", Kind::NonEmpty)
            .optional("sensitive", Kind::Bool)
            .optional("spoiler_text", Kind::Str)
            .optional("visibility", Kind::OneOf(VISIBILITIES))
            .resolve(&status)?;
        let response = self.post("statuses", Value::Object(body)).await?;
        self.coerce(response, EntityKind::Status)
    }

    pub async fn get_status(&self, id: &str) -> Result<Entity> {
        let id = required_id("get_status", id)?;
        let response = self.get(&format!("statuses/{id}")).await?;
        self.coerce(response, EntityKind::Status)
    }

    pub async fn favourite(&self, id: &str) -> Result<Entity> {
        let id = required_id("favourite", id)?;
        let response = self.post(&format!("statuses/{id}/favourite"), json!({})).await?;
        self.coerce(response, EntityKind::Status)
    }

    pub async fn reblog(&self, id: &str) -> Result<Entity> {
        let id = required_id("reblog", id)?;
        let response = self.post(&format!("statuses/{id}/reblog"), json!({})).await?;
        self.coerce(response, EntityKind::Status)
    }
}

fn id_args(id: Option<&str>) -> Args {
    let mut args = Args::new();
    if let Some(id) = id {
        args.insert("id".to_string(), Value::String(id.to_string()));
    }
    args
}

fn required_id(operation: &'static str, id: &str) -> Result<String> {
    let mut args = Shape::new(operation)
        .required("id", Kind::NonEmpty)
        .validate(id_args(Some(id)))?;
    match args.remove("id") {
        Some(Value::String(id)) => Ok(id),
        _ => Err(Error::validation(operation, "id", "missing")),
    }
}

fn describe(e: &ApiError) -> String {
    remote_message(&e.error, &e.error_description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Linked;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses and records every request.
    #[derive(Clone, Default)]
    struct Recorder {
        responses: Arc<Mutex<VecDeque<Value>>>,
        requests: Arc<Mutex<Vec<ApiRequest>>>,
    }

    impl Recorder {
        fn respond(&self, value: Value) -> &Self {
            self.responses.lock().unwrap().push_back(value);
            self
        }

        fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn last(&self) -> ApiRequest {
            self.requests().pop().expect("a request was dispatched")
        }
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, request: ApiRequest) -> Result<Value> {
            self.requests.lock().unwrap().push(request);
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Value::Null))
        }
    }

    fn settings() -> Settings {
        Settings::new("tester").with_instance(Url::parse("https://example.social").unwrap())
    }

    fn client() -> (Client, Recorder) {
        let recorder = Recorder::default();
        let client = Client::with_dispatcher(settings(), recorder.clone()).unwrap();
        (client, recorder)
    }

    fn app_response() -> Value {
        json!({ "id": "1", "name": "tester", "client_id": "cid", "client_secret": "csecret" })
    }

    fn token_response(scope: &str) -> Value {
        json!({
            "access_token": "tok",
            "token_type": "Bearer",
            "scope": scope,
            "created_at": 1_500_000_000
        })
    }

    async fn registered() -> (Client, Recorder) {
        let (client, recorder) = client();
        recorder.respond(app_response());
        client.register(RegisterOptions::default()).await.unwrap();
        (client, recorder)
    }

    async fn authorized() -> (Client, Recorder) {
        let (client, recorder) = registered().await;
        recorder.respond(token_response("read write follow"));
        client
            .authorize(AuthorizeOptions::access_code("code"))
            .await
            .unwrap();
        (client, recorder)
    }

    #[tokio::test]
    async fn register_stores_credentials() {
        let (client, recorder) = registered().await;

        let request = recorder.last();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.url.as_str(), "https://example.social/api/v1/apps");
        assert_eq!(
            request.body.unwrap(),
            json!({
                "client_name": "tester",
                "redirect_uris": "urn:ietf:wg:oauth:2.0:oob",
                "scopes": "follow read write"
            })
        );

        let session = client.session().await;
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.client_id().unwrap().as_str(), "cid");
        assert_eq!(session.client_secret().unwrap().secret(), "csecret");
    }

    #[tokio::test]
    async fn register_honours_overrides() {
        let (client, recorder) = client();
        recorder.respond(app_response());
        client
            .register(RegisterOptions {
                instance: Some("https://other.social".into()),
                scopes: Some(vec!["read".into()]),
                website: Some("https://tester.example".into()),
                ..RegisterOptions::default()
            })
            .await
            .unwrap();

        let request = recorder.last();
        assert_eq!(request.url.as_str(), "https://other.social/api/v1/apps");
        let body = request.body.unwrap();
        assert_eq!(body["scopes"], json!("read"));
        assert_eq!(body["website"], json!("https://tester.example"));
    }

    #[tokio::test]
    async fn registered_instance_is_used_for_every_later_request() {
        let (client, recorder) = client();
        recorder.respond(app_response());
        client
            .register(RegisterOptions {
                instance: Some("https://other.social".into()),
                ..RegisterOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(client.instance().await.as_str(), "https://other.social/");
        assert_eq!(client.settings().instance.as_str(), "https://example.social/");

        let url = client.authorization_url().await.unwrap();
        assert_eq!(url.host_str(), Some("other.social"));

        recorder.respond(token_response("read write follow"));
        client
            .authorize(AuthorizeOptions::access_code("code"))
            .await
            .unwrap();
        assert_eq!(recorder.last().url.as_str(), "https://other.social/oauth/token");

        recorder.respond(json!([]));
        client.timeline(TimelineQuery::default()).await.unwrap();
        assert_eq!(
            recorder.last().url.as_str(),
            "https://other.social/api/v1/timelines/home"
        );

        client.get("instance").await.unwrap();
        assert_eq!(recorder.last().url.as_str(), "https://other.social/api/v1/instance");

        let stream = client.stream(StreamQuery::default()).await.unwrap();
        assert_eq!(stream.url().host_str(), Some("other.social"));
    }

    #[tokio::test]
    async fn repeated_register_is_a_no_op() {
        let (client, recorder) = registered().await;
        recorder.respond(json!({ "client_id": "other", "client_secret": "other" }));

        client.register(RegisterOptions::default()).await.unwrap();

        assert_eq!(recorder.requests().len(), 1);
        let session = client.session().await;
        assert_eq!(session.client_id().unwrap().as_str(), "cid");
        assert_eq!(session.state(), SessionState::Registered);
    }

    #[tokio::test]
    async fn register_validates_before_dispatch() {
        let (client, recorder) = client();
        let err = client
            .register(RegisterOptions {
                instance: Some("not a uri".into()),
                ..RegisterOptions::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { field, .. } if field == "instance"));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn register_remote_error_leaves_session_unregistered() {
        let (client, recorder) = client();
        recorder.respond(json!({ "error": "Validation failed" }));

        let err = client.register(RegisterOptions::default()).await.unwrap_err();

        assert!(matches!(err, Error::Remote { .. }));
        assert_eq!(client.state().await, SessionState::Unregistered);
    }

    #[tokio::test]
    async fn authorize_before_register_fails_without_io() {
        let (client, recorder) = client();

        let err = client
            .authorize(AuthorizeOptions::access_code("code"))
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::State {
                required: SessionState::Registered,
                actual: SessionState::Unregistered,
                ..
            }
        ));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn authorize_with_access_code() {
        let (client, recorder) = authorized().await;

        let request = recorder.last();
        assert_eq!(request.url.as_str(), "https://example.social/oauth/token");
        assert_eq!(
            request.body.unwrap(),
            json!({
                "client_id": "cid",
                "client_secret": "csecret",
                "redirect_uri": "urn:ietf:wg:oauth:2.0:oob",
                "grant_type": "authorization_code",
                "code": "code"
            })
        );

        let session = client.session().await;
        assert_eq!(session.state(), SessionState::Authorized);
        assert_eq!(session.access_token().unwrap().secret(), "tok");
        assert_eq!(session.authorized_at().unwrap().timestamp(), 1_500_000_000);
    }

    #[tokio::test]
    async fn authorize_with_password() {
        let (client, recorder) = registered().await;
        recorder.respond(token_response("follow write read"));

        client
            .authorize(AuthorizeOptions::password("alice", "hunter2"))
            .await
            .unwrap();

        let body = recorder.last().body.unwrap();
        assert_eq!(body["grant_type"], json!("password"));
        assert_eq!(body["username"], json!("alice"));
        assert_eq!(body["password"], json!("hunter2"));
        assert!(body.get("code").is_none());
        assert_eq!(client.state().await, SessionState::Authorized);
    }

    #[tokio::test]
    async fn repeated_authorize_is_a_no_op() {
        let (client, recorder) = authorized().await;
        let before = recorder.requests().len();
        recorder.respond(json!({ "access_token": "new", "scope": "read write follow" }));

        client
            .authorize(AuthorizeOptions::access_code("again"))
            .await
            .unwrap();

        assert_eq!(recorder.requests().len(), before);
        assert_eq!(client.access_token().await.unwrap().secret(), "tok");
    }

    #[tokio::test]
    async fn authorize_error_body_leaves_session_registered() {
        let (client, recorder) = registered().await;
        recorder.respond(json!({
            "error": "invalid_grant",
            "error_description": "The provided authorization grant is invalid"
        }));

        client
            .authorize(AuthorizeOptions::access_code("bad"))
            .await
            .unwrap();

        let session = client.session().await;
        assert_eq!(session.state(), SessionState::Registered);
        assert!(session.access_token().is_none());
        assert!(session.authorized_at().is_none());
    }

    #[tokio::test]
    async fn scope_mismatch_discards_the_token() {
        let (client, recorder) = registered().await;
        recorder.respond(token_response("read"));

        let err = client
            .authorize(AuthorizeOptions::access_code("code"))
            .await
            .unwrap_err();

        match err {
            Error::ScopeMismatch { requested, granted } => {
                assert_eq!(requested, "follow read write");
                assert_eq!(granted, "read");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let session = client.session().await;
        assert!(session.access_token().is_none());
        assert!(session.authorized_at().is_none());
    }

    #[tokio::test]
    async fn empty_access_code_selects_password_grant() {
        let (client, recorder) = registered().await;
        let before = recorder.requests().len();
        recorder.respond(token_response("read write follow"));

        let result = client
            .authorize(AuthorizeOptions {
                access_code: Some(String::new()),
                username: None,
                password: None,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(recorder.requests().len(), before + 1);
        assert_eq!(recorder.last().body.unwrap()["grant_type"], json!("password"));
    }

    #[tokio::test]
    async fn resumed_sessions_skip_completed_steps() {
        let recorder = Recorder::default();
        let client = Client::with_dispatcher(
            settings().with_credentials("cid", "csecret"),
            recorder.clone(),
        )
        .unwrap();
        assert_eq!(client.state().await, SessionState::Registered);
        client.register(RegisterOptions::default()).await.unwrap();
        assert!(recorder.requests().is_empty());

        let client = Client::with_dispatcher(
            settings()
                .with_credentials("cid", "csecret")
                .with_access_token("tok"),
            recorder.clone(),
        )
        .unwrap();
        let session = client.session().await;
        assert_eq!(session.state(), SessionState::Authorized);
        assert!(session.authorized_at().is_some());
    }

    #[test]
    fn inconsistent_settings_are_rejected() {
        let mut half = settings();
        half.client_id = Some(oauth2::ClientId::new("cid".into()));
        assert!(matches!(
            Client::with_dispatcher(half, Recorder::default()),
            Err(Error::Validation { field, .. }) if field == "client_secret"
        ));

        let orphan_token = settings().with_access_token("tok");
        assert!(matches!(
            Client::with_dispatcher(orphan_token, Recorder::default()),
            Err(Error::Validation { field, .. }) if field == "access_token"
        ));

        assert!(Client::with_dispatcher(Settings::new(" "), Recorder::default()).is_err());
        assert!(Client::with_dispatcher(
            settings().with_scopes(Vec::<String>::new()),
            Recorder::default()
        )
        .is_err());
    }

    #[tokio::test]
    async fn authorization_url_requires_registration() {
        let (client, _) = client();
        assert!(matches!(
            client.authorization_url().await,
            Err(Error::State { .. })
        ));

        let (client, _) = registered().await;
        let url = client.authorization_url().await.unwrap();
        assert_eq!(url.path(), "/oauth/authorize");
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "cid");
        assert_eq!(query["redirect_uri"], "urn:ietf:wg:oauth:2.0:oob");
        assert_eq!(query["scope"], "read write follow");
        assert!(query.contains_key("state"));
    }

    #[tokio::test]
    async fn timeline_attaches_the_bearer_token() {
        let (client, recorder) = authorized().await;
        recorder.respond(json!([{ "id": "1", "content": "hi" }]));

        let timeline = client
            .timeline(TimelineQuery::named("public").local(true))
            .await
            .unwrap();

        let request = recorder.last();
        assert_eq!(request.method, Method::Get);
        assert_eq!(
            request.url.as_str(),
            "https://example.social/api/v1/timelines/public?local"
        );
        assert_eq!(request.bearer.as_deref(), Some("tok"));
        assert_eq!(timeline.into_collection().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tag_timelines_stay_under_the_tag_path() {
        let (client, recorder) = authorized().await;
        recorder.respond(json!([])).respond(json!([]));

        client
            .timeline(TimelineQuery::tagged("#rust"))
            .await
            .unwrap();
        assert_eq!(recorder.last().url.path(), "/api/v1/timelines/tag/%23rust");

        client
            .timeline(TimelineQuery::tagged("../../accounts/1"))
            .await
            .unwrap();
        let url = recorder.last().url;
        assert!(url.path().starts_with("/api/v1/timelines/tag/"), "{url}");
        assert_eq!(url.path_segments().unwrap().count(), 5);
    }

    #[tokio::test]
    async fn unknown_timeline_name_fails_before_dispatch() {
        let (client, recorder) = client();
        let err = client
            .timeline(TimelineQuery::named("homepage"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn error_payload_becomes_error_entity() {
        let (client, recorder) = client();
        recorder.respond(json!({ "error": "The access token is invalid" }));

        let entity = client.timeline(TimelineQuery::default()).await.unwrap();
        match entity {
            Entity::Error(e) => assert_eq!(e.error, "The access token is invalid"),
            other => panic!("unexpected entity: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_is_built_with_url_and_token() {
        let (client, recorder) = authorized().await;
        let before = recorder.requests().len();

        let stream = client.stream(StreamQuery::tagged("news")).await.unwrap();
        assert_eq!(
            stream.url().as_str(),
            "https://example.social/api/v1/streaming/hashtag?news"
        );
        assert_eq!(stream.access_token().unwrap().secret(), "tok");
        assert_eq!(recorder.requests().len(), before);

        assert!(client.stream(StreamQuery::named("home")).await.is_err());
    }

    #[tokio::test]
    async fn entities_call_back_into_their_client() {
        let (client, recorder) = authorized().await;
        recorder
            .respond(json!({ "id": "5", "account": { "id": "7", "username": "alice" } }))
            .respond(json!({ "id": "5", "favourited": true }))
            .respond(json!({ "id": "7", "following": true }));

        let status = client.get_status("5").await.unwrap().into_status().unwrap();
        assert_eq!(recorder.last().url.path(), "/api/v1/statuses/5");

        let favourited = status.favourite().await.unwrap().into_status().unwrap();
        assert_eq!(favourited.favourited, Some(true));
        assert_eq!(recorder.last().url.path(), "/api/v1/statuses/5/favourite");

        let relationship = status
            .account
            .follow()
            .await
            .unwrap()
            .into_relationship()
            .unwrap();
        assert!(relationship.following);
        assert_eq!(recorder.last().url.path(), "/api/v1/accounts/7/follow");
    }

    #[tokio::test]
    async fn entities_do_not_keep_the_client_alive() {
        let (client, recorder) = client();
        recorder.respond(json!({ "id": "7", "username": "alice" }));
        let account = client
            .get_account(Some("7"))
            .await
            .unwrap()
            .into_account()
            .unwrap();
        assert!(account.client().is_ok());

        drop(client);
        assert!(matches!(account.client(), Err(Error::ClientGone)));
        assert!(matches!(account.statuses().await, Err(Error::ClientGone)));
    }

    #[tokio::test]
    async fn get_account_without_id_verifies_credentials() {
        let (client, recorder) = authorized().await;
        recorder.respond(json!({ "id": "1", "username": "me" }));

        client.get_account(None).await.unwrap();
        assert_eq!(
            recorder.last().url.path(),
            "/api/v1/accounts/verify_credentials"
        );

        let err = client.get_account(Some("")).await.unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "id"));
    }

    #[tokio::test]
    async fn update_account_patches_only_given_fields() {
        let (client, recorder) = authorized().await;
        recorder.respond(json!({ "id": "1", "display_name": "Alice" }));

        let account = client
            .update_account(UpdateAccount {
                display_name: Some("Alice".into()),
                ..UpdateAccount::default()
            })
            .await
            .unwrap()
            .into_account()
            .unwrap();

        let request = recorder.last();
        assert_eq!(request.method, Method::Patch);
        assert_eq!(request.body.unwrap(), json!({ "display_name": "Alice" }));
        assert_eq!(account.display_name, "Alice");
    }

    #[tokio::test]
    async fn post_status_validates_visibility() {
        let (client, recorder) = authorized().await;
        let before = recorder.requests().len();

        let err = client
            .post_status(PostStatus {
                visibility: Some("friends".into()),
                ..PostStatus::new("hello")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "visibility"));
        assert!(client.post_status(PostStatus::new("")).await.is_err());
        assert_eq!(recorder.requests().len(), before);

        recorder.respond(json!({ "id": "9", "content": "hello", "visibility": "unlisted" }));
        let status = client
            .post_status(PostStatus {
                visibility: Some("unlisted".into()),
                ..PostStatus::new("hello")
            })
            .await
            .unwrap()
            .into_status()
            .unwrap();
        assert_eq!(status.visibility, "unlisted");
        assert_eq!(
            recorder.last().body.unwrap(),
            json!({ "status": "hello", "visibility": "unlisted" })
        );
    }
}
