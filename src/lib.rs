//! # Mastodon Client
//! Client library for Mastodon-compatible instances: registers an OAuth2
//! application, authorizes a user, issues validated REST calls and opens live
//! event streams.
//!
//! Every operation checks its arguments against a declared shape before any
//! request is made, and decodes responses into [`Entity`] values. Error
//! bodies returned by the instance become [`Entity::Error`] instead of
//! failing the call, so check the variant (or use [`Entity::into_result`]).
//!
//! Diagnostics go through the `log` facade under the target configured in
//! [`Settings::log_target`]; install any `log` backend to see them.
//!
//! ## Example code
//! ```no_run
//!# async fn doc_test() -> anyhow::Result<()> {
//! use mastodon_client::{AuthorizeOptions, Client, RegisterOptions, Settings, TimelineQuery};
//! use url::Url;
//!
//! // Set up the client
//! let settings = Settings::new("my-app").with_instance(Url::parse("https://example.social")?);
//! let client = Client::new(settings)?;
//!
//! // Register the application, then log in. Both steps are skipped when the
//! // session already went through them.
//! client
//!     .register(RegisterOptions::default())
//!     .await?
//!     .authorize(AuthorizeOptions::password("me@example.social", "hunter2"))
//!     .await?;
//!
//! if client.access_token().await.is_some() {
//!     let timeline = client.timeline(TimelineQuery::named("public").local(true)).await?;
//!     for status in timeline.into_collection().unwrap_or_default() {
//!         println!("{:?}", status.into_status().map(|s| s.content));
//!     }
//! }
//!
//!# Ok(())
//!# }
//! ```
mod client;
mod dispatcher;
mod endpoint;
mod entity;
mod error;
mod schema;
mod session;
mod settings;
mod stream;

pub use crate::client::{
    AuthorizeOptions, Client, ClientRef, PostStatus, RegisterOptions, UpdateAccount, VISIBILITIES,
};
pub use crate::dispatcher::{ApiRequest, Dispatcher, HttpDispatcher, Method};
pub use crate::endpoint::{
    api_url, StreamQuery, StreamTarget, TimelineQuery, TimelineTarget, STREAM_NAMES,
    TIMELINE_NAMES,
};
pub use crate::entity::{
    coerce, is_error_payload, Account, ApiError, Application, Entity, EntityKind, Linked,
    Relationship, Status,
};
pub use crate::error::{Error, Result};
pub use crate::schema::{Args, Kind, Shape};
pub use crate::session::{
    normalize_scopes, AppCredentials, Authorization, Session, SessionState,
};
pub use crate::settings::Settings;
pub use crate::stream::{Event, EventParser, Stream};
