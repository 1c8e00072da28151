//! Typed entities decoded from service responses.
//!
//! Every entity carries a [`ClientRef`], a non-owning handle to the client
//! that fetched it. Follow-up calls such as [`Account::statuses`] go through
//! that handle and fail with [`Error::ClientGone`] once the client has been
//! dropped; the entity itself stays readable.

use chrono::{DateTime, Utc};
use oauth2::{ClientId, ClientSecret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::client::{Client, ClientRef};
use crate::error::{Error, Result};

use self::sealed::Attach;

mod sealed {
    use crate::client::ClientRef;

    /// Rebinding an entity to a client is reserved to decoding.
    pub trait Attach {
        /// Point this entity (and any entities nested inside it) at `client`.
        fn attach(&mut self, client: &ClientRef);
    }
}

/// Capability shared by every entity: access to the originating client.
///
/// The back-reference is set once, when the entity is decoded, and cannot be
/// repointed from outside this crate:
///
/// ```compile_fail
/// use mastodon_client::{Account, ClientRef, Linked};
///
/// let mut account = Account::default();
/// account.attach(&ClientRef::default());
/// ```
pub trait Linked: Attach {
    fn client_ref(&self) -> &ClientRef;

    fn client(&self) -> Result<Client> {
        self.client_ref().upgrade().ok_or(Error::ClientGone)
    }
}

macro_rules! linked {
    ($($entity:ty),+ $(,)?) => {
        $(
            impl Attach for $entity {
                fn attach(&mut self, client: &ClientRef) {
                    self.client = client.clone();
                }
            }

            impl Linked for $entity {
                fn client_ref(&self) -> &ClientRef {
                    &self.client
                }
            }
        )+
    };
}

linked!(Application, Account, Relationship, ApiError);

/// A registered application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Application {
    pub id: Option<String>,
    pub name: String,
    pub website: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<ClientId>,
    pub client_secret: Option<ClientSecret>,
    #[serde(skip)]
    client: ClientRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub acct: String,
    pub display_name: String,
    pub locked: bool,
    pub bot: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub followers_count: u64,
    pub following_count: u64,
    pub statuses_count: u64,
    pub note: String,
    pub url: Option<String>,
    pub avatar: Option<String>,
    pub header: Option<String>,
    #[serde(skip)]
    client: ClientRef,
}

impl Account {
    /// Statuses posted by this account.
    pub async fn statuses(&self) -> Result<Entity> {
        self.client()?.account_statuses(&self.id).await
    }

    pub async fn follow(&self) -> Result<Entity> {
        self.client()?.follow(&self.id).await
    }

    pub async fn unfollow(&self) -> Result<Entity> {
        self.client()?.unfollow(&self.id).await
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Status {
    pub id: String,
    pub uri: String,
    pub url: Option<String>,
    pub account: Account,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub in_reply_to_id: Option<String>,
    pub reblog: Option<Box<Status>>,
    pub reblogs_count: u64,
    pub favourites_count: u64,
    pub reblogged: Option<bool>,
    pub favourited: Option<bool>,
    pub sensitive: bool,
    pub spoiler_text: String,
    pub visibility: String,
    #[serde(skip)]
    client: ClientRef,
}

impl Linked for Status {
    fn client_ref(&self) -> &ClientRef {
        &self.client
    }
}

impl Attach for Status {
    fn attach(&mut self, client: &ClientRef) {
        self.client = client.clone();
        self.account.attach(client);
        if let Some(reblog) = self.reblog.as_mut() {
            reblog.attach(client);
        }
    }
}

impl Status {
    pub async fn favourite(&self) -> Result<Entity> {
        self.client()?.favourite(&self.id).await
    }

    pub async fn reblog(&self) -> Result<Entity> {
        self.client()?.reblog(&self.id).await
    }

    /// Re-fetch the author of this status.
    pub async fn account(&self) -> Result<Entity> {
        self.client()?.get_account(Some(self.account.id.as_str())).await
    }
}

/// Relationship between the authorized user and another account.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Relationship {
    pub id: String,
    pub following: bool,
    pub followed_by: bool,
    pub blocking: bool,
    pub muting: bool,
    pub requested: bool,
    #[serde(skip)]
    client: ClientRef,
}

/// An `{error, error_description}` body returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(skip)]
    client: ClientRef,
}

impl From<ApiError> for Error {
    fn from(e: ApiError) -> Self {
        Error::Remote {
            error: e.error,
            description: e.error_description,
        }
    }
}

/// The variant a response is expected to decode into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Application,
    Account,
    Status,
    Relationship,
}

#[derive(Debug, Clone)]
pub enum Entity {
    Application(Application),
    Account(Account),
    Status(Status),
    Relationship(Relationship),
    Error(ApiError),
    /// A JSON array, each element coerced on its own.
    Collection(Vec<Entity>),
}

impl Entity {
    pub fn is_error(&self) -> bool {
        matches!(self, Entity::Error(_))
    }

    /// Turn an `Error` variant into [`Error::Remote`], for use with `?`.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Entity::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }

    pub fn into_application(self) -> Option<Application> {
        match self {
            Entity::Application(app) => Some(app),
            _ => None,
        }
    }

    pub fn into_account(self) -> Option<Account> {
        match self {
            Entity::Account(account) => Some(account),
            _ => None,
        }
    }

    pub fn into_status(self) -> Option<Status> {
        match self {
            Entity::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn into_relationship(self) -> Option<Relationship> {
        match self {
            Entity::Relationship(relationship) => Some(relationship),
            _ => None,
        }
    }

    pub fn into_collection(self) -> Option<Vec<Entity>> {
        match self {
            Entity::Collection(items) => Some(items),
            _ => None,
        }
    }
}

/// Whether `value` is an `{error, ...}` body.
pub fn is_error_payload(value: &Value) -> bool {
    value.as_object().map_or(false, |map| map.contains_key("error"))
}

/// Decode `value` into the entity variant named by `kind`.
///
/// Error-shaped payloads always become [`Entity::Error`], whatever `kind`
/// asked for. Arrays become [`Entity::Collection`].
pub fn coerce(value: Value, kind: EntityKind, client: &ClientRef) -> Result<Entity> {
    if is_error_payload(&value) {
        return decode::<ApiError>(value, client).map(Entity::Error);
    }

    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| coerce(item, kind, client))
            .collect::<Result<Vec<_>>>()
            .map(Entity::Collection),
        value => match kind {
            EntityKind::Application => decode(value, client).map(Entity::Application),
            EntityKind::Account => decode(value, client).map(Entity::Account),
            EntityKind::Status => decode(value, client).map(Entity::Status),
            EntityKind::Relationship => decode(value, client).map(Entity::Relationship),
        },
    }
}

fn decode<T>(value: Value, client: &ClientRef) -> Result<T>
where
    T: DeserializeOwned + Linked,
{
    let mut entity: T = serde_json::from_value(value)?;
    entity.attach(client);
    Ok(entity)
}
