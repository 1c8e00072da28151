//! Mapping of logical targets (timelines, streams, API paths) to URLs.

use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::error::{Error, Result};
use crate::schema::{Kind, Shape};

pub const TIMELINE_NAMES: &[&str] = &["home", "public"];
pub const STREAM_NAMES: &[&str] = &["user", "public"];

/// Arguments of [`Client::timeline`](crate::Client::timeline).
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimelineQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl TimelineQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn local(mut self, local: bool) -> Self {
        self.local = Some(local);
        self
    }
}

/// A validated timeline selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimelineTarget {
    pub name: String,
    pub local: bool,
    pub tag: Option<String>,
}

impl TimelineTarget {
    pub fn shape() -> Shape {
        Shape::new("timeline")
            .defaulted("name", Kind::OneOf(TIMELINE_NAMES), "home")
            .defaulted("local", Kind::Bool, false)
            .optional("tag", Kind::NonEmpty)
    }

    pub fn resolve(query: &TimelineQuery) -> Result<Self> {
        Self::shape().resolve(query)
    }

    /// `<instance>/api/v<version>/timelines/<name>`, or
    /// `.../timelines/tag/<tag>` when a tag is selected. The tag is
    /// percent-encoded as a single path segment.
    pub fn url(&self, instance: &Url, api_version: u8) -> Result<Url> {
        let mut url = match &self.tag {
            Some(tag) => {
                let mut url = api_url(instance, api_version, "timelines/tag")?;
                push_segment(&mut url, "timeline", tag)?;
                url
            }
            None => api_url(instance, api_version, &format!("timelines/{}", self.name))?,
        };
        if self.local {
            url.set_query(Some("local"));
        }
        Ok(url)
    }
}

fn push_segment(url: &mut Url, operation: &'static str, segment: &str) -> Result<()> {
    // `push` silently drops dot segments
    if segment == "." || segment == ".." {
        return Err(Error::validation(operation, "tag", "must not be a dot segment"));
    }
    url.path_segments_mut()
        .map_err(|()| Error::validation(operation, "instance", "cannot be a base URL"))?
        .push(segment);
    Ok(())
}

/// Arguments of [`Client::stream`](crate::Client::stream).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl StreamQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            tag: None,
        }
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            name: None,
            tag: Some(tag.into()),
        }
    }
}

/// A validated stream selection: a named stream or a hashtag stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamTarget {
    pub name: String,
    pub tag: Option<String>,
}

impl StreamTarget {
    pub fn shape() -> Shape {
        Shape::new("stream")
            .defaulted("name", Kind::OneOf(STREAM_NAMES), "user")
            .optional("tag", Kind::NonEmpty)
    }

    pub fn resolve(query: &StreamQuery) -> Result<Self> {
        Self::shape().resolve(query)
    }

    /// `<instance>/api/v<version>/streaming/<name>`, or
    /// `.../streaming/hashtag?<tag>` when a tag is selected.
    pub fn url(&self, instance: &Url, api_version: u8) -> Result<Url> {
        match &self.tag {
            Some(tag) => {
                let mut url = api_url(instance, api_version, "streaming/hashtag")?;
                let query: String = form_urlencoded::byte_serialize(tag.as_bytes()).collect();
                url.set_query(Some(&query));
                Ok(url)
            }
            None => api_url(instance, api_version, &format!("streaming/{}", self.name)),
        }
    }
}

fn base(instance: &Url) -> &str {
    instance.as_str().trim_end_matches('/')
}

/// Resolve a request path against an instance.
///
/// Paths starting with `/` are rooted at the instance (`/oauth/token`),
/// everything else lives under `api/v<version>/`.
pub fn api_url(instance: &Url, api_version: u8, path: &str) -> Result<Url> {
    let url = match path.strip_prefix('/') {
        Some(rooted) => format!("{}/{rooted}", base(instance)),
        None => format!("{}/api/v{api_version}/{path}", base(instance)),
    };
    Ok(Url::parse(&url)?)
}

pub const TOKEN_PATH: &str = "/oauth/token";
pub const AUTHORIZE_PATH: &str = "/oauth/authorize";
pub const APPS_PATH: &str = "apps";
