//! Declarative argument shapes.
//!
//! Every public operation describes the arguments it accepts as a [`Shape`]
//! and runs the caller's bundle through [`Shape::validate`] before touching
//! the network. A field that is absent (or `null`) receives its default, if
//! one is declared; a field that is present with the wrong type is rejected,
//! never coerced.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::error::{Error, Result};

/// A named argument bundle.
pub type Args = Map<String, Value>;

/// Type predicate applied to a present field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Str,
    /// A string that is not empty.
    NonEmpty,
    Bool,
    /// A string that parses as an absolute URI.
    Uri,
    StrList,
    /// A string equal to one of the listed values.
    OneOf(&'static [&'static str]),
}

impl Kind {
    fn check(self, value: &Value) -> std::result::Result<(), String> {
        match (self, value) {
            (Kind::Str, Value::String(_)) | (Kind::Bool, Value::Bool(_)) => Ok(()),
            (Kind::NonEmpty, Value::String(s)) if !s.trim().is_empty() => Ok(()),
            (Kind::NonEmpty, Value::String(_)) => Err("must not be empty".into()),
            (Kind::Uri, Value::String(s)) => Url::parse(s)
                .map(|_| ())
                .map_err(|e| format!("`{s}` is not a valid URI: {e}")),
            (Kind::StrList, Value::Array(items)) => {
                if items.iter().all(Value::is_string) {
                    Ok(())
                } else {
                    Err("expected a list of strings".into())
                }
            }
            (Kind::OneOf(allowed), Value::String(s)) => {
                if allowed.contains(&s.as_str()) {
                    Ok(())
                } else {
                    Err(format!("`{s}` is not one of {}", allowed.join(", ")))
                }
            }
            (kind, other) => Err(format!("expected {}, got {other}", kind.describe())),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Kind::Str | Kind::NonEmpty | Kind::OneOf(_) => "a string",
            Kind::Bool => "a boolean",
            Kind::Uri => "a URI string",
            Kind::StrList => "a list of strings",
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: &'static str,
    kind: Kind,
    required: bool,
    default: Option<Value>,
}

/// The argument shape of one operation.
#[derive(Debug, Clone)]
pub struct Shape {
    operation: &'static str,
    fields: Vec<Field>,
}

impl Shape {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            fields: Vec::new(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// A field that must be supplied by the caller.
    #[must_use]
    pub fn required(mut self, name: &'static str, kind: Kind) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: true,
            default: None,
        });
        self
    }

    /// A field that may be left out; absent fields stay absent.
    #[must_use]
    pub fn optional(mut self, name: &'static str, kind: Kind) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: false,
            default: None,
        });
        self
    }

    /// A field that is filled with `default` when left out.
    #[must_use]
    pub fn defaulted(mut self, name: &'static str, kind: Kind, default: impl Into<Value>) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: false,
            default: Some(default.into()),
        });
        self
    }

    /// Check `args` against the shape and fill in defaults.
    ///
    /// Fails on the first missing required field, mistyped field, or field
    /// the shape does not declare.
    pub fn validate(&self, mut args: Args) -> Result<Args> {
        if let Some(unknown) = args
            .keys()
            .find(|key| !self.fields.iter().any(|f| f.name == key.as_str()))
        {
            return Err(Error::validation(self.operation, unknown.as_str(), "unknown field"));
        }

        let mut resolved = Args::new();
        for field in &self.fields {
            match args.remove(field.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    field
                        .kind
                        .check(&value)
                        .map_err(|reason| Error::validation(self.operation, field.name, reason))?;
                    resolved.insert(field.name.to_string(), value);
                }
                None => {
                    if let Some(default) = &field.default {
                        resolved.insert(field.name.to_string(), default.clone());
                    } else if field.required {
                        return Err(Error::validation(self.operation, field.name, "missing"));
                    }
                }
            }
        }

        Ok(resolved)
    }

    /// Validate a typed argument bundle and decode the result into `R`.
    pub fn resolve<A, R>(&self, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args)? {
            Value::Object(map) => map,
            Value::Null => Args::new(),
            other => {
                return Err(Error::validation(
                    self.operation,
                    "arguments",
                    format!("expected a named bundle, got {other}"),
                ))
            }
        };
        let resolved = self.validate(args)?;
        Ok(serde_json::from_value(Value::Object(resolved))?)
    }
}
