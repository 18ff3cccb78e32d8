//! Engine-level errors: lookup, binding, access, and run failures.
//! Parse errors stay in `scpi_proto::ProtocolError` and are wrapped here so
//! a single `Result` covers a whole dispatch.

use crate::access::Access;
use indexmap::IndexMap;
use scpi_proto::ProtocolError;
use std::fmt;

/// A `Result` alias for the engine crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The qualified error identifier format used on the wire:
/// `Application.Category.Name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorId {
    pub application: String,
    pub category: String,
    pub name: String,
}

impl ErrorId {
    pub fn new(category: &str, name: &str) -> Self {
        ErrorId {
            application: "App".to_string(),
            category: category.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.application, self.category, self.name)
    }
}

/// The top-level engine error, carrying enough structured attributes to
/// marshal losslessly onto the wire's `ERRor` line.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] ProtocolError),

    #[error("{command} <-- Unknown Command")]
    UnknownCommand { branch: String, command: String },

    #[error("`{name}` is a branch, not a leaf")]
    NotALeaf { name: String },

    #[error("`{name}` is a leaf, not a branch")]
    NotABranch { name: String },

    #[error("short name `{short}` is ambiguous between existing nodes")]
    DuplicateShortName { short: String },

    #[error("class name `{name}` has no upper-case letters to derive a short form from")]
    NoUpperCaseLetters { name: String },

    #[error("`{name}` already exists")]
    AlreadyExists { name: String },

    #[error("unknown option `-{option}` for `{leaf}`")]
    NoSuchCommandOption { leaf: String, option: String },

    #[error("unexpected extra argument `{value}` for `{leaf}`")]
    ExtraArgument { leaf: String, value: String },

    #[error("missing required argument `{parameter}` for `{leaf}`")]
    MissingArgument { leaf: String, parameter: String },

    #[error("`{parameter}` requires at least {min} repeats, got {got}")]
    TooFewRepeats { parameter: String, min: u32, got: u32 },

    #[error("`{parameter}` allows at most {max} repeats, got {got}")]
    TooManyRepeats { parameter: String, max: u32, got: u32 },

    #[error("`{value}` for `{parameter}` is outside range [{min}, {max}]")]
    OutOfRange { parameter: String, value: String, min: String, max: String },

    #[error("`{value}` is not a valid value for enum parameter `{parameter}`")]
    InvalidEnumValue { parameter: String, value: String },

    #[error("`{value}` could not be converted to a {expected} for `{parameter}`")]
    ConversionFailed { parameter: String, value: String, expected: String },

    #[error("access level {required} required, session is at {current}")]
    InsufficientAccess { required: Access, current: Access },

    #[error("access level {requested} exceeds this session's access limit of {limit}")]
    AccessLimitExceeded { requested: Access, limit: Access },

    #[error("exclusive access is held by another session at or above {held_level}")]
    ExclusiveAccessHeld { held_level: Access },

    #[error("a singleton leaf `{leaf}` is already running")]
    SingletonRunning { leaf: String },

    #[error("user error in `{leaf}`: {message}")]
    Run { leaf: String, message: String, attributes: IndexMap<String, String> },

    #[error("i/o error: {0}")]
    Io(String),

    #[error("internal error: {message}")]
    Internal { message: String, traceback: Option<String> },

    #[error("session disconnected")]
    Disconnected,
}

impl Error {
    /// The qualified identifier used on the wire.
    pub fn id(&self) -> ErrorId {
        match self {
            Error::Parse(_) => ErrorId::new("Parser", "ParseError"),
            Error::UnknownCommand { .. } => ErrorId::new("Core", "UnknownCommand"),
            Error::NotALeaf { .. } => ErrorId::new("Core", "NotALeaf"),
            Error::NotABranch { .. } => ErrorId::new("Core", "NotABranch"),
            Error::DuplicateShortName { .. } => ErrorId::new("Core", "DuplicateShortName"),
            Error::NoUpperCaseLetters { .. } => ErrorId::new("Core", "NoUpperCaseLetters"),
            Error::AlreadyExists { .. } => ErrorId::new("Core", "AlreadyExists"),
            Error::NoSuchCommandOption { .. } => ErrorId::new("Binding", "NoSuchCommandOption"),
            Error::ExtraArgument { .. } => ErrorId::new("Binding", "ExtraArgument"),
            Error::MissingArgument { .. } => ErrorId::new("Binding", "MissingArgument"),
            Error::TooFewRepeats { .. } => ErrorId::new("Binding", "TooFewRepeats"),
            Error::TooManyRepeats { .. } => ErrorId::new("Binding", "TooManyRepeats"),
            Error::OutOfRange { .. } => ErrorId::new("Binding", "OutOfRange"),
            Error::InvalidEnumValue { .. } => ErrorId::new("Binding", "InvalidEnumValue"),
            Error::ConversionFailed { .. } => ErrorId::new("Binding", "ConversionFailed"),
            Error::InsufficientAccess { .. } => ErrorId::new("Core", "InsufficientAccess"),
            Error::AccessLimitExceeded { .. } => ErrorId::new("Core", "AccessLimitExceeded"),
            Error::ExclusiveAccessHeld { .. } => ErrorId::new("Core", "ExclusiveAccessHeld"),
            Error::SingletonRunning { .. } => ErrorId::new("Run", "SingletonRunning"),
            Error::Run { .. } => ErrorId::new("Run", "ApplicationError"),
            Error::Io(_) => ErrorId::new("Run", "IoError"),
            Error::Internal { .. } => ErrorId::new("Run", "InternalError"),
            Error::Disconnected => ErrorId::new("Core", "SCPIDisconnected"),
        }
    }

    /// Named attributes to render as `-name=value` on the `ERRor` line.
    pub fn attributes(&self) -> IndexMap<String, String> {
        let mut attrs = IndexMap::new();
        match self {
            Error::UnknownCommand { command, .. } => {
                attrs.insert("command".into(), command.clone());
            }
            Error::NotALeaf { name } | Error::NotABranch { name } => {
                attrs.insert("name".into(), name.clone());
            }
            Error::DuplicateShortName { short } => {
                attrs.insert("short".into(), short.clone());
            }
            Error::NoUpperCaseLetters { name } | Error::AlreadyExists { name } => {
                attrs.insert("name".into(), name.clone());
            }
            Error::NoSuchCommandOption { leaf, option } => {
                attrs.insert("leaf".into(), leaf.clone());
                attrs.insert("option".into(), option.clone());
            }
            Error::ExtraArgument { leaf, value } => {
                attrs.insert("leaf".into(), leaf.clone());
                attrs.insert("value".into(), value.clone());
            }
            Error::MissingArgument { leaf, parameter } => {
                attrs.insert("leaf".into(), leaf.clone());
                attrs.insert("parameter".into(), parameter.clone());
            }
            Error::TooFewRepeats { parameter, min, got } => {
                attrs.insert("parameter".into(), parameter.clone());
                attrs.insert("min".into(), min.to_string());
                attrs.insert("got".into(), got.to_string());
            }
            Error::TooManyRepeats { parameter, max, got } => {
                attrs.insert("parameter".into(), parameter.clone());
                attrs.insert("max".into(), max.to_string());
                attrs.insert("got".into(), got.to_string());
            }
            Error::OutOfRange { parameter, value, min, max } => {
                attrs.insert("parameter".into(), parameter.clone());
                attrs.insert("value".into(), value.clone());
                attrs.insert("min".into(), min.clone());
                attrs.insert("max".into(), max.clone());
            }
            Error::InvalidEnumValue { parameter, value } => {
                attrs.insert("parameter".into(), parameter.clone());
                attrs.insert("value".into(), value.clone());
            }
            Error::ConversionFailed { parameter, value, expected } => {
                attrs.insert("parameter".into(), parameter.clone());
                attrs.insert("value".into(), value.clone());
                attrs.insert("expected".into(), expected.clone());
            }
            Error::InsufficientAccess { required, current } => {
                attrs.insert("requiredAccess".into(), required.to_string());
                attrs.insert("currentAccess".into(), current.to_string());
            }
            Error::AccessLimitExceeded { requested, limit } => {
                attrs.insert("requested".into(), requested.to_string());
                attrs.insert("limit".into(), limit.to_string());
            }
            Error::ExclusiveAccessHeld { held_level } => {
                attrs.insert("heldLevel".into(), held_level.to_string());
            }
            Error::SingletonRunning { leaf } => {
                attrs.insert("leaf".into(), leaf.clone());
            }
            Error::Run { leaf, attributes, .. } => {
                attrs.insert("leaf".into(), leaf.clone());
                for (k, v) in attributes {
                    attrs.insert(k.clone(), v.clone());
                }
            }
            Error::Io(_) | Error::Internal { .. } | Error::Disconnected | Error::Parse(_) => {}
        }
        attrs
    }

    pub fn internal(message: impl Into<String>) -> Error {
        Error::Internal { message: message.into(), traceback: None }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
