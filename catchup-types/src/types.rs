//! Validated vocabulary types shared by the invoker and its collaborators.
//!
//! Every identifier crossing a crate boundary is a nutype newtype so that an
//! instance is proof of validity: once constructed, a `StreamName` or
//! `EventTypeName` never needs to be checked again.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;

/// String-keyed, arbitrary-valued metadata attached to an event.
///
/// Values may be nested maps; the map is opaque to the replay loop.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Identity of an event listener and the key into a progress store.
///
/// Listeners normally derive their identity from their fully-qualified Rust
/// type path via [`ListenerId::of`], so two listener types never share
/// progress by accident.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ListenerId(String);

impl ListenerId {
    /// Build the identity of listener type `L` from its type path.
    pub fn of<L: ?Sized>() -> Self {
        Self::try_new(std::any::type_name::<L>())
            .expect("Rust type paths are never empty after trimming")
    }
}

/// Unique, stable identifier of a stored event.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh, time-ordered identifier (`UUIDv7`).
    pub fn generate() -> Self {
        Self::try_new(uuid::Uuid::now_v7().to_string())
            .expect("a UUID string is never empty and is shorter than 255 characters")
    }
}

/// Logical event type name: the short name of the concrete event type.
///
/// This is the dispatch key. Handler names are derived from it
/// (`when<EventTypeName>`) and stream sources persist it next to each payload.
#[nutype(
    validate(not_empty, len_char_max = 255, predicate = is_identifier),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventTypeName(String);

impl EventTypeName {
    /// Resolve the short type name from a fully-qualified type path.
    ///
    /// Module path and generic arguments are dropped, so
    /// `bank::events::Deposited<bank::Usd>` resolves to `Deposited`.
    /// Paths that do not reduce to a plain identifier (tuples, references,
    /// closures) fail validation.
    pub fn from_type_path(type_path: &str) -> Result<Self, EventTypeNameError> {
        let without_generics = type_path.split('<').next().unwrap_or(type_path);
        let short_name = without_generics
            .rsplit("::")
            .next()
            .unwrap_or(without_generics);
        Self::try_new(short_name)
    }

    /// Resolve the short type name of `T`.
    pub fn of<T: ?Sized>() -> Result<Self, EventTypeNameError> {
        Self::from_type_path(std::any::type_name::<T>())
    }
}

/// Position of an event in the global append order.
///
/// Zero means "nothing applied yet"; stored events start at one.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The position before the first event.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// The position immediately after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Whether this is the position before the first event.
    pub fn is_none(self) -> bool {
        self.into_inner() == 0
    }
}

/// Name of a single event stream.
///
/// Glob metacharacters (`*`, `?`, `[`, `]`) are reserved for selectors and
/// rejected here.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_glob_metacharacters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamName(String);

impl StreamName {
    /// Whether this stream belongs to the category identified by `prefix`.
    pub fn starts_with(&self, prefix: &StreamPrefix) -> bool {
        let prefix: &str = prefix.as_ref();
        self.as_ref().starts_with(prefix)
    }
}

/// Leading part of stream names, selecting a stream category.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_glob_metacharacters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamPrefix(String);

/// Which events a listener consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamSelector {
    /// Every event in the store, in global order.
    All,
    /// Events of exactly one stream.
    Named(StreamName),
    /// Events of every stream whose name starts with the prefix.
    Category(StreamPrefix),
}

impl StreamSelector {
    /// Whether an event appended to `stream` is visible through this selector.
    pub fn matches(&self, stream: &StreamName) -> bool {
        match self {
            Self::All => true,
            Self::Named(name) => name == stream,
            Self::Category(prefix) => stream.starts_with(prefix),
        }
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Named(name) => write!(f, "stream:{name}"),
            Self::Category(prefix) => write!(f, "category:{prefix}"),
        }
    }
}

/// Maximum number of events fetched from a stream source per round trip.
#[nutype(
    validate(greater = 0),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Wall-clock instant at which an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The current instant.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing chrono instant.
    pub const fn new(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    /// The wrapped chrono instant.
    pub const fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Reject glob metacharacters (`*`, `?`, `[`, `]`).
///
/// Stream names and prefixes reserve these so selectors can grow pattern
/// matching without an escaping scheme.
fn no_glob_metacharacters(s: &str) -> bool {
    !s.contains(['*', '?', '[', ']'])
}

/// Accept only ASCII letters, digits and underscores.
///
/// Event type names become part of handler names, so they must read as a
/// single identifier.
fn is_identifier(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
