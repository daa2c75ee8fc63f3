//! Core types for the `eventline` runtime.
//!
//! Names that travel between configuration, the event registry and the
//! stream protocol are validated newtypes: once constructed they are
//! always valid, so downstream code never re-checks them.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Name of a configured event, unique within an application.
///
/// Event names may contain dots to express modules (`streams.something_event`).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
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
pub struct EventName(String);

impl EventName {
    /// The last dotted segment of the name (`streams.something_event` -> `something_event`).
    pub fn short_name(&self) -> &str {
        let name: &str = self.as_ref();
        name.rsplit_once('.').map_or(name, |(_, short)| short)
    }
}

/// Name of a durable stream.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
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
pub struct StreamName(String);

/// Name of a consumer group registered on a stream.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
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
pub struct ConsumerGroup(String);

/// Identifier of one member of a consumer group (one per process).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
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
pub struct ConsumerId(String);

impl ConsumerId {
    /// Generates a random consumer id for this process.
    pub fn generate() -> Self {
        Self::try_new(format!("consumer-{}", Uuid::new_v4().simple()))
            .expect("generated consumer id is never empty")
    }
}

/// The literal queue name that selects every queue on a stream.
pub const AUTO_QUEUE: &str = "AUTO";

/// Name of a queue (sub-tag) inside a stream.
///
/// [`AUTO_QUEUE`] is both the default queue producers tag messages with and,
/// in a read binding, the wildcard meaning "every queue on the stream".
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
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
pub struct QueueName(String);

impl QueueName {
    /// The `AUTO` queue.
    pub fn auto() -> Self {
        Self::try_new(AUTO_QUEUE).expect("AUTO is a valid queue name")
    }

    /// Whether this is the `AUTO` queue.
    pub fn is_auto(&self) -> bool {
        let name: &str = self.as_ref();
        name == AUTO_QUEUE
    }
}

/// Application name.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
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
pub struct AppName(String);

/// Application semantic version (`major.minor[.patch]`).
#[nutype(
    sanitize(trim),
    validate(
        not_empty,
        len_char_max = 64,
        predicate = |v: &str| v.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
    ),
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
pub struct AppVersion(String);

impl AppVersion {
    /// Route-safe form of the version, dots replaced by `x` (`0.1` -> `0x1`).
    pub fn route_version(&self) -> String {
        let version: &str = self.as_ref();
        version.replace('.', "x")
    }
}

/// Maximum number of messages coalesced into one write or one read.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

impl BatchSize {
    /// Batch size used when none is configured.
    pub fn default_size() -> Self {
        Self::try_new(100).expect("100 is a valid batch size")
    }

    /// A batch size of one message.
    pub fn one() -> Self {
        Self::try_new(1).expect("1 is a valid batch size")
    }
}

/// A globally unique event identifier using `UUIDv7` format.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
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
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` with the current timestamp.
    pub fn new() -> Self {
        // Uuid::now_v7() always returns a valid v7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a message inside one stream partition.
///
/// Rendered as `<millis>-<seq>`; ordering follows append order. The
/// default is [`MessageId::ZERO`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Milliseconds since the epoch at append time.
    pub millis: u64,
    /// Sequence number disambiguating appends within the same millisecond.
    pub seq: u64,
}

impl MessageId {
    /// The position before any message (`0-0`).
    pub const ZERO: Self = Self { millis: 0, seq: 0 };

    /// Creates a message id.
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Next id for an append at `now_millis`, strictly greater than `self`.
    #[must_use]
    pub const fn next_after(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// Error parsing a [`MessageId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message id '{0}', expected '<millis>-<seq>'")]
pub struct ParseMessageIdError(String);

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseMessageIdError(s.to_string()))?;
        let millis = millis
            .parse()
            .map_err(|_| ParseMessageIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| ParseMessageIdError(s.to_string()))?;
        Ok(Self::new(millis, seq))
    }
}

/// A UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Milliseconds since the Unix epoch, clamped at zero.
    pub fn unix_millis(&self) -> u64 {
        u64::try_from(self.0.timestamp_millis()).unwrap_or(0)
    }

    /// RFC 3339 rendering used in envelopes and logs.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn event_name_accepts_dotted_names(s in "[a-z_]{1,20}(\\.[a-z_]{1,20}){0,3}") {
            let name = EventName::try_new(s.clone()).unwrap();
            prop_assert_eq!(name.as_ref(), &s);
        }

        #[test]
        fn event_name_rejects_blank(s in " {0,20}") {
            prop_assert!(EventName::try_new(s).is_err());
        }

        #[test]
        fn message_id_display_parses_back(millis in 0u64..u64::MAX / 2, seq in 0u64..10_000) {
            let id = MessageId::new(millis, seq);
            prop_assert_eq!(id.to_string().parse::<MessageId>().unwrap(), id);
        }

        #[test]
        fn next_after_is_strictly_increasing(
            millis in 0u64..1_000_000,
            seq in 0u64..1000,
            now in 0u64..2_000_000,
        ) {
            let id = MessageId::new(millis, seq);
            prop_assert!(id.next_after(now) > id);
        }
    }

    #[test]
    fn short_name_strips_module_prefix() {
        let name = EventName::try_new("streams.something_event").unwrap();
        assert_eq!(name.short_name(), "something_event");

        let plain = EventName::try_new("plain").unwrap();
        assert_eq!(plain.short_name(), "plain");
    }

    #[test]
    fn auto_queue_is_recognised() {
        assert!(QueueName::auto().is_auto());
        assert!(!QueueName::try_new("high-prio").unwrap().is_auto());
    }

    #[test]
    fn app_version_route_form() {
        let version = AppVersion::try_new("0.1").unwrap();
        assert_eq!(version.route_version(), "0x1");
        assert!(AppVersion::try_new("1..0").is_err());
        assert!(AppVersion::try_new("1.0 beta").is_err());
    }

    #[test]
    fn batch_size_bounds() {
        assert!(BatchSize::try_new(0).is_err());
        assert_eq!(usize::from(BatchSize::default_size()), 100);
    }

    #[test]
    fn message_id_rejects_garbage() {
        assert!("12".parse::<MessageId>().is_err());
        assert!("a-b".parse::<MessageId>().is_err());
    }

    #[test]
    fn event_id_new_creates_valid_v7() {
        let event_id = EventId::new();
        assert_eq!(
            event_id.as_ref().get_version(),
            Some(uuid::Version::SortRand)
        );
    }
}
