//! Domain types shared by every component of the node.
//!
//! All identifiers are **newtypes** — thin wrappers around primitives that
//! give them distinct identities in the type system. A `DeviceId` can never
//! be passed where a `GroupId` is expected, even though both are UUID-shaped
//! strings under the hood. We derive `Serialize`/`Deserialize` so these types
//! round-trip through the JSON wire format and the on-disk history log
//! without any extra glue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// DeviceId — uniquely identifies a node on the network
// ---------------------------------------------------------------------------

/// A stable identifier for a running node, generated once on first run and
/// persisted in the local config. Every peer record, group membership set,
/// and history log is keyed by `DeviceId`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a `DeviceId` from an existing string (e.g. loaded from config
    /// or parsed off the wire).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random `DeviceId` using UUID v4.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageId / GroupId — UUID-shaped identifiers for chat messages and groups
// ---------------------------------------------------------------------------

/// A unique identifier for a direct or group chat message. Generated by the
/// sender and carried in the envelope so duplicate application (e.g. a group
/// relay observed twice) can be detected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unique identifier for a group chat.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FileId — the 16 raw bytes identifying one file transfer
// ---------------------------------------------------------------------------

/// A 16-byte identifier for a single file transfer, carried verbatim in both
/// the `file_meta` and `file_chunk` binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId([u8; 16]);

impl FileId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform — the kind of device a node runs on
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Pc,
    Android,
    Ios,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Pc => "pc",
            Platform::Android => "android",
            Platform::Ios => "ios",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// DeviceName — a human-readable name chosen by the user
// ---------------------------------------------------------------------------

/// A human-readable name for a node, e.g. "kitchen-pc" or "ignacios-phone".
///
/// Validated on creation:
/// - Must not be empty after trimming
/// - Maximum 50 characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceName(String);

#[derive(Debug, thiserror::Error)]
pub enum DeviceNameError {
    #[error("device name cannot be empty")]
    Empty,
    #[error("device name cannot exceed {max} characters (got {got})")]
    TooLong { max: usize, got: usize },
}

impl DeviceName {
    pub const MAX_LENGTH: usize = 50;

    pub fn new(name: impl Into<String>) -> Result<Self, DeviceNameError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(DeviceNameError::Empty);
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(DeviceNameError::TooLong {
                max: Self::MAX_LENGTH,
                got: name.len(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageText — the text body of a chat message
// ---------------------------------------------------------------------------

/// The text content of a direct or group chat message.
///
/// Validated on creation:
/// - Must not be empty (after trimming)
/// - Maximum 10,000 characters
///
/// Unlike `DeviceName`, the content itself is not trimmed — a user may
/// intend leading/trailing whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageText(String);

#[derive(Debug, thiserror::Error)]
pub enum MessageTextError {
    #[error("message text cannot be empty")]
    Empty,
    #[error("message text cannot exceed {max} characters (got {got})")]
    TooLong { max: usize, got: usize },
}

impl MessageText {
    pub const MAX_LENGTH: usize = 10_000;

    pub fn new(content: impl Into<String>) -> Result<Self, MessageTextError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MessageTextError::Empty);
        }
        if content.len() > Self::MAX_LENGTH {
            return Err(MessageTextError::TooLong {
                max: Self::MAX_LENGTH,
                got: content.len(),
            });
        }
        Ok(Self(content))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Timestamp — Unix seconds since epoch
// ---------------------------------------------------------------------------

/// A point in time as whole seconds since the Unix epoch, matching the
/// integer-seconds timestamp field carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp())
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    /// Formats this timestamp as a local time string like "10:30:45".
    pub fn format_local_time(&self) -> String {
        use chrono::{Local, TimeZone};
        match Local.timestamp_opt(self.0, 0) {
            chrono::LocalResult::Single(dt) => dt.format("%H:%M:%S").to_string(),
            _ => "??:??:??".to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_local_time())
    }
}

// ---------------------------------------------------------------------------
// GroupRecord — converged membership/master/epoch state for one group
// ---------------------------------------------------------------------------

/// Local view of a group's membership and master-relay state.
///
/// `master_id` is always an element of `members`. When two peers disagree,
/// the record with the higher `epoch` wins; ties are broken by the
/// lexicographically greater `master_id` (see `merge_announcement`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: GroupId,
    pub name: String,
    pub members: BTreeSet<DeviceId>,
    pub master_id: DeviceId,
    pub epoch: i64,
}

impl GroupRecord {
    pub fn new(group_id: GroupId, name: impl Into<String>, creator: DeviceId, epoch: i64) -> Self {
        let mut members = BTreeSet::new();
        members.insert(creator.clone());
        Self {
            group_id,
            name: name.into(),
            members,
            master_id: creator,
            epoch,
        }
    }

    /// Elects the lexicographically smallest candidate as master. `candidates`
    /// must be non-empty; panics otherwise since the caller is expected to
    /// always include at least its own device id.
    pub fn elect_master<'a>(candidates: impl IntoIterator<Item = &'a DeviceId>) -> DeviceId {
        candidates
            .into_iter()
            .min()
            .cloned()
            .expect("master election requires at least one candidate")
    }

    /// Applies an incoming `group_master` announcement, following the
    /// higher-epoch-wins / lexicographically-greater-master-id-breaks-ties
    /// convergence rule. Returns true if the announcement was accepted.
    pub fn merge_announcement(
        &mut self,
        members: BTreeSet<DeviceId>,
        master_id: DeviceId,
        epoch: i64,
    ) -> bool {
        let accept = epoch > self.epoch || (epoch == self.epoch && master_id > self.master_id);
        if accept {
            self.members = members;
            self.master_id = master_id;
            self.epoch = epoch;
        }
        accept
    }
}

// ---------------------------------------------------------------------------
// DiscoveredPeer — a record surfaced by the UDP discovery collaborator
// ---------------------------------------------------------------------------

/// Information about a node observed via UDP broadcast discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: Platform,
    pub ip: std::net::IpAddr,
    pub tcp_port: u16,
    pub last_seen: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_generate_is_unique() {
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn device_id_display() {
        let id = DeviceId::new("abc-123");
        assert_eq!(id.to_string(), "abc-123");
    }

    #[test]
    fn file_id_roundtrips_bytes() {
        let bytes = [7u8; 16];
        let id = FileId::from_bytes(bytes);
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn file_id_display_is_hex() {
        let id = FileId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn device_name_trimmed() {
        let name = DeviceName::new("  kitchen-pc  ").unwrap();
        assert_eq!(name.as_str(), "kitchen-pc");
    }

    #[test]
    fn device_name_empty_rejected() {
        assert!(DeviceName::new("").is_err());
        assert!(DeviceName::new("   ").is_err());
    }

    #[test]
    fn device_name_too_long_rejected() {
        assert!(DeviceName::new("a".repeat(51)).is_err());
    }

    #[test]
    fn message_text_rejects_all_whitespace() {
        assert!(MessageText::new("   ").is_err());
    }

    #[test]
    fn message_text_preserves_whitespace() {
        let t = MessageText::new("  hi  ").unwrap();
        assert_eq!(t.as_str(), "  hi  ");
    }

    #[test]
    fn message_text_too_long_rejected() {
        assert!(MessageText::new("a".repeat(10_001)).is_err());
    }

    #[test]
    fn timestamp_ordering() {
        let earlier = Timestamp::from_secs(1000);
        let later = Timestamp::from_secs(2000);
        assert!(earlier < later);
    }

    #[test]
    fn elect_master_picks_lexicographically_smallest() {
        let a = DeviceId::new("a");
        let b = DeviceId::new("b");
        let c = DeviceId::new("c");
        let elected = GroupRecord::elect_master([&b, &c, &a]);
        assert_eq!(elected, a);
    }

    #[test]
    fn merge_announcement_accepts_higher_epoch() {
        let mut record = GroupRecord::new(GroupId::new("g"), "family", DeviceId::new("a"), 1);
        let mut members = BTreeSet::new();
        members.insert(DeviceId::new("a"));
        members.insert(DeviceId::new("b"));
        let accepted = record.merge_announcement(members.clone(), DeviceId::new("b"), 2);
        assert!(accepted);
        assert_eq!(record.epoch, 2);
        assert_eq!(record.master_id, DeviceId::new("b"));
        assert_eq!(record.members, members);
    }

    #[test]
    fn merge_announcement_rejects_older_epoch() {
        let mut record = GroupRecord::new(GroupId::new("g"), "family", DeviceId::new("a"), 5);
        let accepted =
            record.merge_announcement(BTreeSet::new(), DeviceId::new("z"), 4);
        assert!(!accepted);
        assert_eq!(record.epoch, 5);
    }

    #[test]
    fn merge_announcement_tiebreaks_on_master_id() {
        let mut record = GroupRecord::new(GroupId::new("g"), "family", DeviceId::new("a"), 3);
        let mut members = BTreeSet::new();
        members.insert(DeviceId::new("z"));
        let accepted = record.merge_announcement(members, DeviceId::new("z"), 3);
        assert!(accepted, "equal epoch, lexicographically greater master_id should win");
    }

    #[test]
    fn device_id_serde_json_roundtrip() {
        let id = DeviceId::new("test-device-123");
        let json = serde_json::to_string(&id).unwrap();
        let parsed: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
