//! Core types for the engagement ledger.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identifier for an account (typically a DID).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        AccountId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier with a known `did:plc:` / `did:web:` scheme removed.
    pub fn without_scheme(&self) -> &str {
        self.0
            .strip_prefix("did:plc:")
            .or_else(|| self.0.strip_prefix("did:web:"))
            .unwrap_or(&self.0)
    }

    /// Two-character shard prefix used for the on-disk directory layout.
    pub fn shard_prefix(&self) -> String {
        let sanitized: String = self
            .without_scheme()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(2)
            .collect();
        if sanitized.len() == 2 {
            sanitized.to_ascii_lowercase()
        } else {
            "xx".to_string()
        }
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        AccountId::new(s)
    }
}

/// Logical key of a record inside one account: (collection, record key).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub collection: String,
    pub rkey: String,
}

impl IndexKey {
    pub fn new(collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexKey({}/{})", self.collection, self.rkey)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

/// Fully qualified record reference: `at://{account}/{collection}/{rkey}`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordUri {
    pub account: AccountId,
    pub key: IndexKey,
}

impl RecordUri {
    pub fn new(account: AccountId, key: IndexKey) -> Self {
        Self { account, key }
    }

    /// Parse an `at://` URI (scheme optional) or a `bsky.app` post link whose
    /// profile segment is already an account id.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if let Some(rest) = trimmed
            .strip_prefix("https://bsky.app/profile/")
            .or_else(|| trimmed.strip_prefix("http://bsky.app/profile/"))
        {
            return Self::parse_app_link(input, rest);
        }

        let rest = trimmed.strip_prefix("at://").unwrap_or(trimmed);
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(StoreError::InvalidUri(format!(
                "{}: expected at://{{account}}/{{collection}}/{{rkey}}",
                input
            )));
        }

        Ok(Self {
            account: AccountId::new(parts[0]),
            key: IndexKey::new(parts[1], parts[2]),
        })
    }

    fn parse_app_link(input: &str, rest: &str) -> Result<Self> {
        // {account}/post/{rkey}
        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        if parts.len() != 3 || parts[1] != "post" || !parts[0].starts_with("did:") {
            return Err(StoreError::InvalidUri(format!(
                "{}: only bsky.app post links with a DID profile are supported",
                input
            )));
        }

        Ok(Self {
            account: AccountId::new(parts[0]),
            key: IndexKey::new(POST_COLLECTION, parts[2]),
        })
    }
}

impl fmt::Debug for RecordUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordUri({})", self)
    }
}

impl fmt::Display for RecordUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}", self.account, self.key)
    }
}

/// Collection name of posts in the social-graph repository.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Whether a collection name denotes posts.
pub fn is_post_collection(collection: &str) -> bool {
    collection == "feed.post" || collection.ends_with(".feed.post")
}

/// Identifier of a counters slot inside one account's sidecar.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({})", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of fact an envelope carries. Discriminants are the on-disk tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Unknown = 0,
    Post = 1,
    Like = 2,
    Repost = 3,
    Follow = 4,
    Block = 5,
    Label = 6,
    Tombstone = 7,
}

impl RecordKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => RecordKind::Unknown,
            1 => RecordKind::Post,
            2 => RecordKind::Like,
            3 => RecordKind::Repost,
            4 => RecordKind::Follow,
            5 => RecordKind::Block,
            6 => RecordKind::Label,
            7 => RecordKind::Tombstone,
            _ => return None,
        })
    }
}

/// Normalized post fields retained by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostBody {
    pub text: String,
    pub created_at: String,
    /// URI of the post this one replies to.
    pub reply_parent: Option<String>,
    /// Simplified link and mention URLs from facets and embeds.
    pub links: Vec<String>,
    pub langs: Vec<String>,
    pub labels: Vec<String>,
}

/// Like or repost of another record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectBody {
    pub subject: String,
    pub created_at: String,
}

/// Follow or block of another account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBody {
    pub subject: AccountId,
    pub created_at: String,
}

/// Moderation label applied to a URI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelBody {
    pub uri: String,
    pub value: String,
    pub negated: bool,
}

/// Kind-specific payload of a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordBody {
    Post(PostBody),
    Like(SubjectBody),
    Repost(SubjectBody),
    Follow(AccountBody),
    Block(AccountBody),
    Label(LabelBody),
    Tombstone,
    Unknown,
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Post(_) => RecordKind::Post,
            RecordBody::Like(_) => RecordKind::Like,
            RecordBody::Repost(_) => RecordKind::Repost,
            RecordBody::Follow(_) => RecordKind::Follow,
            RecordBody::Block(_) => RecordKind::Block,
            RecordBody::Label(_) => RecordKind::Label,
            RecordBody::Tombstone => RecordKind::Tombstone,
            RecordBody::Unknown => RecordKind::Unknown,
        }
    }
}

/// Candidate record produced by the snapshot decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub source_timestamp: Timestamp,
    pub owner: AccountId,
    pub key: IndexKey,
    pub content_hash: Option<String>,
    pub body: RecordBody,
}

impl NormalizedRecord {
    pub fn new(owner: AccountId, key: IndexKey, source_timestamp: Timestamp, body: RecordBody) -> Self {
        Self {
            source_timestamp,
            owner,
            key,
            content_hash: None,
            body,
        }
    }

    /// Set the decoder-supplied content hash.
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Tombstone for `key`.
    pub fn tombstone(owner: AccountId, key: IndexKey, source_timestamp: Timestamp) -> Self {
        Self::new(owner, key, source_timestamp, RecordBody::Tombstone)
    }
}

/// One immutable, versioned fact about a repository record as stored in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub source_timestamp: Timestamp,
    pub owner: AccountId,
    pub key: IndexKey,
    pub content_hash: Option<String>,
    pub deleted: bool,
    pub body: RecordBody,
}

impl Envelope {
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }
}

impl From<NormalizedRecord> for Envelope {
    fn from(record: NormalizedRecord) -> Self {
        let deleted = matches!(record.body, RecordBody::Tombstone);
        Self {
            source_timestamp: record.source_timestamp,
            owner: record.owner,
            key: record.key,
            content_hash: record.content_hash,
            deleted,
            body: record.body,
        }
    }
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Engagement counters held in a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Counter {
    Like,
    Reply,
    Repost,
    Quote,
}

impl Counter {
    pub const ALL: [Counter; 4] = [Counter::Like, Counter::Reply, Counter::Repost, Counter::Quote];

    /// Presence bit for this counter.
    pub fn bit(self) -> u64 {
        1 << self.position()
    }

    fn position(self) -> usize {
        match self {
            Counter::Like => 0,
            Counter::Reply => 1,
            Counter::Repost => 2,
            Counter::Quote => 3,
        }
    }
}

/// Size of an encoded counters slot.
pub const SLOT_SIZE: usize = 56;

/// Aggregate engagement counts for one record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSlot {
    pub like_count: u64,
    pub reply_count: u64,
    pub repost_count: u64,
    pub quote_count: u64,
    pub updated_at: Timestamp,
    pub presence: u64,
}

impl CountersSlot {
    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Like => self.like_count,
            Counter::Reply => self.reply_count,
            Counter::Repost => self.repost_count,
            Counter::Quote => self.quote_count,
        }
    }

    fn get_mut(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::Like => &mut self.like_count,
            Counter::Reply => &mut self.reply_count,
            Counter::Repost => &mut self.repost_count,
            Counter::Quote => &mut self.quote_count,
        }
    }

    /// Whether the counter has ever been observed.
    pub fn is_known(&self, counter: Counter) -> bool {
        self.presence & counter.bit() != 0
    }

    /// Known value of `counter`, `None` while it is still unknown.
    pub fn known(&self, counter: Counter) -> Option<u64> {
        self.is_known(counter).then(|| self.get(counter))
    }

    /// Add `delta` to a counter, marking it present.
    pub fn bump(&mut self, counter: Counter, delta: u64, at: Timestamp) {
        let value = self.get_mut(counter);
        *value = value.saturating_add(delta);
        self.presence |= counter.bit();
        self.updated_at = self.updated_at.max(at);
    }

    /// Overwrite every counter with authoritative values.
    pub fn overwrite(&mut self, counts: &AuthoritativeCounts, at: Timestamp) {
        self.like_count = counts.likes;
        self.reply_count = counts.replies;
        self.repost_count = counts.reposts;
        self.quote_count = counts.quotes;
        self.presence = Counter::ALL.iter().fold(0, |acc, c| acc | c.bit());
        self.updated_at = at;
    }

    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..8].copy_from_slice(&self.like_count.to_le_bytes());
        buf[8..16].copy_from_slice(&self.reply_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.repost_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.quote_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.updated_at.0.to_le_bytes());
        buf[40..48].copy_from_slice(&self.presence.to_le_bytes());
        // 48..56 reserved, always zero.
        buf
    }

    pub fn decode(buf: &[u8; SLOT_SIZE]) -> Self {
        let u = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            b
        };
        Self {
            like_count: u64::from_le_bytes(u(0)),
            reply_count: u64::from_le_bytes(u(8)),
            repost_count: u64::from_le_bytes(u(16)),
            quote_count: u64::from_le_bytes(u(24)),
            updated_at: Timestamp(i64::from_le_bytes(u(32))),
            presence: u64::from_le_bytes(u(40)),
        }
    }
}

/// Counts supplied by the enrichment collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeCounts {
    pub likes: u64,
    pub replies: u64,
    pub reposts: u64,
    pub quotes: u64,
}

/// Relationship of the viewing account to a record, as reported remotely.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerFlags {
    /// URI of the viewer's like, if any.
    pub like: Option<String>,
    /// URI of the viewer's repost, if any.
    pub repost: Option<String>,
    pub thread_muted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_at_uri() {
        let uri = RecordUri::parse("at://did:plc:abc123/app.bsky.feed.post/xyz789").unwrap();
        assert_eq!(uri.account.as_str(), "did:plc:abc123");
        assert_eq!(uri.key, IndexKey::new("app.bsky.feed.post", "xyz789"));
        assert_eq!(uri.to_string(), "at://did:plc:abc123/app.bsky.feed.post/xyz789");
    }

    #[test]
    fn test_parse_schemeless_uri() {
        let uri = RecordUri::parse("A/feed.post/r1").unwrap();
        assert_eq!(uri.account.as_str(), "A");
        assert_eq!(uri.key, IndexKey::new("feed.post", "r1"));
    }

    #[test]
    fn test_parse_invalid_uri() {
        assert!(RecordUri::parse("at://did:plc:abc123").is_err());
        assert!(RecordUri::parse("at://did:plc:abc123/app.bsky.feed.post/x/extra").is_err());
        assert!(RecordUri::parse("at://did:plc:abc123//x").is_err());
    }

    #[test]
    fn test_parse_app_link() {
        let uri = RecordUri::parse("https://bsky.app/profile/did:plc:abc/post/3k2").unwrap();
        assert_eq!(uri.account.as_str(), "did:plc:abc");
        assert_eq!(uri.key, IndexKey::new(POST_COLLECTION, "3k2"));

        // Handles need resolution, which the store never does.
        assert!(RecordUri::parse("https://bsky.app/profile/alice.bsky.social/post/3k2").is_err());
    }

    #[test]
    fn test_shard_prefix() {
        assert_eq!(AccountId::new("did:plc:abc123").shard_prefix(), "ab");
        assert_eq!(AccountId::new("did:web:x.example").shard_prefix(), "xe");
        assert_eq!(AccountId::new("A").shard_prefix(), "xx");
    }

    #[test]
    fn test_slot_layout() {
        let mut slot = CountersSlot::default();
        slot.bump(Counter::Like, 3, Timestamp(10));
        slot.bump(Counter::Quote, 1, Timestamp(5));

        let bytes = slot.encode();
        assert_eq!(bytes.len(), 56);
        assert_eq!(&bytes[0..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &10i64.to_le_bytes());
        assert_eq!(&bytes[40..48], &0b1001u64.to_le_bytes());
        assert_eq!(CountersSlot::decode(&bytes), slot);
    }

    #[test]
    fn test_unknown_until_present() {
        let mut slot = CountersSlot::default();
        assert_eq!(slot.known(Counter::Reply), None);
        slot.bump(Counter::Reply, 0, Timestamp(1));
        assert_eq!(slot.known(Counter::Reply), Some(0));
    }
}
