//! Envelope payload encoding.
//!
//! Layout (little-endian): `source_ts:i64, owner:str, collection:str,
//! rkey:str, content_hash:opt<str>, deleted:u8`, followed by the body:
//! `kind:u8` and the kind-specific fields. Strings are `u32 len + UTF-8`,
//! optionals a `u8` presence flag, lists a `u16` count.

use crate::error::{Result, StoreError};
use crate::types::{
    sha256_hex, AccountBody, AccountId, Envelope, IndexKey, LabelBody, NormalizedRecord, PostBody,
    RecordBody, RecordKind, SubjectBody, Timestamp,
};

/// Prefix of hashes the store derives for records that arrive without one.
pub const DERIVED_HASH_PREFIX: &str = "sha256:";

/// Encode an envelope as a log payload.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut w = Writer::default();
    w.i64(envelope.source_timestamp.0);
    w.str(envelope.owner.as_str())?;
    w.str(&envelope.key.collection)?;
    w.str(&envelope.key.rkey)?;
    w.opt_str(envelope.content_hash.as_deref())?;
    w.bool(envelope.deleted);
    encode_body(&mut w, &envelope.body)?;
    Ok(w.buf)
}

/// Decode a log payload.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope> {
    let mut r = Reader::new(payload);
    let source_timestamp = Timestamp(r.i64()?);
    let owner = AccountId::new(r.str()?);
    let collection = r.str()?;
    let rkey = r.str()?;
    let content_hash = r.opt_str()?;
    let deleted = r.bool()?;
    let body = decode_body(&mut r)?;
    if !r.is_empty() {
        return Err(StoreError::Corruption(format!(
            "{} trailing bytes after envelope body",
            r.remaining()
        )));
    }

    Ok(Envelope {
        source_timestamp,
        owner,
        key: IndexKey::new(collection, rkey),
        content_hash,
        deleted,
        body,
    })
}

/// Payload size `record` will encode to, without encoding it.
///
/// Fails with `InvalidRecord` when a field exceeds its length prefix.
pub fn encoded_size(record: &NormalizedRecord) -> Result<usize> {
    let header = 8
        + str_size(record.owner.as_str())?
        + str_size(&record.key.collection)?
        + str_size(&record.key.rkey)?
        + 1
        + record.content_hash.as_deref().map_or(Ok(0), str_size)?
        + 1;

    let body = 1 + match &record.body {
        RecordBody::Post(post) => {
            str_size(&post.text)?
                + str_size(&post.created_at)?
                + 1
                + post.reply_parent.as_deref().map_or(Ok(0), str_size)?
                + list_size(&post.links)?
                + list_size(&post.langs)?
                + list_size(&post.labels)?
        }
        RecordBody::Like(subject) | RecordBody::Repost(subject) => {
            str_size(&subject.subject)? + str_size(&subject.created_at)?
        }
        RecordBody::Follow(account) | RecordBody::Block(account) => {
            str_size(account.subject.as_str())? + str_size(&account.created_at)?
        }
        RecordBody::Label(label) => str_size(&label.uri)? + str_size(&label.value)? + 1,
        RecordBody::Tombstone | RecordBody::Unknown => 0,
    };
    Ok(header + body)
}

fn str_size(s: &str) -> Result<usize> {
    u32::try_from(s.len()).map_err(|_| StoreError::InvalidRecord("string field too long".into()))?;
    Ok(4 + s.len())
}

fn list_size(items: &[String]) -> Result<usize> {
    u16::try_from(items.len()).map_err(|_| StoreError::InvalidRecord("list field too long".into()))?;
    items.iter().try_fold(2, |size, item| Ok(size + str_size(item)?))
}

/// Content hash used for dedup: the supplied one, or a digest of the body.
///
/// Timestamps are excluded so a re-emitted, unchanged record hashes the same.
pub fn effective_hash(envelope: &Envelope) -> Result<String> {
    if let Some(hash) = &envelope.content_hash {
        return Ok(hash.clone());
    }
    let mut w = Writer::default();
    w.bool(envelope.deleted);
    encode_body(&mut w, &envelope.body)?;
    Ok(format!("{}{}", DERIVED_HASH_PREFIX, sha256_hex(&w.buf)))
}

fn encode_body(w: &mut Writer, body: &RecordBody) -> Result<()> {
    w.u8(body.kind() as u8);
    match body {
        RecordBody::Post(post) => {
            w.str(&post.text)?;
            w.str(&post.created_at)?;
            w.opt_str(post.reply_parent.as_deref())?;
            w.list(&post.links)?;
            w.list(&post.langs)?;
            w.list(&post.labels)?;
        }
        RecordBody::Like(subject) | RecordBody::Repost(subject) => {
            w.str(&subject.subject)?;
            w.str(&subject.created_at)?;
        }
        RecordBody::Follow(account) | RecordBody::Block(account) => {
            w.str(account.subject.as_str())?;
            w.str(&account.created_at)?;
        }
        RecordBody::Label(label) => {
            w.str(&label.uri)?;
            w.str(&label.value)?;
            w.bool(label.negated);
        }
        RecordBody::Tombstone | RecordBody::Unknown => {}
    }
    Ok(())
}

fn decode_body(r: &mut Reader<'_>) -> Result<RecordBody> {
    let tag = r.u8()?;
    let kind = RecordKind::from_tag(tag)
        .ok_or_else(|| StoreError::Corruption(format!("unknown record kind tag {}", tag)))?;

    Ok(match kind {
        RecordKind::Post => RecordBody::Post(PostBody {
            text: r.str()?,
            created_at: r.str()?,
            reply_parent: r.opt_str()?,
            links: r.list()?,
            langs: r.list()?,
            labels: r.list()?,
        }),
        RecordKind::Like => RecordBody::Like(decode_subject(r)?),
        RecordKind::Repost => RecordBody::Repost(decode_subject(r)?),
        RecordKind::Follow => RecordBody::Follow(decode_account(r)?),
        RecordKind::Block => RecordBody::Block(decode_account(r)?),
        RecordKind::Label => RecordBody::Label(LabelBody {
            uri: r.str()?,
            value: r.str()?,
            negated: r.bool()?,
        }),
        RecordKind::Tombstone => RecordBody::Tombstone,
        RecordKind::Unknown => RecordBody::Unknown,
    })
}

fn decode_subject(r: &mut Reader<'_>) -> Result<SubjectBody> {
    Ok(SubjectBody {
        subject: r.str()?,
        created_at: r.str()?,
    })
}

fn decode_account(r: &mut Reader<'_>) -> Result<AccountBody> {
    Ok(AccountBody {
        subject: AccountId::new(r.str()?),
        created_at: r.str()?,
    })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) -> Result<()> {
        let len = u32::try_from(s.len())
            .map_err(|_| StoreError::InvalidRecord("string field too long".into()))?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn opt_str(&mut self, s: Option<&str>) -> Result<()> {
        match s {
            Some(s) => {
                self.u8(1);
                self.str(s)
            }
            None => {
                self.u8(0);
                Ok(())
            }
        }
    }

    fn list(&mut self, items: &[String]) -> Result<()> {
        let count = u16::try_from(items.len())
            .map_err(|_| StoreError::InvalidRecord("list field too long".into()))?;
        self.buf.extend_from_slice(&count.to_le_bytes());
        for item in items {
            self.str(item)?;
        }
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StoreError::Corruption("envelope payload truncated".into()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StoreError::Corruption(format!("invalid bool byte {}", other))),
        }
    }

    fn i64(&mut self) -> Result<i64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    fn str(&mut self) -> Result<String> {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(self.take(4)?);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StoreError::Corruption(format!("invalid UTF-8 in envelope: {}", e)))
    }

    fn opt_str(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.str()?))
        } else {
            Ok(None)
        }
    }

    fn list(&mut self) -> Result<Vec<String>> {
        let mut count_bytes = [0u8; 2];
        count_bytes.copy_from_slice(self.take(2)?);
        let count = u16::from_le_bytes(count_bytes) as usize;
        (0..count).map(|_| self.str()).collect()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_envelope(text: &str) -> Envelope {
        Envelope {
            source_timestamp: Timestamp(1_700_000_000_000),
            owner: AccountId::new("did:plc:alice"),
            key: IndexKey::new("app.bsky.feed.post", "3k2a"),
            content_hash: None,
            deleted: false,
            body: RecordBody::Post(PostBody {
                text: text.to_string(),
                created_at: "2024-01-01T00:00:00Z".to_string(),
                reply_parent: Some("at://did:plc:bob/app.bsky.feed.post/1".to_string()),
                links: vec!["https://example.com".to_string()],
                langs: vec!["en".to_string()],
                labels: vec![],
            }),
        }
    }

    #[test]
    fn test_field_order() {
        let envelope = post_envelope("hi");
        let bytes = encode_envelope(&envelope).unwrap();

        assert_eq!(&bytes[0..8], &1_700_000_000_000i64.to_le_bytes());
        assert_eq!(&bytes[8..12], &13u32.to_le_bytes());
        assert_eq!(&bytes[12..25], b"did:plc:alice");
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_truncated_payload_is_corruption() {
        let bytes = encode_envelope(&post_envelope("hello")).unwrap();
        let result = decode_envelope(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_derived_hash_ignores_timestamp() {
        let a = post_envelope("same");
        let mut b = a.clone();
        b.source_timestamp = Timestamp(42);
        let c = post_envelope("different");

        let hash_a = effective_hash(&a).unwrap();
        assert!(hash_a.starts_with(DERIVED_HASH_PREFIX));
        assert_eq!(hash_a, effective_hash(&b).unwrap());
        assert_ne!(hash_a, effective_hash(&c).unwrap());
    }

    #[test]
    fn test_supplied_hash_wins() {
        let mut envelope = post_envelope("x");
        envelope.content_hash = Some("bafyrei123".to_string());
        assert_eq!(effective_hash(&envelope).unwrap(), "bafyrei123");
    }

    #[test]
    fn test_encoded_size_matches_encoding() {
        let envelope = post_envelope("sized");
        let record = NormalizedRecord {
            source_timestamp: envelope.source_timestamp,
            owner: envelope.owner.clone(),
            key: envelope.key.clone(),
            content_hash: Some("bafyrei123".to_string()),
            body: envelope.body.clone(),
        };
        let encoded = encode_envelope(&Envelope::from(record.clone())).unwrap();
        assert_eq!(encoded_size(&record).unwrap(), encoded.len());

        let tombstone = NormalizedRecord::tombstone(envelope.owner, envelope.key, Timestamp(2));
        let encoded = encode_envelope(&Envelope::from(tombstone.clone())).unwrap();
        assert_eq!(encoded_size(&tombstone).unwrap(), encoded.len());
    }

    #[test]
    fn test_list_over_count_limit_rejected() {
        let mut envelope = post_envelope("many links");
        if let RecordBody::Post(post) = &mut envelope.body {
            post.links = vec![String::new(); u16::MAX as usize + 1];
        }
        let record = NormalizedRecord::new(
            envelope.owner.clone(),
            envelope.key.clone(),
            envelope.source_timestamp,
            envelope.body.clone(),
        );
        assert!(matches!(encoded_size(&record), Err(StoreError::InvalidRecord(_))));
        assert!(matches!(encode_envelope(&envelope), Err(StoreError::InvalidRecord(_))));
    }
}
