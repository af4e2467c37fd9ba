//! Indexer Bridge (spec §4, §6): the read/write surface this engine needs from the full-text
//! indexer, built over [`bindings`]'s FFI wrapper around `libnotmuch`.
//!
//! The tag-prefix posting-list iteration and message-id value-stream iteration the scanner's
//! merge join wants (§4.3) aren't primitives `libnotmuch`'s public API exposes directly (those
//! are Xapian-level concepts upstream); this bridge approximates them on top of notmuch's own
//! query API instead of adding a second, Xapian-specific FFI surface.

pub mod bindings;

use std::{collections, path};

/// One message as the indexer currently knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
  pub docid: i64,
  pub message_id: String,
}

pub struct Indexer {
  database: bindings::Database,
}

impl Indexer {
  pub fn open(path: &path::Path) -> anyhow::Result<Self> {
    let database = bindings::Database::open(Some(path))
      .map_err(|error| anyhow::anyhow!("opening notmuch database at {}: {error}", path.display()))?;
    Ok(Self { database })
  }

  pub fn create(path: &path::Path) -> anyhow::Result<Self> {
    let database = bindings::Database::create(path)
      .map_err(|error| anyhow::anyhow!("creating notmuch database at {}: {error}", path.display()))?;
    Ok(Self { database })
  }

  /// Every `(docid, message_id)` pair currently known to the indexer, ordered by docid: the
  /// message-id side of the scanner's streaming merge join (spec §4.3).
  pub fn message_ids(&self) -> anyhow::Result<Vec<MessageRecord>> {
    let mut messages = self
      .database
      .query("")
      .map_err(|error| anyhow::anyhow!("querying all messages: {error}"))?;
    let mut records = Vec::new();
    while let Some(message) = messages.next() {
      let message_id = message
        .id()
        .map_err(|error| anyhow::anyhow!("reading message-id: {error}"))?
        .to_string();
      records.push(MessageRecord {
        docid: message.docid() as i64,
        message_id,
      });
    }
    records.sort_by_key(|record| record.docid);
    Ok(records)
  }

  /// Every docid carrying `tag`, ordered: one term's postings for the scanner's per-tag merge
  /// join (spec §4.3).
  pub fn docids_with_tag(&self, tag: &str) -> anyhow::Result<Vec<i64>> {
    let query = format!("tag:{}", quote_term(tag));
    let mut messages = self
      .database
      .query(&query)
      .map_err(|error| anyhow::anyhow!("querying tag {tag:?}: {error}"))?;
    let mut docids = Vec::new();
    while let Some(message) = messages.next() {
      docids.push(message.docid() as i64);
    }
    docids.sort_unstable();
    Ok(docids)
  }

  /// Every distinct tag name the indexer currently has any message filed under (the set of terms
  /// the scanner iterates with [`Self::docids_with_tag`]).
  pub fn all_tags(&self) -> anyhow::Result<Vec<String>> {
    let mut tags = self
      .database
      .all_tags()
      .map_err(|error| anyhow::anyhow!("listing tags: {error}"))?;
    let mut out = Vec::new();
    while let Some(tag) = tags.next().map_err(|error| anyhow::anyhow!("reading tag: {error}"))? {
      out.push(tag.to_string());
    }
    Ok(out)
  }

  /// Adds `path` as a new document, or attaches it as an additional copy of an existing
  /// message-id (notmuch dedupes on the `Message-ID` header), returning the resulting docid and
  /// message-id.
  pub fn add_file(&self, path: &path::Path) -> anyhow::Result<MessageRecord> {
    let message = self
      .database
      .index_message(path)
      .map_err(|error| anyhow::anyhow!("indexing {}: {error}", path.display()))?;
    let message_id = message
      .id()
      .map_err(|error| anyhow::anyhow!("reading message-id: {error}"))?
      .to_string();
    Ok(MessageRecord {
      docid: message.docid() as i64,
      message_id,
    })
  }

  pub fn remove_file(&self, path: &path::Path) -> anyhow::Result<()> {
    self
      .database
      .remove_message(path)
      .map_err(|error| anyhow::anyhow!("removing {}: {error}", path.display()))
  }

  pub fn find_by_filename(&self, path: &path::Path) -> anyhow::Result<Option<MessageRecord>> {
    let message = self
      .database
      .find_message_by_filename(path)
      .map_err(|error| anyhow::anyhow!("looking up {}: {error}", path.display()))?;
    match message {
      Some(message) => Ok(Some(MessageRecord {
        docid: message.docid() as i64,
        message_id: message
          .id()
          .map_err(|error| anyhow::anyhow!("reading message-id: {error}"))?
          .to_string(),
      })),
      None => Ok(None),
    }
  }

  /// Sets the exact tag set of the message identified by `message_id`, atomically
  /// (freeze/remove-all/add-each/thaw, spec §4.4/§6). Returns `false` without touching anything
  /// if the indexer doesn't know this message-id.
  pub fn set_tags(&self, message_id: &str, tags: &collections::HashSet<String>) -> anyhow::Result<bool> {
    let query = format!("id:{}", quote_term(message_id));
    let mut messages = self
      .database
      .query(&query)
      .map_err(|error| anyhow::anyhow!("querying id {message_id:?}: {error}"))?;
    let Some(mut message) = messages.next() else {
      return Ok(false);
    };
    message.freeze().map_err(|error| anyhow::anyhow!("freezing message: {error}"))?;
    let outcome: anyhow::Result<()> = (|| {
      message
        .remove_all_tags()
        .map_err(|error| anyhow::anyhow!("clearing tags: {error}"))?;
      for tag in tags {
        message
          .add_tag(tag)
          .map_err(|error| anyhow::anyhow!("adding tag {tag:?}: {error}"))?;
      }
      Ok(())
    })();
    message.thaw().map_err(|error| anyhow::anyhow!("thawing message: {error}"))?;
    outcome?;
    Ok(true)
  }
}

/// Quotes a value for notmuch's query grammar: bare if it's a plain token, else double-quoted
/// with `\`/`"` escaped.
fn quote_term(value: &str) -> String {
  if !value.is_empty()
    && value
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | '+'))
  {
    value.to_string()
  } else {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn email(message_id: &str, body: &str) -> String {
    format!("From: a@example.com\nTo: b@example.com\nSubject: test\nMessage-ID: <{message_id}>\n\n{body}\n")
  }

  #[test]
  fn add_file_then_find_by_filename_round_trips_docid() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mailroot = directory.path().join("mail");
    std::fs::create_dir_all(mailroot.join("cur"))?;
    let message_path = mailroot.join("cur").join("1.eml");
    std::fs::write(&message_path, email("m1@example.com", "hello"))?;

    let indexer = Indexer::create(&mailroot)?;
    let added = indexer.add_file(&message_path)?;
    assert_eq!("m1@example.com", added.message_id);

    let found = indexer.find_by_filename(&message_path)?.unwrap();
    assert_eq!(added, found);
    Ok(())
  }

  #[test]
  fn set_tags_then_docids_with_tag_reflects_change() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mailroot = directory.path().join("mail");
    std::fs::create_dir_all(mailroot.join("cur"))?;
    let message_path = mailroot.join("cur").join("1.eml");
    std::fs::write(&message_path, email("m2@example.com", "hello"))?;

    let indexer = Indexer::create(&mailroot)?;
    let added = indexer.add_file(&message_path)?;
    let tags = collections::HashSet::from(["inbox".to_string(), "unread".to_string()]);
    assert!(indexer.set_tags(&added.message_id, &tags)?);

    assert_eq!(vec![added.docid], indexer.docids_with_tag("inbox")?);
    assert!(indexer.all_tags()?.contains(&"unread".to_string()));

    let empty = collections::HashSet::new();
    indexer.set_tags(&added.message_id, &empty)?;
    assert!(indexer.docids_with_tag("inbox")?.is_empty());
    Ok(())
  }

  #[test]
  fn set_tags_on_unknown_message_id_is_a_no_op() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mailroot = directory.path().join("mail");
    std::fs::create_dir_all(mailroot.join("cur"))?;
    let indexer = Indexer::create(&mailroot)?;
    let tags = collections::HashSet::from(["inbox".to_string()]);
    assert!(!indexer.set_tags("nobody@example.com", &tags)?);
    Ok(())
  }

  #[test]
  fn message_ids_lists_every_known_document() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mailroot = directory.path().join("mail");
    std::fs::create_dir_all(mailroot.join("cur"))?;
    let indexer = Indexer::create(&mailroot)?;
    for (i, message_id) in ["a@example.com", "b@example.com"].into_iter().enumerate() {
      let message_path = mailroot.join("cur").join(format!("{i}.eml"));
      std::fs::write(&message_path, email(message_id, "hi"))?;
      indexer.add_file(&message_path)?;
    }
    let mut ids: Vec<_> = indexer.message_ids()?.into_iter().map(|record| record.message_id).collect();
    ids.sort();
    assert_eq!(vec!["a@example.com".to_string(), "b@example.com".to_string()], ids);
    Ok(())
  }

  #[test]
  fn quote_term_leaves_plain_tokens_untouched() {
    assert_eq!("inbox", quote_term("inbox"));
    assert_eq!("abc@example.com", quote_term("abc@example.com"));
    assert_eq!("\"has space\"", quote_term("has space"));
    assert_eq!("\"a\\\"b\"", quote_term("a\"b"));
  }
}
