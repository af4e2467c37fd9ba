//! The wire grammar: percent-encoding and the sync-vector / writestamp / hash-info / tag-info
//! value formats exchanged by the protocol engine.

use std::{collections, fmt};

use anyhow::Context as _;

/// Bytes in this set are written as themselves; everything else becomes `%xx` lowercase hex.
fn is_unreserved(byte: u8) -> bool {
  byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b',' | b'-' | b'.' | b'/' | b'_' | b'@' | b'=')
}

pub fn percent_encode(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  for byte in input.bytes() {
    if is_unreserved(byte) {
      out.push(byte as char);
    } else {
      out.push_str(&format!("%{byte:02x}"));
    }
  }
  out
}

pub fn percent_decode(input: &str) -> anyhow::Result<String> {
  let bytes = input.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' {
      anyhow::ensure!(i + 3 <= bytes.len(), "truncated percent-escape in {input:?}");
      let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).context("malformed percent-escape")?;
      let value = u8::from_str_radix(hex, 16).context("malformed percent-escape")?;
      out.push(value);
      i += 3;
    } else {
      out.push(bytes[i]);
      i += 1;
    }
  }
  String::from_utf8(out).context("percent-decoded bytes aren't valid UTF-8")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Writestamp {
  pub replica: i64,
  pub version: i64,
}

impl fmt::Display for Writestamp {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(formatter, "R{}={}", self.replica, self.version)
  }
}

/// Per-replica highest observed version. An absent replica is implicitly version `-1`.
pub type SyncVector = collections::HashMap<i64, i64>;

pub fn sync_vector_get(vector: &SyncVector, replica: i64) -> i64 {
  vector.get(&replica).copied().unwrap_or(-1)
}

pub fn format_sync_vector(vector: &SyncVector) -> String {
  let mut entries: Vec<_> = vector.iter().collect();
  entries.sort();
  let body: Vec<String> = entries
    .into_iter()
    .map(|(&replica, &version)| Writestamp { replica, version }.to_string())
    .collect();
  format!("<{}>", body.join(","))
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashInfo {
  pub hash: String,
  pub size: i64,
  pub message_id: String,
  pub hash_stamp: Writestamp,
  /// directory path (relative to the maildir root) -> link count in that directory
  pub dirs: collections::HashMap<String, i64>,
}

impl fmt::Display for HashInfo {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut dirs: Vec<_> = self.dirs.iter().collect();
    dirs.sort();
    let body: Vec<String> = dirs
      .into_iter()
      .map(|(dir, count)| format!("{count}*{}", percent_encode(dir)))
      .collect();
    write!(
      formatter,
      "L {} {} {} {} ({})",
      self.hash,
      self.size,
      percent_encode(&self.message_id),
      self.hash_stamp,
      body.join(" ")
    )
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagInfo {
  pub message_id: String,
  pub tag_stamp: Writestamp,
  pub tags: collections::HashSet<String>,
}

impl fmt::Display for TagInfo {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut tags: Vec<_> = self.tags.iter().collect();
    tags.sort();
    write!(
      formatter,
      "T {} {} ({})",
      percent_encode(&self.message_id),
      self.tag_stamp,
      tags.into_iter().cloned().collect::<Vec<_>>().join(" ")
    )
  }
}

/// A parsed `sync`-stream record: either side of the hash-info/tag-info union.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
  Hash(HashInfo),
  Tag(TagInfo),
}

impl fmt::Display for Record {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Record::Hash(info) => info.fmt(formatter),
      Record::Tag(info) => info.fmt(formatter),
    }
  }
}

peg::parser! {
  grammar grammar() for str {
    rule number() -> i64
      = n:$(['0'..='9']+) {? n.parse().or(Err("number")) }

    pub rule writestamp() -> Writestamp
      = "R" r:number() "=" v:number() { Writestamp { replica: r, version: v } }

    pub rule sync_vector() -> SyncVector
      = "<" list:(writestamp() ** ",") ">" {
          list.into_iter().map(|w| (w.replica, w.version)).collect()
        }

    rule raw_token() -> &'input str
      = $((!(['\x20' | '(' | ')']) [_])+)

    rule encoded_token() -> String
      = t:raw_token() {? percent_decode(t).map_err(|_| "percent-decoded token") }

    rule dir_entry() -> (String, i64)
      = n:number() "*" dir:encoded_token() { (dir, n) }

    pub rule hash_info() -> HashInfo
      = "L " hash:raw_token() " " size:number() " " message_id:encoded_token() " "
        hash_stamp:writestamp() " (" dirs:(dir_entry() ** " ") ")" {
          HashInfo {
            hash: hash.to_string(),
            size,
            message_id,
            hash_stamp,
            dirs: dirs.into_iter().collect(),
          }
        }

    pub rule tag_info() -> TagInfo
      = "T " message_id:encoded_token() " " tag_stamp:writestamp() " (" tags:(raw_token() ** " ") ")" {
          TagInfo {
            message_id,
            tag_stamp,
            tags: tags.into_iter().map(String::from).collect(),
          }
        }

    pub rule record() -> Record
      = info:hash_info() { Record::Hash(info) }
      / info:tag_info() { Record::Tag(info) }
  }
}

pub fn parse_writestamp(line: &str) -> anyhow::Result<Writestamp> {
  grammar::writestamp(line).map_err(|error| anyhow::anyhow!("bad writestamp {line:?}: {error}"))
}

pub fn parse_sync_vector(line: &str) -> anyhow::Result<SyncVector> {
  grammar::sync_vector(line).map_err(|error| anyhow::anyhow!("bad sync-vector {line:?}: {error}"))
}

pub fn parse_hash_info(line: &str) -> anyhow::Result<HashInfo> {
  grammar::hash_info(line).map_err(|error| anyhow::anyhow!("bad hash-info {line:?}: {error}"))
}

pub fn parse_tag_info(line: &str) -> anyhow::Result<TagInfo> {
  grammar::tag_info(line).map_err(|error| anyhow::anyhow!("bad tag-info {line:?}: {error}"))
}

pub fn parse_record(line: &str) -> anyhow::Result<Record> {
  grammar::record(line).map_err(|error| anyhow::anyhow!("bad sync record {line:?}: {error}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn percent_round_trips_on_unreserved_and_reserved_bytes() {
    let raw = "hello world/<weird>@host+1,2-3.eml=%done_";
    let encoded = percent_encode(raw);
    assert_eq!(raw, percent_decode(&encoded).unwrap());
  }

  #[test]
  fn percent_encode_leaves_unreserved_alphabet_untouched() {
    let raw = "ABCxyz019+,-./_@=";
    assert_eq!(raw, percent_encode(raw));
  }

  #[test]
  fn percent_decode_rejects_truncated_escape() {
    assert!(percent_decode("abc%2").is_err());
    assert!(percent_decode("abc%").is_err());
  }

  #[test]
  fn empty_sync_vector_round_trips() {
    let vector = SyncVector::new();
    assert_eq!("<>", format_sync_vector(&vector));
    assert_eq!(vector, parse_sync_vector("<>").unwrap());
  }

  #[test]
  fn sync_vector_round_trips() {
    let mut vector = SyncVector::new();
    vector.insert(1, 4);
    vector.insert(2, 7);
    let formatted = format_sync_vector(&vector);
    assert_eq!(vector, parse_sync_vector(&formatted).unwrap());
  }

  #[test]
  fn writestamp_round_trips() {
    let stamp = Writestamp {
      replica: 42,
      version: 9,
    };
    assert_eq!(stamp, parse_writestamp(&stamp.to_string()).unwrap());
  }

  #[test]
  fn hash_info_round_trips_with_empty_dirs() {
    let info = HashInfo {
      hash: "f572d396fae9206628714fb2ce00f72e94f2258f".to_string(),
      size: 6,
      message_id: "abc@example.com".to_string(),
      hash_stamp: Writestamp {
        replica: 1,
        version: 2,
      },
      dirs: collections::HashMap::new(),
    };
    let formatted = info.to_string();
    assert_eq!("L f572d396fae9206628714fb2ce00f72e94f2258f 6 abc@example.com R1=2 ()", formatted);
    assert_eq!(info, parse_hash_info(&formatted).unwrap());
  }

  #[test]
  fn hash_info_round_trips_with_dirs_and_escaped_message_id() {
    let mut dirs = collections::HashMap::new();
    dirs.insert("INBOX/cur".to_string(), 1);
    dirs.insert("Archive/cur".to_string(), 2);
    let info = HashInfo {
      hash: "0".repeat(40),
      size: 1234,
      message_id: "weird id <with spaces>".to_string(),
      hash_stamp: Writestamp {
        replica: 7,
        version: 3,
      },
      dirs,
    };
    let formatted = info.to_string();
    assert_eq!(info, parse_hash_info(&formatted).unwrap());
  }

  #[test]
  fn tag_info_round_trips() {
    let info = TagInfo {
      message_id: "abc@example.com".to_string(),
      tag_stamp: Writestamp {
        replica: 3,
        version: 1,
      },
      tags: collections::HashSet::from(["inbox".to_string(), "unread".to_string()]),
    };
    let formatted = info.to_string();
    assert_eq!(info, parse_tag_info(&formatted).unwrap());
  }

  #[test]
  fn tag_info_round_trips_with_no_tags() {
    let info = TagInfo {
      message_id: "abc@example.com".to_string(),
      tag_stamp: Writestamp {
        replica: 3,
        version: 1,
      },
      tags: collections::HashSet::new(),
    };
    let formatted = info.to_string();
    assert_eq!("T abc@example.com R3=1 ()", formatted);
    assert_eq!(info, parse_tag_info(&formatted).unwrap());
  }

  #[test]
  fn record_dispatches_on_leading_tag() {
    match parse_record("T abc R1=1 (inbox)").unwrap() {
      Record::Tag(_) => (),
      Record::Hash(_) => panic!("expected a tag record"),
    }
    match parse_record("L aa 1 abc R1=1 ()").unwrap() {
      Record::Hash(_) => (),
      Record::Tag(_) => panic!("expected a hash record"),
    }
  }
}
