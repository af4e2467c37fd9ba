//! The scanner's own Store facade (spec §4.3): the `files`/`directories` staleness cache and the
//! Store-side view of docids/tags/message-ids the merge join compares against the indexer's.
//! Distinct from [`super::model`]'s hash-lookup/tag-lookup/message-sync facades, which the
//! protocol engine drives instead — this is the half of the Shadow Model the wire protocol never
//! sees directly.

use std::collections;

use anyhow::Context as _;

use super::{model::get_or_create_dir, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
  pub dir_docid: i64,
  pub name: String,
  pub mtime: i64,
  pub inode: i64,
  pub hash_id: i64,
}

/// A rename-detection candidate: a file row sharing `(inode, mtime, size)` with a file we just
/// found, plus the hash it pointed to and the directory path it lives in (spec §4.3's
/// lexicographically-closest tie-break needs the path to compare).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeCandidate {
  pub dir_path: String,
  pub row: FileRow,
  pub hash: String,
}

pub struct FileCache<'a> {
  store: &'a Store,
}

impl<'a> FileCache<'a> {
  pub fn new(store: &'a Store) -> Self {
    Self { store }
  }

  pub fn dir_docid(&self, dir_path: &str) -> anyhow::Result<i64> {
    get_or_create_dir(self.store, dir_path)
  }

  pub fn file_at(&self, dir_docid: i64, name: &str) -> anyhow::Result<Option<FileRow>> {
    self
      .store
      .connection
      .query_row(
        "SELECT dir_docid, name, mtime, inode, hash_id FROM files WHERE dir_docid = ?1 AND name = ?2",
        rusqlite::params![dir_docid, name],
        Self::row_from_query,
      )
      .optional()
      .context("looking up file row")
  }

  /// Every file row currently cached under `dir_docid`, used to notice files that disappeared.
  pub fn files_in_dir(&self, dir_docid: i64) -> anyhow::Result<Vec<FileRow>> {
    let mut statement = self
      .store
      .connection
      .prepare("SELECT dir_docid, name, mtime, inode, hash_id FROM files WHERE dir_docid = ?1")?;
    let rows = statement.query_map(rusqlite::params![dir_docid], Self::row_from_query)?;
    rows.collect::<Result<_, _>>().context("listing directory files")
  }

  /// Rename-detection candidates (spec §4.3 step 2): every file row whose `(inode, mtime, size)`
  /// matches, regardless of directory, joined against `hashes` for its size and hash text.
  pub fn find_by_inode(&self, inode: i64, mtime: i64, size: i64) -> anyhow::Result<Vec<InodeCandidate>> {
    let mut statement = self.store.connection.prepare(
      "SELECT d.dir_path, f.dir_docid, f.name, f.mtime, f.inode, f.hash_id, h.hash
       FROM files f
       JOIN hashes h ON h.hash_id = f.hash_id
       JOIN directories d ON d.dir_docid = f.dir_docid
       WHERE f.inode = ?1 AND f.mtime = ?2 AND h.size = ?3",
    )?;
    let rows = statement.query_map(rusqlite::params![inode, mtime, size], |row| {
      Ok(InodeCandidate {
        dir_path: row.get(0)?,
        row: FileRow {
          dir_docid: row.get(1)?,
          name: row.get(2)?,
          mtime: row.get(3)?,
          inode: row.get(4)?,
          hash_id: row.get(5)?,
        },
        hash: row.get(6)?,
      })
    })?;
    rows.collect::<Result<_, _>>().context("finding files by inode")
  }

  pub fn upsert_file(&self, dir_docid: i64, name: &str, mtime: i64, inode: i64, hash_id: i64) -> anyhow::Result<()> {
    self.store.connection.execute(
      "INSERT INTO files (dir_docid, name, docid, mtime, inode, hash_id) VALUES (?1, ?2, NULL, ?3, ?4, ?5)
       ON CONFLICT(dir_docid, name) DO UPDATE SET mtime = excluded.mtime, inode = excluded.inode, hash_id = excluded.hash_id",
      rusqlite::params![dir_docid, name, mtime, inode, hash_id],
    )?;
    Ok(())
  }

  pub fn delete_file(&self, dir_docid: i64, name: &str) -> anyhow::Result<()> {
    self.store.connection.execute(
      "DELETE FROM files WHERE dir_docid = ?1 AND name = ?2",
      rusqlite::params![dir_docid, name],
    )?;
    Ok(())
  }

  fn row_from_query(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
      dir_docid: row.get(0)?,
      name: row.get(1)?,
      mtime: row.get(2)?,
      inode: row.get(3)?,
      hash_id: row.get(4)?,
    })
  }

  /// The `dir -> count` link census actually implied by the `files` table right now, for the
  /// scanner's link-count reconciliation (spec §4.3); compared against `link_counts` by the
  /// caller, which also owns bumping the hash's writestamp on a diff.
  pub fn live_link_counts(&self, hash_id: i64) -> anyhow::Result<collections::HashMap<String, i64>> {
    let mut statement = self.store.connection.prepare(
      "SELECT d.dir_path, COUNT(*) FROM files f
       JOIN directories d ON d.dir_docid = f.dir_docid
       WHERE f.hash_id = ?1
       GROUP BY d.dir_path",
    )?;
    let rows = statement.query_map(rusqlite::params![hash_id], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut counts = collections::HashMap::new();
    for row in rows {
      let (dir, count) = row?;
      counts.insert(dir, count);
    }
    Ok(counts)
  }

  /// Store-side `(docid, message_id)` pairs, ordered by docid: the left side of the scanner's
  /// message-id merge join against the indexer (spec §4.3).
  pub fn message_id_docids(&self) -> anyhow::Result<Vec<(i64, String)>> {
    let mut statement = self
      .store
      .connection
      .prepare("SELECT docid, message_id FROM message_ids ORDER BY docid")?;
    let rows = statement.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<Result<_, _>>().context("listing message-id rows")
  }

  /// Store-side docids carrying `tag`, ordered: the left side of the scanner's per-tag merge join.
  pub fn docids_with_tag(&self, tag: &str) -> anyhow::Result<Vec<i64>> {
    let mut statement = self
      .store
      .connection
      .prepare("SELECT docid FROM tags WHERE tag = ?1 ORDER BY docid")?;
    let rows = statement.query_map(rusqlite::params![tag], |row| row.get(0))?;
    rows.collect::<Result<_, _>>().context("listing docids for tag")
  }

  /// Every distinct tag the store currently has rows for (used to notice a tag the indexer has
  /// fully dropped, which has no postings left to merge-join against).
  pub fn known_tags(&self) -> anyhow::Result<Vec<String>> {
    let mut statement = self.store.connection.prepare("SELECT DISTINCT tag FROM tags")?;
    let rows = statement.query_map([], |row| row.get(0))?;
    rows.collect::<Result<_, _>>().context("listing known tags")
  }

  pub fn add_tag(&self, docid: i64, tag: &str) -> anyhow::Result<()> {
    self.store.connection.execute(
      "INSERT OR IGNORE INTO tags (docid, tag) VALUES (?1, ?2)",
      rusqlite::params![docid, tag],
    )?;
    Ok(())
  }

  pub fn remove_tag(&self, docid: i64, tag: &str) -> anyhow::Result<()> {
    self.store.connection.execute(
      "DELETE FROM tags WHERE docid = ?1 AND tag = ?2",
      rusqlite::params![docid, tag],
    )?;
    Ok(())
  }

  pub fn delete_message_id_row(&self, docid: i64) -> anyhow::Result<()> {
    self
      .store
      .connection
      .execute("DELETE FROM message_ids WHERE docid = ?1", rusqlite::params![docid])?;
    self
      .store
      .connection
      .execute("DELETE FROM tags WHERE docid = ?1", rusqlite::params![docid])?;
    Ok(())
  }

  /// Inserts a fresh message-id row at version 0; the caller bumps it to the scan's writestamp
  /// only if the row is new or its message-id actually changed (spec §4.3).
  pub fn insert_message_id_row(&self, docid: i64, message_id: &str, stamp: crate::wire::Writestamp) -> anyhow::Result<()> {
    self.store.connection.execute(
      "INSERT INTO message_ids (docid, message_id, stamp_replica, stamp_version) VALUES (?1, ?2, ?3, ?4)",
      rusqlite::params![docid, message_id, stamp.replica, stamp.version],
    )?;
    Ok(())
  }

  pub fn bump_message_id_stamp(&self, docid: i64, stamp: crate::wire::Writestamp) -> anyhow::Result<()> {
    self.store.connection.execute(
      "UPDATE message_ids SET stamp_replica = ?1, stamp_version = ?2 WHERE docid = ?3",
      rusqlite::params![stamp.replica, stamp.version, docid],
    )?;
    Ok(())
  }

  pub fn hash_text(&self, hash_id: i64) -> anyhow::Result<(String, i64)> {
    Ok(
      self
        .store
        .connection
        .query_row(
          "SELECT hash, size FROM hashes WHERE hash_id = ?1",
          rusqlite::params![hash_id],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("reading hash row")?,
    )
  }

  /// Creates a brand-new hash row for content the scanner just hashed for the first time.
  pub fn create_hash(&self, hash: &str, size: i64, message_id: &str, stamp: crate::wire::Writestamp) -> anyhow::Result<i64> {
    self.store.connection.execute(
      "INSERT INTO hashes (hash, size, message_id, stamp_replica, stamp_version) VALUES (?1, ?2, ?3, ?4, ?5)",
      rusqlite::params![hash, size, message_id, stamp.replica, stamp.version],
    )?;
    Ok(self.store.connection.last_insert_rowid())
  }

  pub fn bump_hash_stamp(&self, hash_id: i64, stamp: crate::wire::Writestamp) -> anyhow::Result<()> {
    self.store.connection.execute(
      "UPDATE hashes SET stamp_replica = ?1, stamp_version = ?2 WHERE hash_id = ?3",
      rusqlite::params![stamp.replica, stamp.version, hash_id],
    )?;
    Ok(())
  }

  /// Replaces a hash's `link_counts` rows with exactly `counts` (spec §4.3's link-count
  /// reconciliation, driven by the scanner's own directory census rather than an incoming record).
  pub fn set_link_counts(&self, hash_id: i64, counts: &collections::HashMap<String, i64>) -> anyhow::Result<()> {
    self
      .store
      .connection
      .execute("DELETE FROM link_counts WHERE hash_id = ?1", rusqlite::params![hash_id])?;
    for (dir, count) in counts {
      let dir_docid = self.dir_docid(dir)?;
      self.store.connection.execute(
        "INSERT INTO link_counts (hash_id, dir_docid, count) VALUES (?1, ?2, ?3)
         ON CONFLICT(hash_id, dir_docid) DO UPDATE SET count = excluded.count",
        rusqlite::params![hash_id, dir_docid, count],
      )?;
    }
    Ok(())
  }
}

use rusqlite::OptionalExtension as _;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::Writestamp;

  fn open(path: &std::path::Path) -> Store {
    Store::open(&path.join("store.db")).unwrap()
  }

  #[test]
  fn upsert_file_then_file_at_round_trips() {
    let directory = tempfile::tempdir().unwrap();
    let store = open(directory.path());
    let cache = FileCache::new(&store);
    let dir_docid = cache.dir_docid("cur").unwrap();
    // files.hash_id references hashes, satisfy the foreign key shape with a real row.
    store
      .connection
      .execute(
        "INSERT INTO hashes (hash, size, message_id, stamp_replica, stamp_version) VALUES ('a', 1, '', 1, 1)",
        [],
      )
      .unwrap();
    let hash_id = store.connection.last_insert_rowid();
    cache.upsert_file(dir_docid, "msg1", 100, 42, hash_id).unwrap();
    let row = cache.file_at(dir_docid, "msg1").unwrap().unwrap();
    assert_eq!(42, row.inode);
    assert_eq!(100, row.mtime);
  }

  #[test]
  fn find_by_inode_matches_on_inode_mtime_and_hash_size() {
    let directory = tempfile::tempdir().unwrap();
    let store = open(directory.path());
    let cache = FileCache::new(&store);
    store
      .connection
      .execute(
        "INSERT INTO hashes (hash, size, message_id, stamp_replica, stamp_version) VALUES ('abc', 6, '', 1, 1)",
        [],
      )
      .unwrap();
    let hash_id = store.connection.last_insert_rowid();
    let dir_docid = cache.dir_docid("cur").unwrap();
    cache.upsert_file(dir_docid, "old-name", 100, 42, hash_id).unwrap();

    let candidates = cache.find_by_inode(42, 100, 6).unwrap();
    assert_eq!(1, candidates.len());
    assert_eq!("old-name", candidates[0].row.name);
    assert_eq!("abc", candidates[0].hash);

    assert!(cache.find_by_inode(42, 100, 7).unwrap().is_empty());
  }

  #[test]
  fn message_id_row_lifecycle() {
    let directory = tempfile::tempdir().unwrap();
    let store = open(directory.path());
    let cache = FileCache::new(&store);
    let stamp = Writestamp { replica: 1, version: 2 };
    cache.insert_message_id_row(7, "m@example.com", stamp).unwrap();
    assert_eq!(vec![(7, "m@example.com".to_string())], cache.message_id_docids().unwrap());
    cache.add_tag(7, "inbox").unwrap();
    assert_eq!(vec![7], cache.docids_with_tag("inbox").unwrap());
    cache.delete_message_id_row(7).unwrap();
    assert!(cache.message_id_docids().unwrap().is_empty());
    assert!(cache.docids_with_tag("inbox").unwrap().is_empty());
  }
}
