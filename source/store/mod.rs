//! The persistent store (spec §3, §6): a typed relational store of prepared, parameterized
//! queries with atomic commit/rollback, built on `rusqlite`.

pub mod model;
pub mod scan;

use std::path;

use anyhow::Context as _;

/// Bumped whenever the schema or wire format changes incompatibly; also the protocol greeting
/// token (spec §4.4, §6).
pub const DBVERS: &str = "maildrift-1";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS configuration (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_vector (
  replica INTEGER PRIMARY KEY,
  version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS directories (
  dir_docid INTEGER PRIMARY KEY,
  dir_path TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS hashes (
  hash_id INTEGER PRIMARY KEY,
  hash TEXT NOT NULL UNIQUE,
  size INTEGER NOT NULL,
  message_id TEXT NOT NULL DEFAULT '',
  stamp_replica INTEGER NOT NULL,
  stamp_version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hashes_writestamp ON hashes(stamp_replica, stamp_version);

CREATE TABLE IF NOT EXISTS message_ids (
  docid INTEGER PRIMARY KEY,
  message_id TEXT NOT NULL UNIQUE,
  stamp_replica INTEGER NOT NULL,
  stamp_version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_ids_writestamp ON message_ids(stamp_replica, stamp_version);

CREATE TABLE IF NOT EXISTS tags (
  docid INTEGER NOT NULL,
  tag TEXT NOT NULL,
  UNIQUE(docid, tag)
);
CREATE INDEX IF NOT EXISTS idx_tags_tag_docid ON tags(tag, docid);

CREATE TABLE IF NOT EXISTS files (
  dir_docid INTEGER NOT NULL,
  name TEXT NOT NULL,
  docid INTEGER,
  mtime INTEGER NOT NULL,
  inode INTEGER NOT NULL,
  hash_id INTEGER NOT NULL,
  PRIMARY KEY (dir_docid, name)
);
CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash_id);
CREATE INDEX IF NOT EXISTS idx_files_inode ON files(inode, mtime, hash_id);

CREATE TABLE IF NOT EXISTS link_counts (
  hash_id INTEGER NOT NULL,
  dir_docid INTEGER NOT NULL,
  count INTEGER NOT NULL,
  PRIMARY KEY (hash_id, dir_docid)
);
";

pub struct Store {
  pub connection: rusqlite::Connection,
}

impl Store {
  /// Opens an existing store, checking `dbvers`; creates one (with a fresh random `self`) if the
  /// file doesn't exist yet.
  pub fn open(path: &path::Path) -> anyhow::Result<Self> {
    let exists = path.exists();
    let connection = rusqlite::Connection::open(path)
      .with_context(|| format!("opening store at {}", path.display()))?;
    connection.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
    connection.pragma_update(None, "secure_delete", false)?;
    connection.execute_batch(SCHEMA)?;
    let store = Self { connection };
    if exists {
      store.check_dbvers()?;
    } else {
      store.initialize()?;
    }
    Ok(store)
  }

  fn initialize(&self) -> anyhow::Result<()> {
    let self_id = random_replica_id();
    self.set_config("self", &self_id.to_string())?;
    self.set_config("dbvers", DBVERS)?;
    self
      .connection
      .execute(
        "INSERT INTO sync_vector (replica, version) VALUES (?1, 1)",
        rusqlite::params![self_id],
      )
      .context("seeding sync vector")?;
    Ok(())
  }

  fn check_dbvers(&self) -> anyhow::Result<()> {
    match self.get_config("dbvers")? {
      Some(ref version) if version == DBVERS => Ok(()),
      Some(other) => anyhow::bail!("store schema version mismatch: have {other}, need {DBVERS}"),
      None => anyhow::bail!("store is missing its dbvers configuration row"),
    }
  }

  pub fn self_id(&self) -> anyhow::Result<i64> {
    self
      .get_config("self")?
      .context("store is missing its self configuration row")?
      .parse()
      .context("self configuration row isn't an integer")
  }

  pub fn get_config(&self, key: &str) -> anyhow::Result<Option<String>> {
    self
      .connection
      .query_row(
        "SELECT value FROM configuration WHERE key = ?1",
        rusqlite::params![key],
        |row| row.get(0),
      )
      .optional()
      .context("reading configuration")
  }

  pub fn set_config(&self, key: &str, value: &str) -> anyhow::Result<()> {
    self
      .connection
      .execute(
        "INSERT INTO configuration (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
      )
      .context("writing configuration")?;
    Ok(())
  }

  pub fn sync_vector(&self) -> anyhow::Result<crate::wire::SyncVector> {
    let mut statement = self
      .connection
      .prepare("SELECT replica, version FROM sync_vector")?;
    let rows = statement.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut vector = crate::wire::SyncVector::new();
    for row in rows {
      let (replica, version) = row?;
      vector.insert(replica, version);
    }
    Ok(vector)
  }

  /// Returns `(self_id, new_version)` after bumping the local replica's version by one.
  pub fn bump_local_version(&self) -> anyhow::Result<(i64, i64)> {
    let self_id = self.self_id()?;
    self.connection.execute(
      "UPDATE sync_vector SET version = version + 1 WHERE replica = ?1",
      rusqlite::params![self_id],
    )?;
    let version: i64 = self.connection.query_row(
      "SELECT version FROM sync_vector WHERE replica = ?1",
      rusqlite::params![self_id],
      |row| row.get(0),
    )?;
    Ok((self_id, version))
  }

  /// Records that we've observed writes from `replica` up to `version`, growing the vector
  /// monotonically (spec §3 invariants).
  pub fn observe_replica_version(&self, replica: i64, version: i64) -> anyhow::Result<()> {
    self
      .connection
      .execute(
        "INSERT INTO sync_vector (replica, version) VALUES (?1, ?2)
         ON CONFLICT(replica) DO UPDATE SET version = MAX(version, excluded.version)",
        rusqlite::params![replica, version],
      )
      .context("merging sync vector entry")?;
    Ok(())
  }

  /// Opens the one outer transaction a scan or an inbound sync runs inside (spec §4.3 Failure
  /// mode, §5: "the Store is accessed from one thread at a time"). `unchecked_transaction` is
  /// used instead of `Connection::transaction` so this can be called through a shared `&Store` —
  /// every facade in `store::model`/`store::scan` already takes `&Store`, and the caller is the
  /// single thread driving the whole run, so there's no risk of a second transaction opening
  /// underneath this one. Dropping the returned `Transaction` without calling `commit` rolls it
  /// back, which is what a `?`-propagated error does automatically.
  pub fn transaction(&self) -> anyhow::Result<rusqlite::Transaction<'_>> {
    Ok(self.connection.unchecked_transaction()?)
  }
}

use rusqlite::OptionalExtension as _;

/// A freshly generated 63-bit positive replica identifier (spec §3): clear the sign bit so the
/// value always prints as a positive `i64`, matching the original's `RAND_pseudo_bytes`-based
/// generator.
fn random_replica_id() -> i64 {
  let bytes = uuid::Uuid::new_v4();
  let mut buf = [0u8; 8];
  buf.copy_from_slice(&bytes.as_bytes()[0..8]);
  i64::from_be_bytes(buf) & i64::MAX
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn create_then_open_round_trips_self_and_dbvers() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("store.db");
    let self_id = {
      let store = Store::open(&path).unwrap();
      store.self_id().unwrap()
    };
    let store = Store::open(&path).unwrap();
    assert_eq!(self_id, store.self_id().unwrap());
    assert_eq!(Some(DBVERS.to_string()), store.get_config("dbvers").unwrap());
  }

  #[test]
  fn fresh_store_sync_vector_has_one_entry_at_version_one() {
    let directory = tempfile::tempdir().unwrap();
    let store = Store::open(&directory.path().join("store.db")).unwrap();
    let vector = store.sync_vector().unwrap();
    assert_eq!(1, vector.len());
    assert_eq!(Some(&1), vector.get(&store.self_id().unwrap()));
  }

  #[test]
  fn bump_local_version_increments_only_local_replica() {
    let directory = tempfile::tempdir().unwrap();
    let store = Store::open(&directory.path().join("store.db")).unwrap();
    let (replica, version) = store.bump_local_version().unwrap();
    assert_eq!(store.self_id().unwrap(), replica);
    assert_eq!(2, version);
  }

  #[test]
  fn observe_replica_version_only_grows() {
    let directory = tempfile::tempdir().unwrap();
    let store = Store::open(&directory.path().join("store.db")).unwrap();
    store.observe_replica_version(99, 5).unwrap();
    store.observe_replica_version(99, 3).unwrap();
    assert_eq!(Some(&5), store.sync_vector().unwrap().get(&99));
  }

  #[test]
  fn mismatched_dbvers_is_fatal() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("store.db");
    {
      let store = Store::open(&path).unwrap();
      store.set_config("dbvers", "some-other-version").unwrap();
    }
    assert!(Store::open(&path).is_err());
  }
}
