//! Shadow Model facades (spec §4.2): hash-lookup, tag-lookup, message-sync. These are the only
//! way the Scanner and Protocol Engine are allowed to touch the Store's rows.

use std::{collections, fs, io::Read, os::unix::fs::MetadataExt as _, path};

use anyhow::Context as _;

use super::{scan::FileCache, Store};
use crate::{
  hash, maildir,
  notmuch::Indexer,
  wire::{HashInfo, SyncVector, TagInfo, Writestamp},
};

#[derive(Debug, Clone, PartialEq)]
pub struct HashRow {
  pub hash_id: i64,
  pub hash: String,
  pub size: i64,
  pub message_id: String,
  pub stamp: Writestamp,
  /// directory path -> link count
  pub dirs: collections::HashMap<String, i64>,
}

impl HashRow {
  pub fn as_wire(&self) -> HashInfo {
    HashInfo {
      hash: self.hash.clone(),
      size: self.size,
      message_id: self.message_id.clone(),
      hash_stamp: self.stamp,
      dirs: self.dirs.clone(),
    }
  }
}

/// hash-lookup (spec §4.2): read-mostly facade keyed by content hash.
pub struct HashLookup<'a> {
  store: &'a Store,
}

impl<'a> HashLookup<'a> {
  pub fn new(store: &'a Store) -> Self {
    Self { store }
  }

  pub fn lookup(&self, hash: &str) -> anyhow::Result<Option<HashRow>> {
    let row = self
      .store
      .connection
      .query_row(
        "SELECT hash_id, size, message_id, stamp_replica, stamp_version
         FROM hashes WHERE hash = ?1",
        rusqlite::params![hash],
        |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
          ))
        },
      )
      .optional()
      .context("looking up hash row")?;
    let Some((hash_id, size, message_id, replica, version)) = row else {
      return Ok(None);
    };
    let dirs = self.dirs_for(hash_id)?;
    Ok(Some(HashRow {
      hash_id,
      hash: hash.to_string(),
      size,
      message_id,
      stamp: Writestamp { replica, version },
      dirs,
    }))
  }

  fn dirs_for(&self, hash_id: i64) -> anyhow::Result<collections::HashMap<String, i64>> {
    let mut statement = self.store.connection.prepare(
      "SELECT d.dir_path, l.count FROM link_counts l
       JOIN directories d ON d.dir_docid = l.dir_docid
       WHERE l.hash_id = ?1",
    )?;
    let rows = statement.query_map(rusqlite::params![hash_id], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut dirs = collections::HashMap::new();
    for row in rows {
      let (dir, count) = row?;
      dirs.insert(dir, count);
    }
    Ok(dirs)
  }

  /// Resolve a hash to a live path on disk: the first recorded link that exists with a matching
  /// size, or a verified trashdir blob. Returns `(path, from_trash)`.
  pub fn resolve_pathname(
    &self,
    maildir: &path::Path,
    hash: &str,
  ) -> anyhow::Result<Option<(path::PathBuf, bool)>> {
    let Some(row) = self.lookup(hash)? else {
      return Ok(None);
    };
    let mut statement = self.store.connection.prepare(
      "SELECT d.dir_path, f.name FROM files f
       JOIN directories d ON d.dir_docid = f.dir_docid
       WHERE f.hash_id = ?1",
    )?;
    let rows = statement.query_map(rusqlite::params![row.hash_id], |r| {
      Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    for candidate in rows {
      let (dir, name) = candidate?;
      let path = maildir.join(&dir).join(&name);
      if let Ok(metadata) = fs::metadata(&path) {
        if metadata.len() as i64 == row.size {
          return Ok(Some((path, false)));
        }
      }
    }
    self.resolve_trash(maildir, &row)
  }

  fn resolve_trash(
    &self,
    maildir: &path::Path,
    row: &HashRow,
  ) -> anyhow::Result<Option<(path::PathBuf, bool)>> {
    let trash_path = crate::maildir::trash_path(maildir, &row.hash)?;
    let metadata = match fs::metadata(&trash_path) {
      Ok(metadata) => metadata,
      Err(_) => return Ok(None),
    };
    if metadata.len() as i64 != row.size {
      log::warn!("trash blob {} has the wrong size, discarding it", row.hash);
      let _ = fs::remove_file(&trash_path);
      return Ok(None);
    }
    let recomputed = hash::hash_file(&trash_path)?;
    if recomputed != row.hash {
      log::warn!("trash blob {} doesn't match its own hash, discarding it", row.hash);
      let _ = fs::remove_file(&trash_path);
      return Ok(None);
    }
    Ok(Some((trash_path, true)))
  }

  /// Every hash row whose writestamp exceeds the peer's corresponding vector entry (spec §4.4's
  /// `sync` semantics): the hash-info half of what the server streams back.
  pub fn since(&self, peer: &SyncVector) -> anyhow::Result<Vec<HashRow>> {
    let mut statement = self.store.connection.prepare(
      "SELECT hash, hash_id, size, message_id, stamp_replica, stamp_version FROM hashes",
    )?;
    let rows = statement.query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, i64>(1)?,
        row.get::<_, i64>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, i64>(4)?,
        row.get::<_, i64>(5)?,
      ))
    })?;
    let mut out = Vec::new();
    for row in rows {
      let (hash, hash_id, size, message_id, replica, version) = row?;
      let stamp = Writestamp { replica, version };
      if stamp.version > crate::wire::sync_vector_get(peer, stamp.replica) {
        let dirs = self.dirs_for(hash_id)?;
        out.push(HashRow {
          hash_id,
          hash,
          size,
          message_id,
          stamp,
          dirs,
        });
      }
    }
    Ok(out)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRow {
  pub docid: i64,
  pub message_id: String,
  pub stamp: Writestamp,
  pub tags: collections::HashSet<String>,
}

impl TagRow {
  pub fn as_wire(&self) -> TagInfo {
    TagInfo {
      message_id: self.message_id.clone(),
      tag_stamp: self.stamp,
      tags: self.tags.clone(),
    }
  }
}

/// tag-lookup (spec §4.2).
pub struct TagLookup<'a> {
  store: &'a Store,
}

impl<'a> TagLookup<'a> {
  pub fn new(store: &'a Store) -> Self {
    Self { store }
  }

  pub fn lookup(&self, message_id: &str) -> anyhow::Result<Option<TagRow>> {
    let row = self
      .store
      .connection
      .query_row(
        "SELECT docid, stamp_replica, stamp_version FROM message_ids WHERE message_id = ?1",
        rusqlite::params![message_id],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
      )
      .optional()
      .context("looking up message-id row")?;
    let Some((docid, replica, version)) = row else {
      return Ok(None);
    };
    self.tags_for(docid, message_id.to_string(), Writestamp { replica, version })
  }

  fn tags_for(&self, docid: i64, message_id: String, stamp: Writestamp) -> anyhow::Result<Option<TagRow>> {
    let mut statement = self.store.connection.prepare("SELECT tag FROM tags WHERE docid = ?1")?;
    let tags = statement
      .query_map(rusqlite::params![docid], |row| row.get::<_, String>(0))?
      .collect::<Result<collections::HashSet<_>, _>>()?;
    Ok(Some(TagRow {
      docid,
      message_id,
      stamp,
      tags,
    }))
  }

  /// Every tag row whose writestamp exceeds the peer's vector entry (spec §4.4's `sync`
  /// semantics): the tag-info half of what the server streams back.
  pub fn since(&self, peer: &SyncVector) -> anyhow::Result<Vec<TagRow>> {
    let mut statement = self
      .store
      .connection
      .prepare("SELECT docid, message_id, stamp_replica, stamp_version FROM message_ids")?;
    let rows = statement.query_map([], |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, i64>(2)?,
        row.get::<_, i64>(3)?,
      ))
    })?;
    let mut out = Vec::new();
    for row in rows {
      let (docid, message_id, replica, version) = row?;
      let stamp = Writestamp { replica, version };
      if stamp.version > crate::wire::sync_vector_get(peer, stamp.replica) {
        if let Some(row) = self.tags_for(docid, message_id, stamp)? {
          out.push(row);
        }
      }
    }
    Ok(out)
  }
}

/// Looks up a directory's stable `dir_docid` by path, creating the row on first sight (spec §3's
/// `dir_path` unique / `dir_docid` surrogate). Shared by [`MessageSync`] (dirs named in an
/// incoming hash-info) and the scanner's own file cache.
pub(crate) fn get_or_create_dir(store: &Store, dir_path: &str) -> anyhow::Result<i64> {
  store.connection.execute(
    "INSERT OR IGNORE INTO directories (dir_path) VALUES (?1)",
    rusqlite::params![dir_path],
  )?;
  Ok(store.connection.query_row(
    "SELECT dir_docid FROM directories WHERE dir_path = ?1",
    rusqlite::params![dir_path],
    |row| row.get(0),
  )?)
}

/// Deterministic writestamp conflict resolution (spec §4.4): same replica picks the newer
/// version; distinct replicas are a genuine concurrent edit, broken by the larger replica id.
fn remote_wins(remote: Writestamp, local: Writestamp) -> bool {
  if remote.replica == local.replica {
    remote.version > local.version
  } else {
    remote.replica > local.replica
  }
}

/// message-sync (spec §4.2): the only facade allowed to mutate hash rows, tag rows, and their
/// writestamps in response to an incoming sync record. Owns the indexer handle too, since
/// applying a record means reconciling the filesystem *and* telling the indexer about it, not
/// just rewriting Store rows (spec §4.2's "performs filesystem moves/creates/unlinks, and
/// updates the indexer").
pub struct MessageSync<'a> {
  store: &'a Store,
  indexer: &'a Indexer,
}

impl<'a> MessageSync<'a> {
  pub fn new(store: &'a Store, indexer: &'a Indexer) -> Self {
    Self { store, indexer }
  }

  /// Reconciles one incoming hash-info record. `content` supplies message bytes when we don't
  /// already hold this hash (e.g. fetched over `send`); `None` means "we already have it, or the
  /// caller will fetch lazily". Returns whether anything was mutated.
  pub fn hash_sync(
    &self,
    _remote_vector: &SyncVector,
    remote: &HashInfo,
    maildir: &path::Path,
    content: Option<&mut dyn Read>,
  ) -> anyhow::Result<bool> {
    let lookup = HashLookup::new(self.store);
    let local = lookup.lookup(&remote.hash)?;

    let mutated = match &local {
      None => true,
      Some(row) => remote_wins(remote.hash_stamp, row.stamp),
    };
    if !mutated {
      return Ok(false);
    }

    let hash_id = self.upsert_hash(remote, local.as_ref())?;
    self.reconcile_links(hash_id, remote)?;

    if let Some(reader) = content {
      self.adopt_content(maildir, remote, reader)?;
    }
    self.materialize_links(maildir, hash_id, remote)?;
    Ok(true)
  }

  /// Brings the live filesystem (and the indexer's view of it) into agreement with the remote's
  /// dir->count map: the wire format only carries counts, not filenames, so a deficit is made up
  /// with freshly named links to whatever copy resolves, and a surplus is trimmed by dropping
  /// arbitrary existing links in that directory (spec §4.2/§4.4 content fetch & reconciliation).
  fn materialize_links(&self, maildir: &path::Path, hash_id: i64, remote: &HashInfo) -> anyhow::Result<()> {
    let cache = FileCache::new(self.store);
    let live = cache.live_link_counts(hash_id)?;
    let mut dirs: collections::HashSet<&String> = remote.dirs.keys().collect();
    dirs.extend(live.keys());

    for dir in dirs {
      let target = *remote.dirs.get(dir).unwrap_or(&0);
      let current = *live.get(dir).unwrap_or(&0);
      if target > current {
        self.add_links(maildir, hash_id, &remote.hash, dir, target - current)?;
      } else if target < current {
        self.remove_links(maildir, hash_id, dir, current - target)?;
      }
    }
    Ok(())
  }

  fn add_links(&self, maildir: &path::Path, hash_id: i64, hash: &str, dir: &str, count: i64) -> anyhow::Result<()> {
    let hashlookup = HashLookup::new(self.store);
    let cache = FileCache::new(self.store);
    for _ in 0..count {
      let Some((source, _from_trash)) = hashlookup.resolve_pathname(maildir, hash)? else {
        log::warn!("can't materialize {hash} into {dir}: no resolvable content yet");
        break;
      };
      let name = maildir::unique_name();
      let target_dir = maildir.join(dir);
      let path = maildir::link_into(&target_dir, &name, &source)
        .with_context(|| format!("linking {hash} into {dir}"))?;
      self
        .indexer
        .add_file(&path)
        .with_context(|| format!("indexing {}", path.display()))?;
      let dir_docid = cache.dir_docid(dir)?;
      let metadata = fs::metadata(&path)?;
      cache.upsert_file(
        dir_docid,
        &name,
        metadata.mtime(),
        metadata.ino() as i64,
        hash_id,
      )?;
    }
    Ok(())
  }

  fn remove_links(&self, maildir: &path::Path, hash_id: i64, dir: &str, count: i64) -> anyhow::Result<()> {
    let cache = FileCache::new(self.store);
    let dir_docid = cache.dir_docid(dir)?;
    let mut removed = 0;
    for row in cache.files_in_dir(dir_docid)? {
      if removed >= count {
        break;
      }
      if row.hash_id != hash_id {
        continue;
      }
      let path = maildir.join(dir).join(&row.name);
      self.indexer.remove_file(&path).ok();
      let _ = fs::remove_file(&path);
      cache.delete_file(dir_docid, &row.name)?;
      removed += 1;
    }
    Ok(())
  }

  fn upsert_hash(&self, remote: &HashInfo, local: Option<&HashRow>) -> anyhow::Result<i64> {
    match local {
      Some(row) => {
        self.store.connection.execute(
          "UPDATE hashes SET size = ?1, message_id = ?2, stamp_replica = ?3, stamp_version = ?4
           WHERE hash_id = ?5",
          rusqlite::params![
            remote.size,
            remote.message_id,
            remote.hash_stamp.replica,
            remote.hash_stamp.version,
            row.hash_id
          ],
        )?;
        Ok(row.hash_id)
      }
      None => {
        self.store.connection.execute(
          "INSERT INTO hashes (hash, size, message_id, stamp_replica, stamp_version)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![
            remote.hash,
            remote.size,
            remote.message_id,
            remote.hash_stamp.replica,
            remote.hash_stamp.version
          ],
        )?;
        Ok(self.store.connection.last_insert_rowid())
      }
    }
  }

  fn get_or_create_dir(&self, dir_path: &str) -> anyhow::Result<i64> {
    get_or_create_dir(self.store, dir_path)
  }

  /// Brings `link_counts` in line with the remote's dir->count map (spec's link-count
  /// reconciliation, driven here by an incoming sync record rather than a local scan).
  fn reconcile_links(&self, hash_id: i64, remote: &HashInfo) -> anyhow::Result<()> {
    self.store.connection.execute(
      "DELETE FROM link_counts WHERE hash_id = ?1",
      rusqlite::params![hash_id],
    )?;
    for (dir, count) in &remote.dirs {
      let dir_docid = self.get_or_create_dir(dir)?;
      self.store.connection.execute(
        "INSERT INTO link_counts (hash_id, dir_docid, count) VALUES (?1, ?2, ?3)
         ON CONFLICT(hash_id, dir_docid) DO UPDATE SET count = excluded.count",
        rusqlite::params![hash_id, dir_docid, count],
      )?;
    }
    Ok(())
  }

  /// Writes fetched content into the trashdir (create-temp, fsync, rename) per spec §4.4's
  /// content-fetch rule, verifying size and hash before keeping it.
  fn adopt_content(&self, maildir: &path::Path, remote: &HashInfo, reader: &mut dyn Read) -> anyhow::Result<()> {
    let trash_dir = crate::maildir::trash_shard_dir(maildir, &remote.hash)?;
    fs::create_dir_all(&trash_dir)?;
    let temp_path = trash_dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    {
      let mut temp_file = fs::File::create(&temp_path)?;
      let mut hasher = hash::Hasher::new();
      let mut size = 0i64;
      let mut buffer = [0u8; 64 * 1024];
      loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
          break;
        }
        hasher.update(&buffer[..read]);
        std::io::Write::write_all(&mut temp_file, &buffer[..read])?;
        size += read as i64;
      }
      temp_file.sync_all()?;
      let digest = hasher.finalize();
      if digest != remote.hash || size != remote.size {
        drop(temp_file);
        fs::remove_file(&temp_path)?;
        anyhow::bail!("fetched content for {} failed hash/size verification", remote.hash);
      }
    }
    let final_path = crate::maildir::trash_path(maildir, &remote.hash)?;
    fs::rename(&temp_path, &final_path)?;
    Ok(())
  }

  /// Adopts content fetched for a hash whose row was already written by an earlier `hash_sync`
  /// call (spec §4.4's content fetch happens only once the client is back in the idle state,
  /// after the sync stream's terminator, so it can't ride along with the original record).
  /// Bypasses the writestamp gate in [`Self::hash_sync`] since the row is already current; this
  /// call only finishes what that one couldn't.
  pub fn adopt_fetched(&self, maildir: &path::Path, hash: &str, reader: &mut dyn Read) -> anyhow::Result<()> {
    let row = HashLookup::new(self.store)
      .lookup(hash)?
      .with_context(|| format!("adopting content for unknown hash {hash}"))?;
    let info = row.as_wire();
    self.adopt_content(maildir, &info, reader)?;
    self.materialize_links(maildir, row.hash_id, &info)
  }

  /// Reconciles one incoming tag-info record. Returns whether anything was mutated.
  pub fn tag_sync(&self, _remote_vector: &SyncVector, remote: &TagInfo) -> anyhow::Result<bool> {
    let lookup = TagLookup::new(self.store);
    let local = lookup.lookup(&remote.message_id)?;

    let mutated = match &local {
      None => true,
      Some(row) => remote_wins(remote.tag_stamp, row.stamp),
    };
    if !mutated {
      return Ok(false);
    }

    let docid = match &local {
      Some(row) => row.docid,
      None => self.ensure_message_id_row(remote)?,
    };
    self.store.connection.execute(
      "UPDATE message_ids SET stamp_replica = ?1, stamp_version = ?2 WHERE docid = ?3",
      rusqlite::params![remote.tag_stamp.replica, remote.tag_stamp.version, docid],
    )?;
    self
      .store
      .connection
      .execute("DELETE FROM tags WHERE docid = ?1", rusqlite::params![docid])?;
    for tag in &remote.tags {
      self.store.connection.execute(
        "INSERT INTO tags (docid, tag) VALUES (?1, ?2)",
        rusqlite::params![docid, tag],
      )?;
    }
    if !self.indexer.set_tags(&remote.message_id, &remote.tags)? {
      log::warn!("indexer doesn't know message-id {} yet, tags recorded only in the shadow", remote.message_id);
    }
    Ok(true)
  }

  fn ensure_message_id_row(&self, remote: &TagInfo) -> anyhow::Result<i64> {
    self.store.connection.execute(
      "INSERT INTO message_ids (message_id, stamp_replica, stamp_version) VALUES (?1, ?2, ?3)",
      rusqlite::params![remote.message_id, remote.tag_stamp.replica, remote.tag_stamp.version],
    )?;
    Ok(self.store.connection.last_insert_rowid())
  }
}

use rusqlite::OptionalExtension as _;
