//! The scanner (spec §4.3): brings the Shadow Model into agreement with both the filesystem and
//! the indexer, stamping every mutation it makes with one writestamp reserved for the whole run.
//!
//! Hash and tag rows are mutated through the same lookup the protocol engine reads through
//! ([`HashLookup`]) plus the scanner-only [`FileCache`] facade, always stamped `(self, V_new)` —
//! a scan is just a write whose origin happens to be local instead of the wire.

use std::{cmp, collections, fs, os::unix::fs::MetadataExt as _, path, sync};

use anyhow::Context as _;

use crate::{
  hash, maildir,
  notmuch::Indexer,
  store::{
    model::HashLookup,
    scan::{FileCache, InodeCandidate},
    Store,
  },
  wire::Writestamp,
};

pub struct Scanner<'a> {
  store: &'a Store,
  indexer: &'a Indexer,
  maildir: &'a path::Path,
  /// Trust a cache hit's recorded size without re-reading the hash row (spec §9 open question:
  /// off by default, since the extra lookup is cheap next to a full rehash).
  pub trust_inode: bool,
  /// Skip files whose mtime predates the last completed scan without even checking the cache
  /// (spec §4.3); only safe when nothing outside this scanner touches the maildir concurrently.
  pub fast_scan: bool,
  /// Worker count for the hashing pool (spec §5); defaults to the host's parallelism.
  pub threads: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
  pub files_seen: u64,
  pub files_hashed: u64,
  pub files_removed: u64,
  pub docids_changed: u64,
  pub mutated: bool,
}

impl<'a> Scanner<'a> {
  pub fn new(store: &'a Store, indexer: &'a Indexer, maildir: &'a path::Path) -> Self {
    Self {
      store,
      indexer,
      maildir,
      trust_inode: false,
      fast_scan: false,
      threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).max(2),
    }
  }

  /// Runs one full scan, bumping the local writestamp exactly once if anything changed. The
  /// whole walk, every row it touches, and the final version bump run inside one outer store
  /// transaction (spec §4.3 Failure mode): a fatal error anywhere rolls every row back, instead
  /// of leaving a half-scanned store committed statement by statement.
  pub fn run(&self) -> anyhow::Result<ScanStats> {
    let transaction = self.store.transaction().context("opening scan transaction")?;
    let stats = self.run_in_transaction()?;
    transaction.commit().context("committing scan")?;
    Ok(stats)
  }

  fn run_in_transaction(&self) -> anyhow::Result<ScanStats> {
    let self_replica = self.store.self_id()?;
    let old_version = crate::wire::sync_vector_get(&self.store.sync_vector()?, self_replica);
    let stamp = Writestamp {
      replica: self_replica,
      version: old_version + 1,
    };
    let last_scan: i64 = self
      .store
      .get_config("last_scan")?
      .and_then(|value| value.parse().ok())
      .unwrap_or(0);
    let scan_started = unix_now();

    let cache = FileCache::new(self.store);
    let hashlookup = HashLookup::new(self.store);

    self.relocate_pending_deliveries()?;

    let mut stats = ScanStats::default();
    let mut touched_hashes: collections::HashSet<i64> = collections::HashSet::new();

    for entry in walkdir::WalkDir::new(self.maildir)
      .into_iter()
      .filter_entry(Self::should_descend)
    {
      let entry = entry.context("walking maildir")?;
      if !entry.file_type().is_dir() || !maildir::is_message_dir_name(entry.file_name()) {
        continue;
      }
      self.scan_message_dir(entry.path(), &cache, &hashlookup, stamp, last_scan, &mut stats, &mut touched_hashes)?;
    }

    for hash_id in touched_hashes {
      if self.reconcile_link_counts(hash_id, &cache, stamp)? {
        stats.mutated = true;
      }
    }

    let docids_changed = self.sync_indexer_shadow(&cache, stamp)?;
    stats.docids_changed = docids_changed;
    stats.mutated = stats.mutated || docids_changed > 0 || stats.files_hashed > 0 || stats.files_removed > 0;

    self.store.set_config("last_scan", &scan_started.to_string())?;
    if stats.mutated {
      self.store.bump_local_version()?;
    }
    Ok(stats)
  }

  /// Only directories plausibly worth opening: the root, `cur`/`new`/`tmp`, and any directory
  /// whose hard-link count proves it holds subdirectories (spec §4.3's `nlink <= 2` pruning).
  /// `.muchsync` is the trashdir/bookkeeping subtree and is never treated as mail.
  fn should_descend(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
      return true;
    }
    if entry.depth() == 0 {
      return true;
    }
    if entry.file_name() == ".muchsync" {
      return false;
    }
    if maildir::is_message_dir_name(entry.file_name()) || entry.file_name() == "tmp" {
      return true;
    }
    match entry.metadata() {
      Ok(metadata) => metadata.nlink() > 2,
      Err(_) => true,
    }
  }

  /// Scans one `cur` or `new` directory: resolves every live file to a hash (cache hit, rename,
  /// or fresh hash), then deletes any cached row whose file has disappeared.
  fn scan_message_dir(
    &self,
    dir: &path::Path,
    cache: &FileCache,
    hashlookup: &HashLookup,
    stamp: Writestamp,
    last_scan: i64,
    stats: &mut ScanStats,
    touched: &mut collections::HashSet<i64>,
  ) -> anyhow::Result<()> {
    let dir_path = dir
      .strip_prefix(self.maildir)
      .with_context(|| format!("{dir:?} isn't under the maildir root"))?
      .to_str()
      .with_context(|| format!("{dir:?} isn't valid utf-8"))?
      .to_string();
    let dir_docid = cache.dir_docid(&dir_path)?;

    let entries = match fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(error) => {
        log::warn!("skipping {}: {error}", dir.display());
        return Ok(());
      }
    };

    let mut seen = collections::HashSet::new();
    let mut pending = Vec::new();

    for entry in entries {
      let entry = match entry {
        Ok(entry) => entry,
        Err(error) => {
          log::warn!("reading an entry of {}: {error}", dir.display());
          continue;
        }
      };
      let name_os = entry.file_name();
      if maildir::is_hidden_entry(&name_os) {
        continue;
      }
      let Some(name) = name_os.to_str() else {
        log::warn!("skipping non-utf8 filename under {}", dir.display());
        continue;
      };
      let metadata = match entry.metadata() {
        Ok(metadata) => metadata,
        Err(error) => {
          log::warn!("stat {}/{name}: {error}", dir.display());
          continue;
        }
      };
      if !metadata.is_file() {
        continue;
      }
      stats.files_seen += 1;
      seen.insert(name.to_string());

      match self.resolve_existing(cache, dir_docid, name, &metadata, last_scan)? {
        Some(hash_id) => cache.upsert_file(dir_docid, name, metadata.mtime(), metadata.ino() as i64, hash_id)?,
        None => match self.resolve_by_rename(cache, &dir_path, name, &metadata)? {
          Some(hash_id) => {
            cache.upsert_file(dir_docid, name, metadata.mtime(), metadata.ino() as i64, hash_id)?;
            touched.insert(hash_id);
          }
          None => pending.push((name.to_string(), entry.path(), metadata)),
        },
      }
    }

    if !pending.is_empty() {
      let digests = hash_many(pending.iter().map(|(_, path, _)| path.clone()).collect(), self.threads);
      stats.files_hashed += pending.len() as u64;
      for ((name, path, metadata), digest) in pending.into_iter().zip(digests) {
        let digest = match digest {
          Ok(digest) => digest,
          Err(error) => {
            log::warn!("couldn't hash {}: {error:#}", path.display());
            continue;
          }
        };
        let hash_id = self.hash_id_for(hashlookup, cache, &digest, metadata.len() as i64, &path, stamp)?;
        cache.upsert_file(dir_docid, &name, metadata.mtime(), metadata.ino() as i64, hash_id)?;
        touched.insert(hash_id);
      }
    }

    for row in cache.files_in_dir(dir_docid)? {
      if !seen.contains(&row.name) {
        cache.delete_file(dir_docid, &row.name)?;
        touched.insert(row.hash_id);
        stats.files_removed += 1;
      }
    }
    Ok(())
  }

  /// Step 1 of the staleness test: a cache hit whose `(inode, mtime)` still matches, and whose
  /// size still matches the hash row (or `trust_inode` waives the size check).
  fn resolve_existing(
    &self,
    cache: &FileCache,
    dir_docid: i64,
    name: &str,
    metadata: &fs::Metadata,
    last_scan: i64,
  ) -> anyhow::Result<Option<i64>> {
    let Some(existing) = cache.file_at(dir_docid, name)? else {
      return Ok(None);
    };
    if existing.inode != metadata.ino() as i64 || existing.mtime != metadata.mtime() {
      return Ok(None);
    }
    if self.trust_inode {
      return Ok(Some(existing.hash_id));
    }
    if self.fast_scan && metadata.mtime() < last_scan {
      return Ok(Some(existing.hash_id));
    }
    let (_, size) = cache.hash_text(existing.hash_id)?;
    if size == metadata.len() as i64 {
      Ok(Some(existing.hash_id))
    } else {
      Ok(None)
    }
  }

  /// Step 2: a file sharing `(inode, mtime, size)` with a row cached under a different name —
  /// most likely the same content, renamed (spec §4.3, §9's rename-detection heuristic). Ties
  /// break toward the candidate whose path shares the longest prefix with the file's own path,
  /// then lexicographically (spec's open-question decision, see DESIGN.md).
  fn resolve_by_rename(&self, cache: &FileCache, dir_path: &str, name: &str, metadata: &fs::Metadata) -> anyhow::Result<Option<i64>> {
    let mut candidates = cache.find_by_inode(metadata.ino() as i64, metadata.mtime(), metadata.len() as i64)?;
    if candidates.is_empty() {
      return Ok(None);
    }
    let target = format!("{dir_path}/{name}");
    candidates.sort_by(|a, b| rename_tie_break(&target, a, b));
    Ok(Some(candidates.remove(0).row.hash_id))
  }

  /// Step 3: genuinely new content. Looks the digest up by content first (another file elsewhere
  /// may already carry it), else creates a fresh hash row with the indexer-reported message-id.
  fn hash_id_for(
    &self,
    hashlookup: &HashLookup,
    cache: &FileCache,
    digest: &str,
    size: i64,
    path: &path::Path,
    stamp: Writestamp,
  ) -> anyhow::Result<i64> {
    if let Some(row) = hashlookup.lookup(digest)? {
      return Ok(row.hash_id);
    }
    let message_id = match self.indexer.find_by_filename(path)? {
      Some(record) => record.message_id,
      None => self.indexer.add_file(path)?.message_id,
    };
    cache.create_hash(digest, size, &message_id, stamp)
  }

  /// Diffs the live directory census against `link_counts`, bumping the hash's writestamp on a
  /// genuine change. Returns whether anything was mutated.
  fn reconcile_link_counts(&self, hash_id: i64, cache: &FileCache, stamp: Writestamp) -> anyhow::Result<bool> {
    let live = cache.live_link_counts(hash_id)?;
    let hashlookup = HashLookup::new(self.store);
    let (hash, _) = cache.hash_text(hash_id)?;
    let current = hashlookup.lookup(&hash)?.map(|row| row.dirs).unwrap_or_default();
    if live == current {
      return Ok(false);
    }
    cache.set_link_counts(hash_id, &live)?;
    cache.bump_hash_stamp(hash_id, stamp)?;
    Ok(true)
  }

  /// Brings `message_ids` and `tags` into agreement with the indexer via a streaming merge join
  /// on docid (spec §4.3), one pass for message-ids and one pass per known tag. Returns the
  /// number of distinct docids touched.
  fn sync_indexer_shadow(&self, cache: &FileCache, stamp: Writestamp) -> anyhow::Result<u64> {
    let mut changed: collections::HashSet<i64> = collections::HashSet::new();

    let store_ids = cache.message_id_docids()?;
    let index_ids = self.indexer.message_ids()?;
    merge_join(
      &store_ids,
      &index_ids,
      |s, i| s.0.cmp(&i.docid),
      |only_store| {
        changed.insert(only_store.0);
        cache.delete_message_id_row(only_store.0)
      },
      |only_index| {
        changed.insert(only_index.docid);
        cache.insert_message_id_row(only_index.docid, &only_index.message_id, stamp)
      },
      |store_row, index_row| {
        if store_row.1 != index_row.message_id {
          changed.insert(store_row.0);
          cache.delete_message_id_row(store_row.0)?;
          cache.insert_message_id_row(index_row.docid, &index_row.message_id, stamp)?;
        }
        Ok(())
      },
    )?;

    let mut tags: collections::HashSet<String> = cache.known_tags()?.into_iter().collect();
    tags.extend(self.indexer.all_tags()?);
    for tag in tags {
      let store_docids = cache.docids_with_tag(&tag)?;
      let index_docids = self.indexer.docids_with_tag(&tag)?;
      merge_join(
        &store_docids,
        &index_docids,
        |s, i| s.cmp(i),
        |only_store| {
          changed.insert(*only_store);
          cache.remove_tag(*only_store, &tag)
        },
        |only_index| {
          changed.insert(*only_index);
          cache.add_tag(*only_index, &tag)
        },
        |_, _| Ok(()),
      )?;
    }

    for docid in &changed {
      // a docid can surface here purely from a tag add/remove without its message-id row having
      // moved; bump unconditionally so every touched docid carries a fresh writestamp.
      cache.bump_message_id_stamp(*docid, stamp)?;
    }
    Ok(changed.len() as u64)
  }

  /// A crash between writing content into `tmp` and linking it into `cur`/`new` can leave a file
  /// sitting in `tmp` that the indexer already knows about (spec §4.3's supplemented recovery
  /// note). Anything the indexer hasn't seen yet is still mid-delivery by some other producer and
  /// is left alone.
  fn relocate_pending_deliveries(&self) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(self.maildir)
      .into_iter()
      .filter_entry(Self::should_descend)
    {
      let entry = entry.context("walking maildir for tmp cleanup")?;
      if !entry.file_type().is_file() {
        continue;
      }
      if entry.path().parent().and_then(|p| p.file_name()) != Some(std::ffi::OsStr::new("tmp")) {
        continue;
      }
      if let Err(error) = self.relocate_one(entry.path()) {
        log::warn!("couldn't relocate {} out of tmp: {error:#}", entry.path().display());
      }
    }
    Ok(())
  }

  fn relocate_one(&self, path: &path::Path) -> anyhow::Result<()> {
    if self.indexer.find_by_filename(path)?.is_none() {
      return Ok(());
    }
    let mailbox_dir = path
      .parent()
      .and_then(|p| p.parent())
      .with_context(|| format!("{path:?} has no mailbox directory"))?;
    let destination_dir = mailbox_dir.join("cur");
    fs::create_dir_all(&destination_dir)?;
    let name = path.file_name().with_context(|| format!("{path:?} has no file name"))?;
    let destination = destination_dir.join(name);
    fs::rename(path, &destination).with_context(|| format!("moving {path:?} to {destination:?}"))?;
    self.indexer.remove_file(path).ok();
    self.indexer.add_file(&destination)?;
    Ok(())
  }
}

fn rename_tie_break(target: &str, a: &InodeCandidate, b: &InodeCandidate) -> cmp::Ordering {
  let a_path = format!("{}/{}", a.dir_path, a.row.name);
  let b_path = format!("{}/{}", b.dir_path, b.row.name);
  let a_prefix = common_prefix_len(target, &a_path);
  let b_prefix = common_prefix_len(target, &b_path);
  b_prefix.cmp(&a_prefix).then_with(|| a_path.cmp(&b_path))
}

fn common_prefix_len(a: &str, b: &str) -> usize {
  a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

/// Streaming left-outer-ish merge join over two lists already ordered by the same key (spec
/// §4.3): a generic routine instantiated once for message-ids and once per tag, rather than two
/// hand-duplicated loops.
fn merge_join<S, I>(
  store: &[S],
  index: &[I],
  compare: impl Fn(&S, &I) -> cmp::Ordering,
  mut only_in_store: impl FnMut(&S) -> anyhow::Result<()>,
  mut only_in_index: impl FnMut(&I) -> anyhow::Result<()>,
  mut in_both: impl FnMut(&S, &I) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
  let (mut si, mut ii) = (0, 0);
  while si < store.len() && ii < index.len() {
    match compare(&store[si], &index[ii]) {
      cmp::Ordering::Less => {
        only_in_store(&store[si])?;
        si += 1;
      }
      cmp::Ordering::Greater => {
        only_in_index(&index[ii])?;
        ii += 1;
      }
      cmp::Ordering::Equal => {
        in_both(&store[si], &index[ii])?;
        si += 1;
        ii += 1;
      }
    }
  }
  while si < store.len() {
    only_in_store(&store[si])?;
    si += 1;
  }
  while ii < index.len() {
    only_in_index(&index[ii])?;
    ii += 1;
  }
  Ok(())
}

/// Hashes every path concurrently across a bounded worker pool (spec §5), draining fully before
/// the caller writes anything to the store.
fn hash_many(paths: Vec<path::PathBuf>, threads: usize) -> Vec<anyhow::Result<hash::Hash>> {
  if paths.is_empty() {
    return Vec::new();
  }
  let threads = threads.max(1).min(paths.len());
  let next = sync::Mutex::new(0usize);
  let results: Vec<sync::Mutex<Option<anyhow::Result<hash::Hash>>>> = paths.iter().map(|_| sync::Mutex::new(None)).collect();

  crossbeam_utils::thread::scope(|scope| {
    for _ in 0..threads {
      scope.spawn(|_| loop {
        let index = {
          let mut next = next.lock().unwrap();
          if *next >= paths.len() {
            break;
          }
          let index = *next;
          *next += 1;
          index
        };
        let outcome = hash::hash_file(&paths[index]);
        *results[index].lock().unwrap() = Some(outcome);
      });
    }
  })
  .expect("hashing worker thread panicked");

  results
    .into_iter()
    .map(|slot| slot.into_inner().unwrap().expect("every slot was filled by the pool"))
    .collect()
}

fn unix_now() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|duration| duration.as_secs() as i64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notmuch::Indexer;

  fn email(message_id: &str, body: &str) -> String {
    format!("From: a@example.com\nTo: b@example.com\nSubject: test\nMessage-ID: <{message_id}>\n\n{body}\n")
  }

  fn setup() -> (tempfile::TempDir, Store, Indexer) {
    let directory = tempfile::tempdir().unwrap();
    let store = Store::open(&directory.path().join("store.db")).unwrap();
    let indexer = Indexer::create(directory.path()).unwrap();
    (directory, store, indexer)
  }

  #[test]
  fn fresh_scan_hashes_and_indexes_every_message() {
    let (directory, store, indexer) = setup();
    let cur = directory.path().join("cur");
    fs::create_dir_all(&cur).unwrap();
    fs::write(cur.join("1"), email("a@example.com", "hello")).unwrap();
    fs::write(cur.join("2"), email("b@example.com", "world")).unwrap();

    let scanner = Scanner::new(&store, &indexer, directory.path());
    let stats = scanner.run().unwrap();
    assert_eq!(2, stats.files_seen);
    assert_eq!(2, stats.files_hashed);
    assert!(stats.mutated);

    let cache = crate::store::scan::FileCache::new(&store);
    let dir_docid = cache.dir_docid("cur").unwrap();
    assert!(cache.file_at(dir_docid, "1").unwrap().is_some());
    assert!(cache.file_at(dir_docid, "2").unwrap().is_some());
    assert_eq!(2, cache.message_id_docids().unwrap().len());
  }

  #[test]
  fn rescanning_unchanged_tree_hashes_nothing_again() {
    let (directory, store, indexer) = setup();
    let cur = directory.path().join("cur");
    fs::create_dir_all(&cur).unwrap();
    fs::write(cur.join("1"), email("a@example.com", "hello")).unwrap();

    let scanner = Scanner::new(&store, &indexer, directory.path());
    scanner.run().unwrap();
    let stats = scanner.run().unwrap();
    assert_eq!(0, stats.files_hashed);
    assert!(!stats.mutated);
  }

  #[test]
  fn removed_file_drops_its_cached_row_and_reconciles_links() {
    let (directory, store, indexer) = setup();
    let cur = directory.path().join("cur");
    fs::create_dir_all(&cur).unwrap();
    let message_path = cur.join("1");
    fs::write(&message_path, email("a@example.com", "hello")).unwrap();

    let scanner = Scanner::new(&store, &indexer, directory.path());
    scanner.run().unwrap();
    fs::remove_file(&message_path).unwrap();
    indexer.remove_file(&message_path).ok();
    let stats = scanner.run().unwrap();
    assert_eq!(1, stats.files_removed);

    let cache = crate::store::scan::FileCache::new(&store);
    let dir_docid = cache.dir_docid("cur").unwrap();
    assert!(cache.file_at(dir_docid, "1").unwrap().is_none());
  }

  #[test]
  fn renamed_file_reuses_the_original_hash_without_rehashing() {
    let (directory, store, indexer) = setup();
    let cur = directory.path().join("cur");
    fs::create_dir_all(&cur).unwrap();
    let original = cur.join("1");
    fs::write(&original, email("a@example.com", "hello")).unwrap();

    let scanner = Scanner::new(&store, &indexer, directory.path());
    scanner.run().unwrap();

    let renamed = cur.join("1,S=6:2,S");
    fs::rename(&original, &renamed).unwrap();
    let stats = scanner.run().unwrap();
    assert_eq!(0, stats.files_hashed, "rename should be detected via (inode, mtime, size)");

    let cache = crate::store::scan::FileCache::new(&store);
    let dir_docid = cache.dir_docid("cur").unwrap();
    assert!(cache.file_at(dir_docid, "1,S=6:2,S").unwrap().is_some());
  }

  #[test]
  fn common_prefix_len_counts_shared_leading_bytes() {
    assert_eq!(7, common_prefix_len("cur/abc", "cur/abd"));
    assert_eq!(0, common_prefix_len("cur/a", "new/a"));
  }

  #[test]
  fn hash_many_hashes_every_path() {
    let directory = tempfile::tempdir().unwrap();
    let a = directory.path().join("a");
    let b = directory.path().join("b");
    fs::write(&a, b"hello\n").unwrap();
    fs::write(&b, b"world\n").unwrap();
    let results = hash_many(vec![a, b], 4);
    assert_eq!(2, results.len());
    assert!(results.iter().all(|r| r.is_ok()));
  }
}
