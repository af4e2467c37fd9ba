// https://cr.yp.to/proto/maildir.html - Maildir
// https://www.courier-mta.org/imap/README.maildirquota.html - Maildir++
// https://doc.dovecot.org/admin_manual/mailbox_formats/maildir/ - Maildir Mailbox Format
//
// The maildir crate isn't suitable because content is content-addressed and needs to be placed
// by hard link or atomic rename, never opened for write in its final location.

use anyhow::Context as _;
use std::{ffi::OsStr, fs, io::Write as _, path};

/// Hidden, hash-sharded subtree holding blobs with no live link (spec §6).
pub const TRASH_DIR: &str = ".muchsync/trash";

/// A directory is a message directory (and thus descended into by the scanner) iff its name is
/// one of these (spec §3, §4.3). Everything else (`tmp`, dotted entries) is not a message dir.
pub fn is_message_dir_name(name: &OsStr) -> bool {
  name == "cur" || name == "new"
}

/// Entries starting with `.` inside a message dir are ignored (spec §4.3).
pub fn is_hidden_entry(name: &OsStr) -> bool {
  name.to_str().map_or(true, |name| name.starts_with('.'))
}

fn require_valid_hash(hash: &str) -> anyhow::Result<()> {
  anyhow::ensure!(crate::hash::is_valid_hash(hash), "not a valid hash: {hash:?}");
  Ok(())
}

/// The shard directory `<maildir>/.muchsync/trash/<hash[0:2]>` a blob's trash file lives under.
pub fn trash_shard_dir(maildir: &path::Path, hash: &str) -> anyhow::Result<path::PathBuf> {
  require_valid_hash(hash)?;
  Ok(maildir.join(TRASH_DIR).join(&hash[0..2]))
}

/// The full trashdir path `<maildir>/.muchsync/trash/<hash[0:2]>/<hash[2:]>` for a blob (spec §6).
pub fn trash_path(maildir: &path::Path, hash: &str) -> anyhow::Result<path::PathBuf> {
  Ok(trash_shard_dir(maildir, hash)?.join(&hash[2..]))
}

/// Creates `dir/name` as a hard link to `source`, creating `dir` first if necessary.
pub fn link_into(dir: &path::Path, name: &str, source: &path::Path) -> anyhow::Result<path::PathBuf> {
  fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
  let target = dir.join(name);
  fs::hard_link(source, &target).with_context(|| format!("linking {source:?} to {target:?}"))?;
  Ok(target)
}

/// Writes `buffer` into `dir` as `name` via create-temp-then-rename (never opened for write in
/// its final location), returning the final path.
pub fn write_atomic(dir: &path::Path, name: &str, buffer: &[u8]) -> anyhow::Result<path::PathBuf> {
  fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
  let temp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
  {
    let mut file = fs::File::create(&temp)?;
    file.write_all(buffer)?;
    file.sync_all()?;
  }
  let target = dir.join(name);
  fs::rename(&temp, &target)?;
  Ok(target)
}

/// Picks a filename for a message materialized under a directory for the first time.
///
/// https://cr.yp.to/proto/maildir.html
/// Unless you're writing messages to a maildir, the format of a unique name is none of your
/// business. 'Break' the 'standard' and just use an UUID (IDs should never be parsed).
pub fn unique_name() -> String {
  uuid::Uuid::new_v4().hyphenated().to_string()
}

/// Splits a path discovered under a message dir into `[mailbox dir, cur-or-new dir, file]`.
pub fn components(path: &path::Path) -> anyhow::Result<[&path::Path; 3]> {
  let parent = path
    .parent()
    .with_context(|| format!("{path:?} is without a parent"))?;
  let grandparent = parent
    .parent()
    .with_context(|| format!("{path:?} is without a grandparent"))?;
  Ok([grandparent, parent, path])
}

pub fn components_to_str<'a>(directories: &[&'a path::Path; 3]) -> anyhow::Result<[&'a str; 3]> {
  let [grandparent, parent, file] = directories;
  let file_name = file
    .file_name()
    .with_context(|| format!("{parent:?} is without a file name"))?;
  let parent_name = parent
    .file_name()
    .with_context(|| format!("{parent:?} is without a file name"))?;
  let grandparent_name = grandparent
    .file_name()
    .with_context(|| format!("{grandparent:?} is without a file name"))?;
  Ok([
    grandparent_name
      .to_str()
      .with_context(|| format!("couldn't convert {grandparent_name:?} to string"))?,
    parent_name
      .to_str()
      .with_context(|| format!("couldn't convert {parent_name:?} to string"))?,
    file_name
      .to_str()
      .with_context(|| format!("couldn't convert {file_name:?} to string"))?,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_dir_names() {
    assert!(is_message_dir_name(OsStr::new("cur")));
    assert!(is_message_dir_name(OsStr::new("new")));
    assert!(!is_message_dir_name(OsStr::new("tmp")));
    assert!(!is_message_dir_name(OsStr::new(".muchsync")));
  }

  #[test]
  fn hidden_entries() {
    assert!(is_hidden_entry(OsStr::new(".dovecot-uidlist")));
    assert!(!is_hidden_entry(OsStr::new("1234.hostname,S=6:2,S")));
  }

  #[test]
  fn trash_path_shards_by_first_two_hex_chars() -> anyhow::Result<()> {
    let hash = "f572d396fae9206628714fb2ce00f72e94f2258f";
    let root = path::Path::new("/maildir");
    assert_eq!(root.join(".muchsync/trash/f5"), trash_shard_dir(root, hash)?);
    assert_eq!(
      root.join(".muchsync/trash/f5/72d396fae9206628714fb2ce00f72e94f2258f"),
      trash_path(root, hash)?
    );
    Ok(())
  }

  #[test]
  fn trash_path_rejects_malformed_hash() {
    assert!(trash_path(path::Path::new("/maildir"), "not-a-hash").is_err());
  }

  #[test]
  fn write_atomic_then_link_into_round_trips_content() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let trash = directory.path().join(".muchsync/trash/f5");
    let blob = write_atomic(&trash, "blob", b"hello\n")?;
    assert_eq!(b"hello\n".to_vec(), fs::read(&blob)?);

    let cur = directory.path().join("cur");
    let linked = link_into(&cur, "1234.host,S=6:2,", &blob)?;
    assert_eq!(b"hello\n".to_vec(), fs::read(&linked)?);
    assert_eq!(2, fs::metadata(&blob)?.nlink());
    Ok(())
  }

  #[test]
  fn components_splits_mailbox_cur_new_and_file() -> anyhow::Result<()> {
    let components = super::components(path::Path::new("/maildir/cur/test"))?;
    assert_eq!(
      [
        path::Path::new("/maildir"),
        path::Path::new("/maildir/cur"),
        path::Path::new("/maildir/cur/test")
      ],
      components
    );
    assert_eq!(["maildir", "cur", "test"], components_to_str(&components)?);

    let components = super::components(path::Path::new("/maildir/.folder/new/test"))?;
    assert_eq!(
      [
        path::Path::new("/maildir/.folder"),
        path::Path::new("/maildir/.folder/new"),
        path::Path::new("/maildir/.folder/new/test"),
      ],
      components
    );
    assert_eq!([".folder", "new", "test"], components_to_str(&components)?);

    Ok(())
  }

  #[cfg(unix)]
  use std::os::unix::fs::MetadataExt as _;
}
