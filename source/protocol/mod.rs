//! Protocol Engine (spec §4.4): the line-oriented request/response loop run by both `serve` and
//! `pull`, driven over a generic `Read`/`Write` pair so the Driver can wire it to a duplex pipe,
//! a socket, or (in tests) a plain in-memory buffer without the engine knowing the difference.

use std::{fs, io, path};

use anyhow::Context as _;

use crate::{
  notmuch::Indexer,
  store::{
    model::{HashLookup, MessageSync, TagLookup},
    Store,
  },
  wire::{self, Record},
};

fn write_line(output: &mut impl io::Write, line: &str) -> anyhow::Result<()> {
  log::debug!("> {line}");
  output
    .write_all(line.as_bytes())
    .and_then(|_| output.write_all(b"\n"))
    .context("writing a protocol line")
}

fn read_line(input: &mut impl io::BufRead) -> anyhow::Result<String> {
  let mut line = String::new();
  let read = input.read_line(&mut line).context("reading a protocol line")?;
  anyhow::ensure!(read > 0, "peer closed the connection");
  if line.ends_with('\n') {
    line.pop();
  }
  log::debug!("< {line}");
  Ok(line)
}

fn read_exact(input: &mut impl io::BufRead, size: usize) -> anyhow::Result<Vec<u8>> {
  let mut buffer = vec![0u8; size];
  input.read_exact(&mut buffer).context("reading a binary payload")?;
  let mut trailer = [0u8; 1];
  input.read_exact(&mut trailer).context("reading payload trailer")?;
  anyhow::ensure!(trailer[0] == b'\n', "binary payload isn't LF-terminated");
  Ok(buffer)
}

/// Splits a command line into its verb and the (possibly empty) rest of the line.
fn split_verb(line: &str) -> (&str, &str) {
  match line.split_once(' ') {
    Some((verb, rest)) => (verb, rest),
    None => (line, ""),
  }
}

/// Splits a status line into `(code, continued, rest)`. `continued` is true for a `200-` line
/// that's part of a multi-line response, false for the line that terminates one.
fn split_status(line: &str) -> anyhow::Result<(u32, bool, &str)> {
  anyhow::ensure!(line.len() >= 4, "malformed status line {line:?}");
  let code: u32 = line[..3]
    .parse()
    .with_context(|| format!("malformed status code in {line:?}"))?;
  let continued = match line.as_bytes()[3] {
    b' ' => false,
    b'-' => true,
    other => anyhow::bail!("malformed status separator {:?} in {line:?}", other as char),
  };
  Ok((code, continued, &line[4..]))
}

/// Runs the server side of one connection (spec §4.4): emits the greeting, then serves commands
/// until `quit` or the peer hangs up. Never mutates its own store — `sync` here is read-only,
/// the one-directional half of the protocol; a peer that wants the reverse direction runs its
/// own `pull` back against us.
pub fn serve(store: &Store, maildir: &path::Path, stream_in: impl io::Read, mut stream_out: impl io::Write) -> anyhow::Result<()> {
  let mut input = io::BufReader::new(stream_in);
  write_line(&mut stream_out, &format!("200 {}", crate::store::DBVERS))?;
  stream_out.flush()?;

  loop {
    let line = read_line(&mut input)?;
    let (verb, rest) = split_verb(&line);
    match verb {
      "vect" => {
        let vector = store.sync_vector()?;
        write_line(&mut stream_out, &format!("200 {}", wire::format_sync_vector(&vector)))?;
      }
      "conf" => match store.get_config(rest)? {
        Some(value) => write_line(&mut stream_out, &format!("200 {value}"))?,
        None => write_line(&mut stream_out, &format!("500 unknown configuration key {rest:?}"))?,
      },
      "sync" => {
        let peer = wire::parse_sync_vector(rest).context("parsing peer sync-vector")?;
        for row in HashLookup::new(store).since(&peer)? {
          write_line(&mut stream_out, &format!("200-{}", row.as_wire()))?;
        }
        for row in TagLookup::new(store).since(&peer)? {
          write_line(&mut stream_out, &format!("200-{}", row.as_wire()))?;
        }
        let vector = store.sync_vector()?;
        write_line(&mut stream_out, &format!("200 Synchronized {}", wire::format_sync_vector(&vector)))?;
      }
      "send" => {
        let hash = rest.trim();
        match HashLookup::new(store).resolve_pathname(maildir, hash)? {
          Some((path, _from_trash)) => {
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            write_line(&mut stream_out, &format!("220 {}", bytes.len()))?;
            stream_out.write_all(&bytes)?;
            stream_out.write_all(b"\n")?;
          }
          None => write_line(&mut stream_out, "500 missing")?,
        }
      }
      "quit" => {
        write_line(&mut stream_out, "200 goodbye")?;
        stream_out.flush()?;
        return Ok(());
      }
      other => write_line(&mut stream_out, &format!("500 unknown command {other:?}"))?,
    }
    stream_out.flush()?;
  }
}

/// Runs the client side of one connection (spec §4.4): greeting check, `vect`, `sync`, lazy
/// content fetch for any hash this replica can't yet resolve on its own, then `quit`. Every row
/// this pull touches — applied hash/tag records, the merged sync-vector, adopted content — goes
/// through one outer store transaction (spec §4.3 Failure mode), committed only once the whole
/// exchange with the peer has finished cleanly; a dropped connection or malformed reply rolls
/// everything this pull would have written back instead of leaving a half-applied sync committed.
pub fn pull(
  store: &Store,
  indexer: &Indexer,
  maildir: &path::Path,
  stream_in: impl io::Read,
  stream_out: impl io::Write,
) -> anyhow::Result<()> {
  let transaction = store.transaction().context("opening pull transaction")?;
  pull_in_transaction(store, indexer, maildir, stream_in, stream_out)?;
  transaction.commit().context("committing pull")?;
  Ok(())
}

fn pull_in_transaction(
  store: &Store,
  indexer: &Indexer,
  maildir: &path::Path,
  stream_in: impl io::Read,
  mut stream_out: impl io::Write,
) -> anyhow::Result<()> {
  let mut input = io::BufReader::new(stream_in);
  let message_sync = MessageSync::new(store, indexer);

  let greeting = read_line(&mut input)?;
  let (code, _continued, dbvers) = split_status(&greeting)?;
  anyhow::ensure!(code == 200, "server rejected the connection: {greeting}");
  anyhow::ensure!(
    dbvers == crate::store::DBVERS,
    "server speaks dbvers {dbvers:?}, we speak {:?}",
    crate::store::DBVERS
  );

  write_line(&mut stream_out, "vect")?;
  stream_out.flush()?;
  let vect_reply = read_line(&mut input)?;
  let (code, _continued, peer_vector) = split_status(&vect_reply)?;
  anyhow::ensure!(code == 200, "vect failed: {vect_reply}");
  let peer = wire::parse_sync_vector(peer_vector).context("parsing server's sync-vector")?;
  log::debug!("peer sync-vector: {peer:?}");

  let our_vector = store.sync_vector()?;
  write_line(&mut stream_out, &format!("sync {}", wire::format_sync_vector(&our_vector)))?;
  stream_out.flush()?;

  let mut pending_fetch: Vec<String> = Vec::new();
  loop {
    let line = read_line(&mut input)?;
    let (code, continued, body) = split_status(&line)?;
    anyhow::ensure!(code == 200, "sync failed: {line}");
    if !continued {
      let synchronized = body
        .strip_prefix("Synchronized ")
        .with_context(|| format!("malformed sync terminator {line:?}"))?;
      let final_vector = wire::parse_sync_vector(synchronized).context("parsing final sync-vector")?;
      for (&replica, &version) in &final_vector {
        store.observe_replica_version(replica, version)?;
      }
      break;
    }
    match wire::parse_record(body).context("parsing a sync record")? {
      Record::Hash(info) => {
        let hash = info.hash.clone();
        let needed = info.dirs.values().sum::<i64>() > 0;
        message_sync.hash_sync(&peer, &info, maildir, None)?;
        if needed && HashLookup::new(store).resolve_pathname(maildir, &hash)?.is_none() {
          pending_fetch.push(hash);
        }
      }
      Record::Tag(info) => {
        message_sync.tag_sync(&peer, &info)?;
      }
    }
  }

  pending_fetch.sort();
  pending_fetch.dedup();
  for hash in &pending_fetch {
    write_line(&mut stream_out, &format!("send {hash}"))?;
    stream_out.flush()?;
    let reply = read_line(&mut input)?;
    let (code, _continued, rest) = split_status(&reply)?;
    if code != 220 {
      log::warn!("peer couldn't supply content for {hash}: {reply}");
      continue;
    }
    let size: usize = rest
      .trim()
      .parse()
      .with_context(|| format!("malformed payload size in {reply:?}"))?;
    let bytes = read_exact(&mut input, size)?;
    let mut reader = io::Cursor::new(bytes);
    message_sync
      .adopt_fetched(maildir, hash, &mut reader)
      .with_context(|| format!("adopting fetched content for {hash}"))?;
  }

  write_line(&mut stream_out, "quit")?;
  stream_out.flush()?;
  let goodbye = read_line(&mut input)?;
  let (code, _continued, _rest) = split_status(&goodbye)?;
  anyhow::ensure!(code == 200, "unexpected quit reply: {goodbye}");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::{HashInfo, TagInfo, Writestamp};
  use std::collections;

  fn open_store(path: &path::Path) -> Store {
    Store::open(&path.join("store.db")).unwrap()
  }

  fn open_indexer(path: &path::Path) -> Indexer {
    Indexer::create(path).unwrap()
  }

  #[test]
  fn split_status_parses_single_and_multi_line_markers() {
    assert_eq!((200, false, "hello"), split_status("200 hello").unwrap());
    assert_eq!((200, true, "L aa 1 m R1=1 ()"), split_status("200-L aa 1 m R1=1 ()").unwrap());
    assert!(split_status("2x0 bad").is_err());
    assert!(split_status("200xbad").is_err());
  }

  #[test]
  fn split_verb_separates_command_and_argument() {
    assert_eq!(("sync", "<R1=2>"), split_verb("sync <R1=2>"));
    assert_eq!(("quit", ""), split_verb("quit"));
  }

  /// Drives a full client/server round trip over an in-memory byte pipe, covering the happy path
  /// of vect -> sync -> send -> quit with a brand new hash the client must fetch.
  #[test]
  fn pull_fetches_new_content_from_serve_and_converges() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(server_dir.path().join("INBOX/cur")).unwrap();
    std::fs::create_dir_all(client_dir.path().join("INBOX/cur")).unwrap();

    let server_store = open_store(server_dir.path());
    let server_indexer = open_indexer(server_dir.path());
    let replica = server_store.self_id().unwrap();

    {
      let sync = MessageSync::new(&server_store, &server_indexer);
      let remote = HashInfo {
        hash: "f572d396fae9206628714fb2ce00f72e94f2258f".to_string(),
        size: 6,
        message_id: "m1@example.com".to_string(),
        hash_stamp: Writestamp { replica, version: 1 },
        dirs: collections::HashMap::from([("INBOX/cur".to_string(), 1)]),
      };
      let mut content = io::Cursor::new(b"hello\n".to_vec());
      sync
        .hash_sync(&crate::wire::SyncVector::new(), &remote, server_dir.path(), Some(&mut content))
        .unwrap();
      let tag = TagInfo {
        message_id: "m1@example.com".to_string(),
        tag_stamp: Writestamp { replica, version: 1 },
        tags: collections::HashSet::from(["inbox".to_string()]),
      };
      sync.tag_sync(&crate::wire::SyncVector::new(), &tag).unwrap();
    }

    let mut to_client = Vec::new();
    {
      let client_vector_request: Vec<u8> = {
        let mut requests = Vec::new();
        write_line(&mut requests, "vect").unwrap();
        let our_vector = crate::wire::SyncVector::new();
        write_line(&mut requests, &format!("sync {}", wire::format_sync_vector(&our_vector))).unwrap();
        write_line(&mut requests, "send f572d396fae9206628714fb2ce00f72e94f2258f").unwrap();
        write_line(&mut requests, "quit").unwrap();
        requests
      };
      serve(&server_store, server_dir.path(), io::Cursor::new(client_vector_request), &mut to_client).unwrap();
    }

    let client_store = open_store(client_dir.path());
    let client_indexer = open_indexer(client_dir.path());
    pull(
      &client_store,
      &client_indexer,
      client_dir.path(),
      io::Cursor::new(to_client),
      io::sink(),
    )
    .unwrap();

    let row = HashLookup::new(&client_store)
      .lookup("f572d396fae9206628714fb2ce00f72e94f2258f")
      .unwrap()
      .unwrap();
    assert_eq!(Some(&1), row.dirs.get("INBOX/cur"));
    let (path, _from_trash) = HashLookup::new(&client_store)
      .resolve_pathname(client_dir.path(), &row.hash)
      .unwrap()
      .unwrap();
    assert_eq!(b"hello\n".to_vec(), std::fs::read(path).unwrap());

    let tag_row = TagLookup::new(&client_store).lookup("m1@example.com").unwrap().unwrap();
    assert_eq!(collections::HashSet::from(["inbox".to_string()]), tag_row.tags);
  }

  #[test]
  fn serve_conf_reports_unknown_key_as_client_error() {
    let directory = tempfile::tempdir().unwrap();
    let store = open_store(directory.path());
    let mut requests = Vec::new();
    write_line(&mut requests, "conf nonexistent").unwrap();
    write_line(&mut requests, "quit").unwrap();
    let mut out = Vec::new();
    serve(&store, directory.path(), io::Cursor::new(requests), &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[1].starts_with("500"), "expected a client error, got {:?}", lines[1]);
  }

  #[test]
  fn pull_rejects_mismatched_dbvers_greeting() {
    let client_dir = tempfile::tempdir().unwrap();
    let client_store = open_store(client_dir.path());
    let client_indexer = open_indexer(client_dir.path());
    let mut reply = Vec::new();
    write_line(&mut reply, "200 some-other-version").unwrap();
    let result = pull(&client_store, &client_indexer, client_dir.path(), io::Cursor::new(reply), io::sink());
    assert!(result.is_err());
  }
}
