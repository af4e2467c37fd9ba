//! End-to-end coverage driving the public `maildrift::run` entry point the same way the binary
//! does, against real tempdir maildirs/notmuch databases/stores. `pull` talks to a real `serve`
//! subprocess (the compiled binary itself) over a pipe, just as it would talk to a remote peer
//! reached over `ssh`.

use std::{fs, path};

fn email(message_id: &str, body: &str) -> String {
  format!("From: a@example.com\nTo: b@example.com\nSubject: test\nMessage-ID: <{message_id}>\n\n{body}\n")
}

fn deliver(maildir: &path::Path, file_name: &str, message_id: &str, body: &str) {
  let cur = maildir.join("cur");
  fs::create_dir_all(&cur).unwrap();
  fs::write(cur.join(file_name), email(message_id, body)).unwrap();
}

fn scan(maildir: &path::Path, store: &path::Path) {
  maildrift::run(&maildrift::Arguments {
    mode: maildrift::Mode::Scan,
    maildir: maildir.to_path_buf(),
    store: store.to_path_buf(),
    notmuch: None,
    create: true,
    threads: None,
    trust_inode: false,
    fast_scan: false,
    remote: Vec::new(),
  })
  .unwrap();
}

fn pull(maildir: &path::Path, store: &path::Path, remote_maildir: &path::Path, remote_store: &path::Path) {
  let remote = vec![
    env!("CARGO_BIN_EXE_maildrift").to_string(),
    "serve".to_string(),
    "--maildir".to_string(),
    remote_maildir.display().to_string(),
    "--store".to_string(),
    remote_store.display().to_string(),
  ];
  maildrift::run(&maildrift::Arguments {
    mode: maildrift::Mode::Pull,
    maildir: maildir.to_path_buf(),
    store: store.to_path_buf(),
    notmuch: None,
    create: true,
    threads: None,
    trust_inode: false,
    fast_scan: false,
    remote,
  })
  .unwrap();
}

#[test]
fn pull_brings_a_fresh_replica_up_to_date() {
  let a = tempfile::tempdir().unwrap();
  let b = tempfile::tempdir().unwrap();
  let a_store = a.path().join("store.db");
  let b_store = b.path().join("store.db");

  deliver(a.path(), "1", "m1@example.com", "hello from a");
  deliver(a.path(), "2", "m2@example.com", "another message");
  scan(a.path(), &a_store);

  pull(b.path(), &b_store, a.path(), &a_store);

  let names: Vec<_> = fs::read_dir(b.path().join("cur"))
    .unwrap()
    .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
    .collect();
  assert_eq!(2, names.len(), "both messages should have been materialized under b: {names:?}");

  let contents: Vec<_> = names
    .iter()
    .map(|name| fs::read_to_string(b.path().join("cur").join(name)).unwrap())
    .collect();
  assert!(contents.iter().any(|body| body.contains("hello from a")));
  assert!(contents.iter().any(|body| body.contains("another message")));
}

#[test]
fn repeated_pull_against_an_unchanged_peer_adds_nothing() {
  let a = tempfile::tempdir().unwrap();
  let b = tempfile::tempdir().unwrap();
  let a_store = a.path().join("store.db");
  let b_store = b.path().join("store.db");

  deliver(a.path(), "1", "m1@example.com", "hello from a");
  scan(a.path(), &a_store);
  pull(b.path(), &b_store, a.path(), &a_store);
  pull(b.path(), &b_store, a.path(), &a_store);

  let count = fs::read_dir(b.path().join("cur")).unwrap().count();
  assert_eq!(1, count, "second pull shouldn't duplicate the already-synced message");
}

#[test]
fn pull_round_trip_survives_a_scan_on_the_receiving_side() {
  let a = tempfile::tempdir().unwrap();
  let b = tempfile::tempdir().unwrap();
  let a_store = a.path().join("store.db");
  let b_store = b.path().join("store.db");

  deliver(a.path(), "1", "m1@example.com", "hello from a");
  scan(a.path(), &a_store);
  pull(b.path(), &b_store, a.path(), &a_store);

  // a scan on b shouldn't rehash or otherwise disturb what pull just materialized.
  scan(b.path(), &b_store);
  let count = fs::read_dir(b.path().join("cur")).unwrap().count();
  assert_eq!(1, count);
}
