//! Driver surface (spec §6): a thin `clap`-derived `Arguments`/`Mode` layered over the three
//! library entry points the core actually needs — `scan`, `serve`, `pull` — plus the subprocess
//! wiring `pull` needs to talk to a remote peer over its stdio.

use std::{io, path, process};

use anyhow::Context as _;

pub mod maildir;
mod notmuch;
mod protocol;
mod scanner;
mod store;

mod duplex;
mod hash;
mod wire;

#[derive(Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Mode {
  /// Bring the store and indexer into agreement with the maildir on disk.
  Scan,
  /// Serve sync requests over stdin/stdout (meant to be invoked by a peer's `pull`, typically
  /// over `ssh`).
  Serve,
  /// Spawn a remote peer and pull whatever it has that we don't.
  Pull,
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Execution mode: scan | serve | pull", hide_possible_values(true))]
  pub mode: Mode,

  #[arg(long = "maildir", help = "Maildir root directory")]
  pub maildir: path::PathBuf,
  #[arg(long = "store", help = "Path to the sync store file")]
  pub store: path::PathBuf,
  #[arg(long = "notmuch", help = "Path to the notmuch database (defaults to the maildir)")]
  pub notmuch: Option<path::PathBuf>,
  #[arg(
    long = "create",
    help = "Create the store and notmuch database if they don't exist",
    default_value_t = false
  )]
  pub create: bool,

  #[arg(
    long = "threads",
    help = "Worker threads for the scan's hashing pool (defaults to the host's parallelism)"
  )]
  pub threads: Option<usize>,
  #[arg(
    long = "trust-inode",
    help = "Trust a cache hit's recorded size without re-reading its hash row",
    default_value_t = false
  )]
  pub trust_inode: bool,
  #[arg(
    long = "fast-scan",
    help = "Skip files whose mtime predates the last completed scan, without a cache lookup",
    default_value_t = false
  )]
  pub fast_scan: bool,

  #[arg(
    last = true,
    help = "Remote command to spawn for `pull` (e.g. ssh host maildrift serve ...)"
  )]
  pub remote: Vec<String>,
}

fn open_indexer(arguments: &Arguments) -> anyhow::Result<notmuch::Indexer> {
  let path = arguments.notmuch.as_deref().unwrap_or(&arguments.maildir);
  if arguments.create {
    match notmuch::Indexer::open(path) {
      Ok(indexer) => Ok(indexer),
      Err(_) => notmuch::Indexer::create(path),
    }
  } else {
    notmuch::Indexer::open(path)
  }
}

fn open_store(arguments: &Arguments) -> anyhow::Result<store::Store> {
  if !arguments.create {
    anyhow::ensure!(
      arguments.store.exists(),
      "store {} doesn't exist (pass --create to make one)",
      arguments.store.display()
    );
  }
  store::Store::open(&arguments.store)
}

fn run_scan(arguments: &Arguments) -> anyhow::Result<()> {
  let store = open_store(arguments)?;
  let indexer = open_indexer(arguments)?;
  let mut scanner = scanner::Scanner::new(&store, &indexer, &arguments.maildir);
  scanner.trust_inode = arguments.trust_inode;
  scanner.fast_scan = arguments.fast_scan;
  if let Some(threads) = arguments.threads {
    scanner.threads = threads;
  }
  let stats = scanner.run()?;
  log::info!(
    "scan complete: {} file(s) seen, {} hashed, {} removed, {} docid(s) changed, mutated={}",
    stats.files_seen,
    stats.files_hashed,
    stats.files_removed,
    stats.docids_changed,
    stats.mutated,
  );
  Ok(())
}

fn run_serve(arguments: &Arguments) -> anyhow::Result<()> {
  let store = open_store(arguments)?;
  protocol::serve(&store, &arguments.maildir, io::stdin(), io::stdout())
}

/// Adapts a [`duplex::Shared`] buffer's consumer side to [`io::Read`], so the protocol engine can
/// be driven against a spawned child's stdio without knowing about threads or buffering.
struct SharedReader<'a>(&'a duplex::Shared);

impl io::Read for SharedReader<'_> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self.0.read_blocking(buf) {
      duplex::ReadOutcome::Read(n) => Ok(n),
      duplex::ReadOutcome::Eof => Ok(0),
      duplex::ReadOutcome::Error(code) => Err(io::Error::from_raw_os_error(code)),
      duplex::ReadOutcome::WouldBlock => unreachable!("read_blocking only returns once data is available"),
    }
  }
}

/// Adapts a [`duplex::Shared`] buffer's producer side to [`io::Write`].
struct SharedWriter<'a>(&'a duplex::Shared);

impl io::Write for SharedWriter<'_> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.write(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn run_pull(arguments: &Arguments) -> anyhow::Result<()> {
  anyhow::ensure!(!arguments.remote.is_empty(), "pull needs a remote command after `--`");
  let store = open_store(arguments)?;
  let indexer = open_indexer(arguments)?;

  log::info!("spawning remote peer: {:?}", arguments.remote);
  let mut child = process::Command::new(&arguments.remote[0])
    .args(&arguments.remote[1..])
    .stdin(process::Stdio::piped())
    .stdout(process::Stdio::piped())
    .spawn()
    .with_context(|| format!("spawning {:?}", arguments.remote))?;
  let child_stdin = child.stdin.take().context("child has no stdin")?;
  let child_stdout = child.stdout.take().context("child has no stdout")?;

  let inbound = duplex::Shared::new();
  let outbound = duplex::Shared::new();

  let result = crossbeam_utils::thread::scope(|scope| {
    scope.spawn(|_| duplex::fill_from_reader(child_stdout, &inbound));
    scope.spawn(|_| duplex::drain_to_writer(child_stdin, &outbound));
    let result = protocol::pull(
      &store,
      &indexer,
      &arguments.maildir,
      SharedReader(&inbound),
      SharedWriter(&outbound),
    );
    // The drainer thread blocks on the outbound buffer until EOF; signal it here, inside the
    // scope, so `scope`'s implicit join below doesn't wait on a thread we never told to stop.
    outbound.set_eof();
    result
  })
  .unwrap();

  let status = child.wait().context("waiting for the remote peer to exit")?;
  anyhow::ensure!(status.success(), "remote peer exited with {status}");
  result
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  match arguments.mode {
    Mode::Scan => run_scan(arguments),
    Mode::Serve => run_serve(arguments),
    Mode::Pull => run_pull(arguments),
  }
}

