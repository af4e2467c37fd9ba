//! The unbounded duplex buffer (spec §4.5): a producer/consumer byte queue that grows in fixed
//! chunks instead of blocking the producer, with a small putback window and sticky EOF/error.

use std::{
  collections, io,
  sync::{Arc, Condvar, Mutex},
};

/// Bytes per chunk (matches `infinibuf`'s `chunksize_`).
pub const CHUNK_SIZE: usize = 64 * 1024;
/// How many already-consumed bytes stay resident so a reader can `putback` a short lookahead.
const PUTBACK_SIZE: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
  Read(usize),
  /// No data yet, but the stream hasn't ended or errored either.
  WouldBlock,
  Eof,
  Error(i32),
}

/// A single producer/consumer byte buffer. Not `Sync` by itself — see [`Shared`] for the
/// thread-safe wrapper used when a reader and a writer thread share one buffer.
pub struct Duplex {
  chunks: collections::VecDeque<Vec<u8>>,
  /// Logical offset (since buffer creation) of the first byte in `chunks[0]`.
  base_offset: usize,
  /// Logical offset of the next byte `read` will return.
  read_offset: usize,
  /// Logical offset of the next byte `write` will append.
  write_offset: usize,
  eof: bool,
  error: Option<i32>,
}

impl Duplex {
  pub fn new() -> Self {
    Self {
      chunks: collections::VecDeque::new(),
      base_offset: 0,
      read_offset: 0,
      write_offset: 0,
      eof: false,
      error: None,
    }
  }

  /// Append-only from the producer side.
  pub fn write(&mut self, mut bytes: &[u8]) {
    assert!(!self.eof, "write after eof is a programming error");
    while !bytes.is_empty() {
      if self.chunks.back().map_or(true, |chunk| chunk.len() == CHUNK_SIZE) {
        self.chunks.push_back(Vec::with_capacity(CHUNK_SIZE));
      }
      let chunk = self.chunks.back_mut().unwrap();
      let take = (CHUNK_SIZE - chunk.len()).min(bytes.len());
      chunk.extend_from_slice(&bytes[..take]);
      bytes = &bytes[take..];
      self.write_offset += take;
    }
  }

  pub fn set_eof(&mut self) {
    self.eof = true;
  }

  pub fn is_eof(&self) -> bool {
    self.eof
  }

  /// Sticky error: once set, `read` always reports it.
  pub fn set_error(&mut self, code: i32) {
    self.error.get_or_insert(code);
  }

  pub fn error(&self) -> Option<i32> {
    self.error
  }

  /// Unread bytes currently buffered.
  pub fn len(&self) -> usize {
    self.write_offset - self.read_offset
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// FIFO drain from the consumer side. Returns how many bytes were copied into `buf`.
  pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
    if let Some(code) = self.error {
      return ReadOutcome::Error(code);
    }
    let mut written = 0;
    while written < buf.len() && self.read_offset < self.write_offset {
      let chunk_index = (self.read_offset - self.base_offset) / CHUNK_SIZE;
      let chunk_start = chunk_index * CHUNK_SIZE;
      let chunk = &self.chunks[chunk_index];
      let offset_in_chunk = self.read_offset - self.base_offset - chunk_start;
      let available = chunk.len() - offset_in_chunk;
      let take = available.min(buf.len() - written);
      buf[written..written + take].copy_from_slice(&chunk[offset_in_chunk..offset_in_chunk + take]);
      written += take;
      self.read_offset += take;
    }
    self.compact();
    if written > 0 {
      ReadOutcome::Read(written)
    } else if self.eof {
      ReadOutcome::Eof
    } else {
      ReadOutcome::WouldBlock
    }
  }

  /// Rewind the read cursor by `n` bytes, as long as they're still inside the putback window.
  pub fn putback(&mut self, n: usize) {
    assert!(n <= PUTBACK_SIZE, "putback window is only {PUTBACK_SIZE} bytes");
    assert!(
      self.read_offset.checked_sub(n).map_or(false, |pos| pos >= self.base_offset),
      "putback past the freed prefix"
    );
    self.read_offset -= n;
  }

  /// Drop fully-consumed chunks, retaining a `PUTBACK_SIZE`-byte cushion behind the read cursor.
  fn compact(&mut self) {
    while let Some(front) = self.chunks.front() {
      let front_end = self.base_offset + front.len();
      if front_end + PUTBACK_SIZE <= self.read_offset {
        self.base_offset = front_end;
        self.chunks.pop_front();
      } else {
        break;
      }
    }
  }
}

impl Default for Duplex {
  fn default() -> Self {
    Self::new()
  }
}

/// A `Duplex` shared between one producer and one consumer thread.
#[derive(Clone)]
pub struct Shared {
  inner: Arc<(Mutex<Duplex>, Condvar)>,
}

impl Shared {
  pub fn new() -> Self {
    Self {
      inner: Arc::new((Mutex::new(Duplex::new()), Condvar::new())),
    }
  }

  pub fn write(&self, bytes: &[u8]) {
    let (mutex, condvar) = &*self.inner;
    let mut duplex = mutex.lock().unwrap();
    let was_empty = duplex.is_empty();
    duplex.write(bytes);
    if was_empty {
      condvar.notify_all();
    }
  }

  pub fn set_eof(&self) {
    let (mutex, condvar) = &*self.inner;
    let mut duplex = mutex.lock().unwrap();
    duplex.set_eof();
    condvar.notify_all();
  }

  pub fn set_error(&self, code: i32) {
    let (mutex, condvar) = &*self.inner;
    let mut duplex = mutex.lock().unwrap();
    duplex.set_error(code);
    condvar.notify_all();
  }

  /// Block until at least one byte is available, EOF, or an error is sticky.
  pub fn read_blocking(&self, buf: &mut [u8]) -> ReadOutcome {
    let (mutex, condvar) = &*self.inner;
    let mut duplex = mutex.lock().unwrap();
    loop {
      match duplex.read(buf) {
        ReadOutcome::WouldBlock => duplex = condvar.wait(duplex).unwrap(),
        outcome => return outcome,
      }
    }
  }
}

impl Default for Shared {
  fn default() -> Self {
    Self::new()
  }
}

/// Runs until `reader` hits EOF or an error, appending everything read into `buffer`. Meant to be
/// run on its own thread (e.g. a reader thread fed by a child process's stdout).
pub fn fill_from_reader<R: io::Read>(mut reader: R, buffer: &Shared) {
  let mut chunk = vec![0u8; CHUNK_SIZE];
  loop {
    match reader.read(&mut chunk) {
      Ok(0) => {
        buffer.set_eof();
        return;
      }
      Ok(n) => buffer.write(&chunk[..n]),
      Err(error) => {
        buffer.set_error(error.raw_os_error().unwrap_or(-1));
        return;
      }
    }
  }
}

/// Drains `buffer` into `writer` until EOF, then closes (drops) `writer`. Meant to be run on its
/// own thread so the application thread never blocks on a child process's stdin.
pub fn drain_to_writer<W: io::Write>(mut writer: W, buffer: &Shared) {
  let mut chunk = vec![0u8; CHUNK_SIZE];
  loop {
    match buffer.read_blocking(&mut chunk) {
      ReadOutcome::Read(n) => {
        if writer.write_all(&chunk[..n]).is_err() {
          return;
        }
      }
      ReadOutcome::Eof => return,
      ReadOutcome::Error(_) => return,
      ReadOutcome::WouldBlock => unreachable!("read_blocking only returns once data is available"),
    }
  }
}
