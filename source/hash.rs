use std::io::Read as _;

use sha1::Digest as _;

/// Bytes read per `update` call when streaming a file through the hasher.
const CHUNK_SIZE: usize = 64 * 1024;

/// A lowercase-hex SHA-1 digest, always 40 characters.
pub type Hash = String;

/// Streaming SHA-1 digest. `update` may be called any number of times; `finalize` is one-shot.
pub struct Hasher(sha1::Sha1);

impl Hasher {
  pub fn new() -> Self {
    Self(sha1::Sha1::new())
  }

  pub fn update(&mut self, bytes: &[u8]) {
    self.0.update(bytes);
  }

  pub fn finalize(self) -> Hash {
    hex::encode(self.0.finalize())
  }
}

impl Default for Hasher {
  fn default() -> Self {
    Self::new()
  }
}

/// Hash a whole byte stream, reading it in fixed-size chunks.
pub fn hash_reader<R: std::io::Read>(mut reader: R) -> anyhow::Result<Hash> {
  let mut hasher = Hasher::new();
  let mut buffer = vec![0u8; CHUNK_SIZE];
  loop {
    let read = reader.read(&mut buffer)?;
    if read == 0 {
      break;
    }
    hasher.update(&buffer[..read]);
  }
  Ok(hasher.finalize())
}

pub fn hash_file(path: &std::path::Path) -> anyhow::Result<Hash> {
  let file = std::fs::File::open(path)?;
  hash_reader(file)
}

/// A valid hash is 40 characters, all in `[0-9a-f]`.
pub fn is_valid_hash(hash: &str) -> bool {
  hash.len() == 40 && hash.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hello_matches_known_sha1() {
    // The canonical example from the end-to-end "fresh init" scenario.
    let mut hasher = Hasher::new();
    hasher.update(b"hello\n");
    assert_eq!(
      "f572d396fae9206628714fb2ce00f72e94f2258f",
      hasher.finalize()
    );
  }

  #[test]
  fn streaming_matches_one_shot() {
    let data = vec![b'x'; 3 * CHUNK_SIZE + 17];
    let mut one_shot = Hasher::new();
    one_shot.update(&data);
    let one_shot = one_shot.finalize();

    let streamed = hash_reader(std::io::Cursor::new(&data)).unwrap();
    assert_eq!(one_shot, streamed);
  }

  #[test]
  fn validator_accepts_only_forty_lowercase_hex_chars() {
    assert!(is_valid_hash("f572d396fae9206628714fb2ce00f72e94f2258f"));
    assert!(!is_valid_hash("F572D396FAE9206628714FB2CE00F72E94F2258F"));
    assert!(!is_valid_hash("f572d396"));
    assert!(!is_valid_hash(""));
    assert!(!is_valid_hash("g572d396fae9206628714fb2ce00f72e94f2258f"));
  }

  #[test]
  fn hash_file_reads_full_content() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("message");
    std::fs::write(&path, b"hello\n").unwrap();
    assert_eq!(
      "f572d396fae9206628714fb2ce00f72e94f2258f",
      hash_file(&path).unwrap()
    );
  }
}
