//! Streaming tarsum computation
//!
//! A tarsum digest hashes a canonicalized view of a tar stream rather
//! than its raw bytes: for each entry, in order, a canonical header line
//! (name, mode, uid, gid, size, typeflag) followed by the entry content.
//! Zero blocks at the end of the archive do not contribute.

use sha2::{Digest as _, Sha256};

const BLOCK: usize = 512;

#[derive(Clone, Debug)]
enum State {
    /// Waiting for a full 512-byte header block
    Header,
    /// Consuming entry content, then `padding` filler bytes
    Data { remaining: u64, padding: usize },
}

/// Incremental tarsum hasher.
///
/// Accepts arbitrarily-sized writes; a small internal buffer aligns the
/// stream on tar block boundaries.
#[derive(Clone, Debug)]
pub struct TarsumHasher {
    sha: Sha256,
    state: State,
    buf: Vec<u8>,
}

impl Default for TarsumHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TarsumHasher {
    pub fn new() -> Self {
        Self {
            sha: Sha256::new(),
            state: State::Header,
            buf: Vec::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);

        loop {
            match self.state {
                State::Header => {
                    if self.buf.len() < BLOCK {
                        return;
                    }
                    let header: Vec<u8> = self.buf.drain(..BLOCK).collect();
                    if header.iter().all(|&b| b == 0) {
                        // End-of-archive filler block
                        continue;
                    }
                    let size = parse_octal(&header[124..136]);
                    self.hash_header(&header, size);
                    if size > 0 {
                        self.state = State::Data {
                            remaining: size,
                            padding: (BLOCK - (size as usize % BLOCK)) % BLOCK,
                        };
                    }
                }
                State::Data {
                    ref mut remaining,
                    ref mut padding,
                } => {
                    if *remaining > 0 {
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        if take == 0 {
                            return;
                        }
                        self.sha.update(&self.buf[..take]);
                        self.buf.drain(..take);
                        *remaining -= take as u64;
                    }
                    if *remaining > 0 {
                        return;
                    }
                    // Skip the filler up to the next block boundary
                    let skip = (*padding).min(self.buf.len());
                    self.buf.drain(..skip);
                    *padding -= skip;
                    if *padding > 0 {
                        return;
                    }
                    self.state = State::Header;
                }
            }
        }
    }

    fn hash_header(&mut self, header: &[u8], size: u64) {
        let name = trimmed_str(&header[0..100]);
        let mode = parse_octal(&header[100..108]);
        let uid = parse_octal(&header[108..116]);
        let gid = parse_octal(&header[116..124]);
        let typeflag = header[156] as char;

        let canonical = format!("{}{}{}{}{}{}", name, mode, uid, gid, size, typeflag);
        self.sha.update(canonical.as_bytes());
    }

    pub fn finalize(self) -> String {
        hex::encode(self.sha.finalize())
    }
}

fn trimmed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}

fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in field {
        match b {
            b'0'..=b'7' => value = value * 8 + (b - b'0') as u64,
            b' ' | 0 => continue,
            _ => break,
        }
    }
    value
}
