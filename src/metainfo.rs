//! Torrent metainfo (BEP-3).
//!
//! Parses `.torrent` files and raw info dictionaries into [`Metainfo`] and
//! [`Info`]. The engine consumes this module through a narrow surface: the
//! info hash, piece geometry, piece hashes and the raw bencoded info bytes
//! (served verbatim over the metadata extension).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{decode, encode, Value};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The 20-byte SHA-1 of the bencoded info dictionary. Identifies a swarm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hashes raw bencoded info-dictionary bytes.
    pub fn of(raw_info: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(raw_info);
        InfoHash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        InfoHash(bytes)
    }
}

/// A parsed torrent file: the info dictionary plus the envelope around it.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: InfoHash,
    /// Primary tracker URL, if the torrent names one.
    pub announce: Option<String>,
    raw_info: Bytes,
}

/// The info dictionary: everything covered by the info hash.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    /// One SHA-1 per piece.
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<File>,
    pub total_length: u64,
}

/// A file within a torrent. Single-file torrents have exactly one entry
/// whose path is the torrent name.
#[derive(Debug, Clone)]
pub struct File {
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the concatenated piece data.
    pub offset: u64,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = Bytes::from(encode(info_value));
        let info_hash = InfoHash::of(&raw_info);
        let info = parse_info(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            info,
            info_hash,
            announce,
            raw_info,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// The raw bencoded info dictionary, as served over the metadata
    /// extension (BEP-9).
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }
}

impl Info {
    /// Decodes a raw bencoded info dictionary, as received from the
    /// metadata extension. The caller has already checked its SHA-1
    /// against the info hash.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, MetainfoError> {
        parse_info(&decode(raw)?)
    }

    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// The length of piece `index`; the last piece is usually shorter.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length) as u32
    }
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

    let name = dict
        .get(b"name".as_slice())
        .and_then(|v| v.as_str())
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(|v| v.as_integer())
        .filter(|&n| n > 0)
        .ok_or(MetainfoError::MissingField("piece length"))? as u64;

    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or(MetainfoError::MissingField("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }
    let pieces = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let (files, total_length) = parse_files(dict, &name)?;

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_length,
    })
}

fn parse_files(
    dict: &BTreeMap<Bytes, Value>,
    name: &str,
) -> Result<(Vec<File>, u64), MetainfoError> {
    if let Some(length) = dict.get(b"length".as_slice()).and_then(|v| v.as_integer()) {
        let length = length as u64;
        let file = File {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![file], length));
    }

    let list = dict
        .get(b"files".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;

    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;
    for entry in list {
        let file_dict = entry.as_dict().ok_or(MetainfoError::InvalidField("files"))?;
        let length = file_dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("file length"))? as u64;
        let path: PathBuf = std::iter::once(name.to_string())
            .chain(
                file_dict
                    .get(b"path".as_slice())
                    .and_then(|v| v.as_list())
                    .ok_or(MetainfoError::MissingField("file path"))?
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from)),
            )
            .collect();
        files.push(File {
            path,
            length,
            offset,
        });
        offset += length;
    }
    Ok((files, offset))
}

/// Builds a torrent from in-memory content. Used by tests and by anything
/// that wants to publish local data.
pub struct Builder {
    name: String,
    piece_length: u64,
    announce: Option<String>,
    files: Vec<(String, Vec<u8>)>,
}

impl Builder {
    pub fn new(name: &str, piece_length: u64) -> Self {
        Self {
            name: name.to_string(),
            piece_length,
            announce: None,
            files: Vec::new(),
        }
    }

    pub fn announce(mut self, url: &str) -> Self {
        self.announce = Some(url.to_string());
        self
    }

    /// Adds a file. One call builds a single-file torrent using the torrent
    /// name; more than one builds a multi-file torrent.
    pub fn file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.to_string(), content.into()));
        self
    }

    pub fn build(self) -> (Metainfo, Vec<u8>) {
        let content: Vec<u8> = self
            .files
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();

        let mut pieces = Vec::new();
        for chunk in content.chunks(self.piece_length as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            pieces.extend_from_slice(&hasher.finalize());
        }

        let mut info = BTreeMap::new();
        info.insert(Bytes::from_static(b"name"), Value::string(&self.name));
        info.insert(
            Bytes::from_static(b"piece length"),
            Value::Integer(self.piece_length as i64),
        );
        info.insert(Bytes::from_static(b"pieces"), Value::Bytes(pieces.into()));
        if self.files.len() == 1 {
            info.insert(
                Bytes::from_static(b"length"),
                Value::Integer(self.files[0].1.len() as i64),
            );
        } else {
            let files = self
                .files
                .iter()
                .map(|(path, data)| {
                    let mut fd = BTreeMap::new();
                    fd.insert(
                        Bytes::from_static(b"length"),
                        Value::Integer(data.len() as i64),
                    );
                    fd.insert(
                        Bytes::from_static(b"path"),
                        Value::List(path.split('/').map(Value::string).collect()),
                    );
                    Value::Dict(fd)
                })
                .collect();
            info.insert(Bytes::from_static(b"files"), Value::List(files));
        }

        let mut root = BTreeMap::new();
        if let Some(url) = &self.announce {
            root.insert(Bytes::from_static(b"announce"), Value::string(url));
        }
        root.insert(Bytes::from_static(b"info"), Value::Dict(info));

        let torrent_bytes = encode(&Value::Dict(root));
        let mi = Metainfo::from_bytes(&torrent_bytes).expect("built torrent parses");
        (mi, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_round_trip() {
        let (mi, content) = Builder::new("hello.txt", 32768)
            .file("hello.txt", b"Hello World\n".to_vec())
            .build();
        assert_eq!(content, b"Hello World\n");
        assert_eq!(mi.info.total_length, 12);
        assert_eq!(mi.info.num_pieces(), 1);
        assert_eq!(mi.info.piece_len(0), 12);
        assert_eq!(mi.info.files.len(), 1);
        // the raw info bytes hash to the advertised info hash
        assert_eq!(InfoHash::of(mi.raw_info()), mi.info_hash);
    }

    #[test]
    fn multi_file_offsets() {
        let (mi, content) = Builder::new("album", 4)
            .file("a.txt", b"aaaa".to_vec())
            .file("sub/b.txt", b"bbbbbb".to_vec())
            .build();
        assert_eq!(content.len(), 10);
        assert_eq!(mi.info.files.len(), 2);
        assert_eq!(mi.info.files[0].offset, 0);
        assert_eq!(mi.info.files[1].offset, 4);
        assert_eq!(mi.info.num_pieces(), 3);
        assert_eq!(mi.info.piece_len(2), 2);
    }

    #[test]
    fn info_from_raw_bytes_matches() {
        let (mi, _) = Builder::new("x", 16384).file("x", vec![7u8; 100]).build();
        let reparsed = Info::from_bytes(mi.raw_info()).unwrap();
        assert_eq!(reparsed.total_length, mi.info.total_length);
        assert_eq!(reparsed.pieces, mi.info.pieces);
    }

    #[test]
    fn last_piece_shorter() {
        let (mi, _) = Builder::new("x", 8).file("x", vec![1u8; 20]).build();
        assert_eq!(mi.info.num_pieces(), 3);
        assert_eq!(mi.info.piece_len(0), 8);
        assert_eq!(mi.info.piece_len(2), 4);
    }

    #[test]
    fn reject_truncated_pieces() {
        let (mi, _) = Builder::new("x", 8).file("x", vec![1u8; 20]).build();
        let mut raw = mi.raw_info().to_vec();
        // corrupt the pieces length by re-encoding with a 19-byte string
        let value = decode(&raw).unwrap();
        let mut dict = value.into_dict().unwrap();
        dict.insert(
            Bytes::from_static(b"pieces"),
            Value::Bytes(Bytes::from(vec![0u8; 19])),
        );
        raw = encode(&Value::Dict(dict));
        assert!(Info::from_bytes(&raw).is_err());
    }
}
