//! Torrent metainfo (".torrent" file) decoding.
//!
//! The decoder extracts everything the engine needs: the torrent name, piece
//! length and hashes, the file list, the announce URLs, and the info hash
//! computed over the bencoded `info` dictionary.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

#[derive(Debug)]
pub struct Metainfo {
    /// The name of the torrent, which is also the name of the file or
    /// directory it is downloaded into.
    pub name: String,
    /// The SHA-1 hash of the bencoded `info` dictionary. This is the
    /// torrent's stable identifier.
    pub info_hash: Sha1Hash,
    /// The expected hash of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The nominal length of a piece. All pieces but the last have this
    /// length.
    pub piece_len: u32,
    /// The file or files the torrent's byte stream maps onto, with paths
    /// relative to the download directory.
    pub structure: FsStructure,
    /// The primary announce URL, if present.
    pub announce: Option<String>,
    /// Tiers of fallback announce URLs, if present.
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        if raw.info.name.is_empty() {
            return Err(Error::InvalidMetainfo);
        }
        if raw.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo);
        }
        // the pieces field is the concatenation of 20 byte SHA-1 hashes
        if raw.info.pieces.is_empty() || raw.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo);
        }
        let piece_hashes: Vec<Sha1Hash> = raw
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // a torrent is either a single file or an archive of files, but
        // never both
        let structure = match (raw.info.length, &raw.info.files) {
            (Some(len), None) => {
                if len == 0 {
                    return Err(Error::InvalidMetainfo);
                }
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&raw.info.name),
                    torrent_offset: 0,
                    len,
                })
            }
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::InvalidMetainfo);
                }
                let mut file_infos = Vec::with_capacity(files.len());
                let mut torrent_offset = 0;
                for file in files.iter() {
                    let mut path = PathBuf::new();
                    for component in file.path.iter() {
                        if component.is_empty()
                            || component == ".."
                            || component.contains('/')
                        {
                            return Err(Error::InvalidMetainfo);
                        }
                        path.push(component);
                    }
                    if path.as_os_str().is_empty() || path.is_absolute() {
                        return Err(Error::InvalidMetainfo);
                    }
                    file_infos.push(FileInfo {
                        path,
                        torrent_offset,
                        len: file.length,
                    });
                    torrent_offset += file.length;
                }
                FsStructure::Archive { files: file_infos }
            }
            _ => return Err(Error::InvalidMetainfo),
        };

        // the piece hashes must cover the download size exactly
        let total_size = structure.total_size();
        let piece_count = piece_hashes.len() as u64;
        let piece_len = raw.info.piece_length as u64;
        if total_size <= piece_len * (piece_count - 1)
            || total_size > piece_len * piece_count
        {
            return Err(Error::InvalidMetainfo);
        }

        // The info hash is computed over the info dictionary in its bencoded
        // form. Re-encoding the parsed dictionary yields the original bytes
        // as bencode dictionary keys are in sorted order.
        let info = serde_bencode::to_bytes(&raw.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        Ok(Self {
            name: raw.info.name,
            info_hash,
            piece_hashes,
            piece_len: raw.info.piece_length,
            structure,
            announce: raw.announce,
            announce_list: raw.announce_list,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> PieceIndex {
        self.piece_hashes.len()
    }

    /// The sum of the lengths of all files in the torrent.
    pub fn total_size(&self) -> u64 {
        self.structure.total_size()
    }

    /// Returns the ordered, de-duplicated list of announce URLs: the primary
    /// `announce` URL first, followed by each URL in each tier of
    /// `announce-list`.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut add = |url: &str| {
            if !url.is_empty() && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        };
        if let Some(announce) = &self.announce {
            add(announce);
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers.iter() {
                for url in tier.iter() {
                    add(url);
                }
            }
        }
        urls
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: RawInfo,
}

// Field order matters: bencode dictionaries keep their keys sorted, so the
// fields are declared in sorted key order to make the re-encoded dictionary
// byte-identical to the original.
#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}
