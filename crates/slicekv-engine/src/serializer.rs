//! Backing-file serializers
//!
//! Each data file starts with a fixed 32-byte header followed by a
//! bincode-encoded map from proxy id to slice snapshot. Rewrites go
//! through a temp file and rename so a crash never leaves a torn file
//! behind. All files of one store share a creation timestamp; the
//! multiplexer refuses to assemble files from different formats.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use slicekv_common::{Error, Result};

pub const SERIALIZER_MAGIC: u32 = u32::from_le_bytes(*b"SLKV");
pub const SERIALIZER_VERSION: u32 = 1;

const HEADER_SIZE: usize = 32;

/// Fixed-size header at the start of every backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializerHeader {
    pub magic: u32,
    pub version: u32,
    /// Millisecond timestamp minted once per format, identical across
    /// all files of one store.
    pub creation_timestamp: u64,
    /// Position of this file in the store's file list.
    pub file_index: u32,
    pub n_files: u32,
    /// Total slice count, data shards plus the metadata shard.
    pub n_proxies: u32,
    pub body_checksum: u32,
}

impl SerializerHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.creation_timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.file_index.to_le_bytes());
        buf[20..24].copy_from_slice(&self.n_files.to_le_bytes());
        buf[24..28].copy_from_slice(&self.n_proxies.to_le_bytes());
        buf[28..32].copy_from_slice(&self.body_checksum.to_le_bytes());
        buf
    }

    /// Parses a header, returning `None` on short input or bad magic.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
        if magic != SERIALIZER_MAGIC {
            return None;
        }
        Some(Self {
            magic,
            version: u32::from_le_bytes(data[4..8].try_into().ok()?),
            creation_timestamp: u64::from_le_bytes(data[8..16].try_into().ok()?),
            file_index: u32::from_le_bytes(data[16..20].try_into().ok()?),
            n_files: u32::from_le_bytes(data[20..24].try_into().ok()?),
            n_proxies: u32::from_le_bytes(data[24..28].try_into().ok()?),
            body_checksum: u32::from_le_bytes(data[28..32].try_into().ok()?),
        })
    }
}

type SlotMap = HashMap<u32, Vec<u8>>;

/// One backing data file holding the snapshots of the slices striped
/// onto it, keyed by proxy id.
#[derive(Debug)]
pub struct FileSerializer {
    path: PathBuf,
    header: SerializerHeader,
    slots: Mutex<SlotMap>,
}

impl FileSerializer {
    /// Formats a fresh file, discarding anything previously at `path`.
    pub fn create(
        path: &Path,
        creation_timestamp: u64,
        file_index: u32,
        n_files: u32,
        n_proxies: u32,
    ) -> Result<Self> {
        let header = SerializerHeader {
            magic: SERIALIZER_MAGIC,
            version: SERIALIZER_VERSION,
            creation_timestamp,
            file_index,
            n_files,
            n_proxies,
            body_checksum: 0,
        };
        let serializer = Self {
            path: path.to_path_buf(),
            header,
            slots: Mutex::new(SlotMap::new()),
        };
        serializer.write_file(&serializer.slots.lock())?;
        info!(path = %path.display(), file_index, "serializer formatted");
        Ok(serializer)
    }

    /// Opens an existing file, verifying header and body checksum.
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let header = SerializerHeader::from_bytes(&data).ok_or_else(|| {
            Error::corruption(format!("bad serializer header in {}", path.display()))
        })?;
        if header.version != SERIALIZER_VERSION {
            return Err(Error::corruption(format!(
                "unsupported serializer version {} in {}",
                header.version,
                path.display(),
            )));
        }
        let body = &data[HEADER_SIZE..];
        if crc32c::crc32c(body) != header.body_checksum {
            return Err(Error::corruption(format!(
                "body checksum mismatch in {}",
                path.display(),
            )));
        }
        let slots: SlotMap = bincode::deserialize(body).map_err(|e| {
            Error::corruption(format!("slot map decode in {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), slots = slots.len(), "serializer opened");
        Ok(Self {
            path: path.to_path_buf(),
            header,
            slots: Mutex::new(slots),
        })
    }

    /// Cheap header probe: does `path` look like a store file this
    /// build can open? Never touches the body.
    pub fn check(path: &Path) -> bool {
        let mut buf = [0u8; HEADER_SIZE];
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        if file.read_exact(&mut buf).is_err() {
            return false;
        }
        match SerializerHeader::from_bytes(&buf) {
            Some(header) => header.version == SERIALIZER_VERSION,
            None => false,
        }
    }

    pub fn header(&self) -> &SerializerHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces one slice snapshot and persists the whole file.
    pub fn save_slot(&self, proxy_id: u32, blob: Vec<u8>) -> Result<()> {
        let mut slots = self.slots.lock();
        slots.insert(proxy_id, blob);
        self.write_file(&slots)
    }

    pub fn load_slot(&self, proxy_id: u32) -> Option<Vec<u8>> {
        self.slots.lock().get(&proxy_id).cloned()
    }

    /// Final write-back before the file is released.
    pub fn close(&self) -> Result<()> {
        let slots = self.slots.lock();
        self.write_file(&slots)?;
        debug!(path = %self.path.display(), "serializer closed");
        Ok(())
    }

    fn write_file(&self, slots: &SlotMap) -> Result<()> {
        let body = bincode::serialize(slots)
            .map_err(|e| Error::serialization(format!("slot map encode: {e}")))?;
        let mut header = self.header;
        header.body_checksum = crc32c::crc32c(&body);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&header.to_bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Cheap handle giving one slice access to its slot in a backing file.
#[derive(Clone, Debug)]
pub struct ProxySerializer {
    file: Arc<FileSerializer>,
    proxy_id: u32,
}

impl ProxySerializer {
    pub fn proxy_id(&self) -> u32 {
        self.proxy_id
    }

    pub fn save(&self, blob: Vec<u8>) -> Result<()> {
        self.file.save_slot(self.proxy_id, blob)
    }

    pub fn load(&self) -> Option<Vec<u8>> {
        self.file.load_slot(self.proxy_id)
    }
}

/// Stripes proxies across the store's backing files.
///
/// Proxy `i` lives in file `i % n_files`. The shard count of an opened
/// store is derived from the recorded proxy count, never passed in.
#[derive(Debug)]
pub struct SerializerMultiplexer {
    files: Vec<Arc<FileSerializer>>,
    n_proxies: u32,
}

impl SerializerMultiplexer {
    /// Assembles opened serializers into one store, verifying that they
    /// all came from the same format run and sit in their original
    /// positions.
    pub fn new(files: Vec<Arc<FileSerializer>>) -> Result<Self> {
        let first = files
            .first()
            .ok_or_else(|| Error::config("multiplexer requires at least one serializer"))?;
        let expected = *first.header();
        if expected.n_files as usize != files.len() {
            return Err(Error::config(format!(
                "store was formatted over {} files but opened with {}",
                expected.n_files,
                files.len(),
            )));
        }
        for (i, file) in files.iter().enumerate() {
            let header = file.header();
            if header.creation_timestamp != expected.creation_timestamp
                || header.n_files != expected.n_files
                || header.n_proxies != expected.n_proxies
            {
                return Err(Error::config(format!(
                    "{} does not belong to this store",
                    file.path().display(),
                )));
            }
            if header.file_index != i as u32 {
                return Err(Error::config(format!(
                    "{} opened at position {} but was formatted at position {}",
                    file.path().display(),
                    i,
                    header.file_index,
                )));
            }
        }
        Ok(Self {
            n_proxies: expected.n_proxies,
            files,
        })
    }

    pub fn n_proxies(&self) -> u32 {
        self.n_proxies
    }

    /// One proxy per slice, in slice order.
    pub fn proxies(&self) -> Vec<ProxySerializer> {
        (0..self.n_proxies)
            .map(|proxy_id| ProxySerializer {
                file: self.files[proxy_id as usize % self.files.len()].clone(),
                proxy_id,
            })
            .collect()
    }

    /// Dissolves the multiplexer, handing the files back for close.
    pub fn into_files(self) -> Vec<Arc<FileSerializer>> {
        self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn format_files(dir: &Path, n_files: u32, n_proxies: u32) -> Vec<Arc<FileSerializer>> {
        (0..n_files)
            .map(|i| {
                let path = dir.join(format!("data_{i}"));
                Arc::new(FileSerializer::create(&path, 42, i, n_files, n_proxies).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = SerializerHeader {
            magic: SERIALIZER_MAGIC,
            version: SERIALIZER_VERSION,
            creation_timestamp: 1_700_000_000_123,
            file_index: 2,
            n_files: 4,
            n_proxies: 9,
            body_checksum: 0xdead_beef,
        };
        let parsed = SerializerHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = SerializerHeader {
            magic: SERIALIZER_MAGIC,
            version: SERIALIZER_VERSION,
            creation_timestamp: 1,
            file_index: 0,
            n_files: 1,
            n_proxies: 1,
            body_checksum: 0,
        }
        .to_bytes();
        bytes[0] ^= 0xff;
        assert!(SerializerHeader::from_bytes(&bytes).is_none());
        assert!(SerializerHeader::from_bytes(&bytes[..10]).is_none());
    }

    #[test]
    fn test_create_then_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_0");
        let created = FileSerializer::create(&path, 99, 0, 1, 3).unwrap();
        created.save_slot(1, b"slice one".to_vec()).unwrap();
        created.save_slot(2, b"slice two".to_vec()).unwrap();

        let opened = FileSerializer::open(&path).unwrap();
        assert_eq!(opened.header().creation_timestamp, 99);
        assert_eq!(opened.header().n_proxies, 3);
        assert_eq!(opened.load_slot(1), Some(b"slice one".to_vec()));
        assert_eq!(opened.load_slot(2), Some(b"slice two".to_vec()));
        assert_eq!(opened.load_slot(0), None);
    }

    #[test]
    fn test_save_slot_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_0");
        let file = FileSerializer::create(&path, 1, 0, 1, 1).unwrap();
        file.save_slot(0, b"v1".to_vec()).unwrap();
        file.save_slot(0, b"v2".to_vec()).unwrap();
        assert_eq!(file.load_slot(0), Some(b"v2".to_vec()));

        let opened = FileSerializer::open(&path).unwrap();
        assert_eq!(opened.load_slot(0), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_check_accepts_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_0");
        FileSerializer::create(&path, 5, 0, 1, 2).unwrap();
        assert!(FileSerializer::check(&path));
    }

    #[test]
    fn test_check_rejects_missing_and_garbage() {
        let dir = tempdir().unwrap();
        assert!(!FileSerializer::check(&dir.path().join("absent")));

        let garbage = dir.path().join("garbage");
        fs::write(&garbage, b"not a store file at all").unwrap();
        assert!(!FileSerializer::check(&garbage));

        let short = dir.path().join("short");
        fs::write(&short, b"tiny").unwrap();
        assert!(!FileSerializer::check(&short));
    }

    #[test]
    fn test_open_detects_body_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_0");
        let file = FileSerializer::create(&path, 5, 0, 1, 1).unwrap();
        file.save_slot(0, b"payload".to_vec()).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let err = FileSerializer::open(&path).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)), "got {err:?}");
    }

    #[test]
    fn test_multiplexer_stripes_proxies_over_files() {
        let dir = tempdir().unwrap();
        let files = format_files(dir.path(), 2, 5);
        let mux = SerializerMultiplexer::new(files).unwrap();
        assert_eq!(mux.n_proxies(), 5);

        let proxies = mux.proxies();
        assert_eq!(proxies.len(), 5);
        for (i, proxy) in proxies.iter().enumerate() {
            assert_eq!(proxy.proxy_id(), i as u32);
        }

        // proxies 1 and 3 share file 1; their slots must not collide
        proxies[1].save(b"one".to_vec()).unwrap();
        proxies[3].save(b"three".to_vec()).unwrap();
        assert_eq!(proxies[1].load(), Some(b"one".to_vec()));
        assert_eq!(proxies[3].load(), Some(b"three".to_vec()));

        let files = mux.into_files();
        assert_eq!(files[1].load_slot(1), Some(b"one".to_vec()));
        assert_eq!(files[1].load_slot(3), Some(b"three".to_vec()));
        assert_eq!(files[0].load_slot(1), None);
    }

    #[test]
    fn test_multiplexer_rejects_mixed_stores() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let file_a = Arc::new(FileSerializer::create(&a, 10, 0, 2, 3).unwrap());
        let file_b = Arc::new(FileSerializer::create(&b, 11, 1, 2, 3).unwrap());
        let err = SerializerMultiplexer::new(vec![file_a, file_b]).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_multiplexer_rejects_wrong_file_count() {
        let dir = tempdir().unwrap();
        let files = format_files(dir.path(), 2, 3);
        let only_first = vec![files[0].clone()];
        let err = SerializerMultiplexer::new(only_first).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_multiplexer_rejects_reordered_files() {
        let dir = tempdir().unwrap();
        let mut files = format_files(dir.path(), 2, 3);
        files.swap(0, 1);
        let err = SerializerMultiplexer::new(files).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }
}
