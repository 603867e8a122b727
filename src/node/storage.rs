use std::{
    fs,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use hashbrown::HashMap;

use super::error::{Error, Result};

/// Named files on the node's persistent storage.
///
/// A handle is opened per use and closed by dropping it.
pub trait Storage {
    type Reader: Read + Seek;
    type Writer: Write;

    fn open_read(&self, name: &str) -> io::Result<Self::Reader>;

    /// Creates `name`, truncating whatever was there.
    fn create(&self, name: &str) -> io::Result<Self::Writer>;
}

/// Opens `name` and positions it at `offset`.
pub fn read_at<S: Storage>(storage: &S, name: &str, offset: u64) -> Result<S::Reader> {
    let mut reader = storage.open_read(name).map_err(|source| Error::Storage {
        name: name.to_string(),
        source,
    })?;
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::Storage {
            name: name.to_string(),
            source,
        })?;
    Ok(reader)
}

/// Reads `name` whole.
pub fn read_all<S: Storage>(storage: &S, name: &str) -> Result<Vec<u8>> {
    let mut reader = read_at(storage, name, 0)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|source| Error::Storage {
            name: name.to_string(),
            source,
        })?;
    Ok(bytes)
}

/// Writes `bytes` as the whole of `name`.
pub fn write_all<S: Storage>(storage: &S, name: &str, bytes: &[u8]) -> Result<()> {
    let wrap = |source| Error::Storage {
        name: name.to_string(),
        source,
    };
    let mut writer = storage.create(name).map_err(wrap)?;
    writer.write_all(bytes).map_err(wrap)?;
    writer.flush().map_err(wrap)
}

/// Files in one directory of the host filesystem.
#[derive(Clone, Debug)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Storage for DirStorage {
    type Reader = fs::File;
    type Writer = io::BufWriter<fs::File>;

    fn open_read(&self, name: &str) -> io::Result<Self::Reader> {
        fs::File::open(self.root.join(name))
    }

    fn create(&self, name: &str) -> io::Result<Self::Writer> {
        fs::File::create(self.root.join(name)).map(io::BufWriter::new)
    }
}

type Files = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// Files held in memory. Clones share the same files.
#[derive(Clone, Debug, Default)]
pub struct MemStorage {
    files: Files,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(name))
            .unwrap_or(false)
    }

    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.files.lock().ok()?.get(name).map(|f| f.len())
    }
}

impl Storage for MemStorage {
    type Reader = Cursor<Arc<[u8]>>;
    type Writer = MemWriter;

    fn open_read(&self, name: &str) -> io::Result<Self::Reader> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))?;
        files
            .get(name)
            .cloned()
            .map(Cursor::new)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn create(&self, name: &str) -> io::Result<Self::Writer> {
        let writer = MemWriter {
            name: name.to_string(),
            buf: Vec::new(),
            files: self.files.clone(),
        };
        writer.publish()?;
        Ok(writer)
    }
}

/// Write handle of a [`MemStorage`] file. Contents become visible to readers
/// on flush and when the handle is dropped.
pub struct MemWriter {
    name: String,
    buf: Vec<u8>,
    files: Files,
}

impl MemWriter {
    fn publish(&self) -> io::Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))?;
        files.insert(self.name.clone(), Arc::from(self.buf.as_slice()));
        Ok(())
    }
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.publish()
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        let _ = self.publish();
    }
}
