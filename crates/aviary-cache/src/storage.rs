//! Platform storage backends
//!
//! [`Storage`] is the narrow set of filesystem primitives the cache needs.
//! Backends return raw [`io::Error`]s; the policy for which errors matter
//! lives in [`FilesystemGateway`](crate::gateway::FilesystemGateway).

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use url::Url;

/// Suffix of files still being written
pub const PARTIAL_SUFFIX: &str = "part";

/// Size and modification time of a stored file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub modified: SystemTime,
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Full path of the entry
    pub path: PathBuf,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

/// Whether `path` is an in-progress write
pub fn is_partial(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PARTIAL_SUFFIX))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Incremental writer for streamed downloads
///
/// Nothing is visible at the final path until [`commit`](Self::commit).
#[async_trait]
pub trait StreamSink: Send {
    /// Append a chunk
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Flush and move the data to its final path; returns bytes written
    async fn commit(self: Box<Self>) -> io::Result<u64>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>);
}

/// Durable storage primitives
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stat a file; `Ok(None)` when it does not exist
    async fn stat(&self, path: &Path) -> io::Result<Option<FileStat>>;

    /// Create a directory and its parents
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Replace the contents of `path` with `data`
    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Append `data` to `path`, creating it if needed
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Read up to `len` bytes from the start of `path`
    async fn read_prefix(&self, path: &Path, len: usize) -> io::Result<Vec<u8>>;

    /// Read a whole file
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Remove a file
    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory tree
    async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// List the immediate children of a directory
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Open a streaming writer for `path`, if this backend supports one
    async fn open_sink(&self, path: &Path) -> io::Result<Option<Box<dyn StreamSink>>>;

    /// URI a media player can consume for `path`
    fn playable_uri(&self, path: &Path) -> String;
}

/// Local filesystem backend built on `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorage;

impl LocalStorage {
    /// Create a local filesystem backend
    pub fn new() -> Self {
        Self
    }
}

struct LocalSink {
    file: File,
    partial: PathBuf,
    target: PathBuf,
    written: u64,
}

#[async_trait]
impl StreamSink for LocalSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> io::Result<u64> {
        let finished = async {
            self.file.flush().await?;
            self.file.sync_all().await?;
            fs::rename(&self.partial, &self.target).await
        }
        .await;

        match finished {
            Ok(()) => Ok(self.written),
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn abort(self: Box<Self>) {
        let Self { file, partial, .. } = *self;
        drop(file);
        if let Err(e) = fs::remove_file(&partial).await
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove partial file {:?}: {}", partial, e);
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileStat {
                size_bytes: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        match fs::create_dir_all(path).await {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        }
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        // Write next to the target, then rename over it
        let partial = partial_path(path);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&partial)
                .await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&partial, path).await
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn read_prefix(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        let file = File::open(path).await?;
        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path).await
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            entries.push(DirEntry {
                path: entry.path(),
                is_dir,
            });
        }
        Ok(entries)
    }

    async fn open_sink(&self, path: &Path) -> io::Result<Option<Box<dyn StreamSink>>> {
        let partial = partial_path(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)
            .await?;
        Ok(Some(Box::new(LocalSink {
            file,
            partial,
            target: path.to_path_buf(),
            written: 0,
        })))
    }

    fn playable_uri(&self, path: &Path) -> String {
        Url::from_file_path(path).map_or_else(|()| path.display().to_string(), String::from)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Bytes,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<PathBuf, MemoryFile>,
    dirs: BTreeSet<PathBuf>,
}

/// In-process backend for hosts without durable storage and for tests
///
/// Has no streaming sink, so downloads take the buffered path.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file with an explicit modification time
    pub fn insert_with_mtime(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Bytes>,
        modified: SystemTime,
    ) {
        self.state.lock().files.insert(
            path.as_ref().to_path_buf(),
            MemoryFile {
                data: data.into(),
                modified,
            },
        );
    }

    /// Number of stored files
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    fn not_found(path: &Path) -> io::Error {
        io::Error::new(ErrorKind::NotFound, format!("{} not found", path.display()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        Ok(self.state.lock().files.get(path).map(|file| FileStat {
            size_bytes: file.data.len() as u64,
            modified: file.modified,
        }))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.insert_with_mtime(path, Bytes::copy_from_slice(data), SystemTime::now());
        Ok(())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        let entry = state.files.entry(path.to_path_buf()).or_insert_with(|| MemoryFile {
            data: Bytes::new(),
            modified: SystemTime::now(),
        });
        let mut combined = entry.data.to_vec();
        combined.extend_from_slice(data);
        entry.data = Bytes::from(combined);
        entry.modified = SystemTime::now();
        Ok(())
    }

    async fn read_prefix(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        let data = self.read(path).await?;
        Ok(data.into_iter().take(len).collect())
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(path)
            .map(|file| file.data.to_vec())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.state
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.files.retain(|p, _| !p.starts_with(path));
        state.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let state = self.state.lock();
        let mut children: BTreeMap<PathBuf, bool> = BTreeMap::new();

        let files = state.files.keys().map(|p| (p, false));
        let dirs = state.dirs.iter().map(|p| (p, true));
        for (candidate, candidate_is_dir) in files.chain(dirs) {
            let Ok(rest) = candidate.strip_prefix(path) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let is_dir = candidate_is_dir || components.next().is_some();
            let child = children.entry(path.join(first)).or_insert(is_dir);
            *child |= is_dir;
        }

        if children.is_empty() && !state.dirs.contains(path) {
            return Err(Self::not_found(path));
        }

        Ok(children
            .into_iter()
            .map(|(path, is_dir)| DirEntry { path, is_dir })
            .collect())
    }

    async fn open_sink(&self, _path: &Path) -> io::Result<Option<Box<dyn StreamSink>>> {
        Ok(None)
    }

    fn playable_uri(&self, path: &Path) -> String {
        format!("memory://{}", path.display())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_write_stat_and_remove() {
        let dir = TempDir::new().expect("Operation should succeed");
        let storage = LocalStorage::new();
        let path = dir.path().join("audio").join("a.mp3");

        assert_eq!(storage.stat(&path).await.expect("Operation should succeed"), None);

        storage
            .create_dir_all(path.parent().expect("Operation should succeed"))
            .await
            .expect("Operation should succeed");
        storage.write(&path, b"ID3hello").await.expect("Operation should succeed");

        let stat = storage.stat(&path).await.expect("Operation should succeed");
        assert_eq!(stat.map(|s| s.size_bytes), Some(8));
        assert!(!partial_path(&path).exists());

        let prefix = storage.read_prefix(&path, 3).await.expect("Operation should succeed");
        assert_eq!(prefix, b"ID3");

        storage.remove_file(&path).await.expect("Operation should succeed");
        assert_eq!(storage.stat(&path).await.expect("Operation should succeed"), None);
    }

    #[tokio::test]
    async fn test_local_sink_commit_and_abort() {
        let dir = TempDir::new().expect("Operation should succeed");
        let storage = LocalStorage::new();
        let committed = dir.path().join("committed.mp3");
        let aborted = dir.path().join("aborted.mp3");

        let mut sink = storage
            .open_sink(&committed)
            .await
            .expect("Operation should succeed")
            .expect("local storage streams");
        sink.write_chunk(b"abc").await.expect("Operation should succeed");
        assert!(!committed.exists());
        sink.write_chunk(b"def").await.expect("Operation should succeed");
        assert_eq!(sink.commit().await.expect("Operation should succeed"), 6);
        assert_eq!(std::fs::read(&committed).expect("Operation should succeed"), b"abcdef");

        let mut sink = storage
            .open_sink(&aborted)
            .await
            .expect("Operation should succeed")
            .expect("local storage streams");
        sink.write_chunk(b"partial").await.expect("Operation should succeed");
        sink.abort().await;
        assert!(!aborted.exists());
        assert!(!partial_path(&aborted).exists());
    }

    #[tokio::test]
    async fn test_local_append() {
        let dir = TempDir::new().expect("Operation should succeed");
        let storage = LocalStorage::new();
        let path = dir.path().join("repair.log");
        storage.append(&path, b"one\n").await.expect("Operation should succeed");
        storage.append(&path, b"two\n").await.expect("Operation should succeed");
        assert_eq!(storage.read(&path).await.expect("Operation should succeed"), b"one\ntwo\n");
    }

    #[test]
    fn test_partial_detection() {
        let path = Path::new("/cache/audio/abc.mp3");
        assert!(is_partial(&partial_path(path)));
        assert!(!is_partial(path));
    }

    #[tokio::test]
    async fn test_memory_read_dir_lists_immediate_children() {
        let storage = MemoryStorage::new();
        let root = Path::new("/cache");
        storage.write(&root.join("audio/a.mp3"), b"a").await.expect("Operation should succeed");
        storage.write(&root.join("audio/b.mp3"), b"b").await.expect("Operation should succeed");
        storage.write(&root.join("images/c.jpg"), b"c").await.expect("Operation should succeed");
        storage
            .create_dir_all(&root.join("logs"))
            .await
            .expect("Operation should succeed");

        let entries = storage.read_dir(root).await.expect("Operation should succeed");
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    path: root.join("audio"),
                    is_dir: true
                },
                DirEntry {
                    path: root.join("images"),
                    is_dir: true
                },
                DirEntry {
                    path: root.join("logs"),
                    is_dir: true
                },
            ]
        );

        let audio = storage
            .read_dir(&root.join("audio"))
            .await
            .expect("Operation should succeed");
        assert_eq!(audio.len(), 2);
        assert!(audio.iter().all(|e| !e.is_dir));

        let missing = storage.read_dir(&root.join("video")).await;
        assert_eq!(missing.map_err(|e| e.kind()), Err(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_memory_has_no_sink() {
        let storage = MemoryStorage::new();
        let sink = storage
            .open_sink(Path::new("/cache/a.mp3"))
            .await
            .expect("Operation should succeed");
        assert!(sink.is_none());
        assert_eq!(storage.playable_uri(Path::new("/cache/a.mp3")), "memory:///cache/a.mp3");
    }
}
