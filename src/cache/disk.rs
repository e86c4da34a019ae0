//! File-system cache store.
//!
//! Layout under the storage root:
//!
//! ```text
//! generations.json            ["name-a", "name-b"]   (creation order)
//! <sha256(name)>/
//!     <sha256(key)>.body      raw response body
//!     <sha256(key)>.json      EntryMeta
//! ```
//!
//! Files are written to a `.tmp` sibling and renamed into place. A file being
//! replaced is first hard-linked to a `.bak` sibling so a failed commit can put
//! it back. A single storage-wide `RwLock` serializes writers against readers,
//! so an entry is never observed half-written.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use super::{Cache, CacheError, CacheStorage, check_storable, snapshot};
use crate::http::{Headers, Method, Request, RequestKey, Response, StatusCode};

const INDEX_FILE: &str = "generations.json";

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    method: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    response_url: Option<String>,
    /// Insertion stamp; orders `keys()`.
    seq: u64,
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_stamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

async fn discard(paths: impl IntoIterator<Item = &PathBuf>) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}

// Renames every staged `(tmp, final)` pair into place, or none of them.
//
// On failure the completed renames are undone in reverse order, displaced
// files are restored from their backups and all temporary files are removed.
async fn commit(staged: &[(PathBuf, PathBuf)]) -> io::Result<()> {
    let mut done: Vec<(&Path, Option<PathBuf>)> = Vec::with_capacity(staged.len());
    let mut failure = None;

    for (tmp, path) in staged {
        let backup = backup_path(path);
        let _ = fs::remove_file(&backup).await;
        let displaced = match fs::hard_link(path, &backup).await {
            Ok(()) => Some(backup),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        if let Err(e) = fs::rename(tmp, path).await {
            if let Some(backup) = &displaced {
                let _ = fs::remove_file(backup).await;
            }
            failure = Some(e);
            break;
        }
        done.push((path.as_path(), displaced));
    }

    let Some(e) = failure else {
        discard(done.iter().filter_map(|(_, backup)| backup.as_ref()).collect::<Vec<_>>()).await;
        return Ok(());
    };

    for (path, backup) in done.into_iter().rev() {
        let restored = match &backup {
            Some(backup) => fs::rename(backup, path).await,
            None => fs::remove_file(path).await,
        };
        if let Err(undo) = restored {
            warn!(path = %path.display(), error = %undo, "failed to roll back cache write");
        }
    }
    discard(staged.iter().map(|(tmp, _)| tmp).collect::<Vec<_>>()).await;
    Err(e)
}

async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

// Maps a missing file to `None`.
async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_optional(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Handle onto one on-disk generation.
#[derive(Debug, Clone)]
pub struct DiskCache {
    name: Arc<str>,
    dir: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl DiskCache {
    fn entry_paths(&self, key: &RequestKey) -> (PathBuf, PathBuf) {
        let stem = digest(&key.to_string());
        (
            self.dir.join(format!("{stem}.json")),
            self.dir.join(format!("{stem}.body")),
        )
    }

    async fn ensure_exists(&self) -> Result<(), CacheError> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(self.gone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(self.gone()),
            Err(e) => Err(e.into()),
        }
    }

    fn gone(&self) -> CacheError {
        CacheError::GenerationGone {
            name: self.name.to_string(),
        }
    }

    // Caller holds the storage lock (read or write).
    async fn read_entry(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        if *request.method() != Method::Get {
            return Ok(None);
        }
        let (meta_path, body_path) = self.entry_paths(&request.key());
        let Some(raw) = read_optional(&meta_path).await? else {
            return Ok(None);
        };
        let meta: EntryMeta = serde_json::from_slice(&raw)?;
        let Some(body) = read_optional(&body_path).await? else {
            warn!(path = %meta_path.display(), "cache entry has metadata but no body");
            return Ok(None);
        };

        let status = StatusCode::from_u16(meta.status).ok_or_else(|| CacheError::InvalidEntry {
            path: meta_path.display().to_string(),
            reason: format!("status {}", meta.status),
        })?;
        let mut response = Response::new(status)
            .headers_from(meta.headers.into_iter().collect::<Headers>())
            .body_bytes(Bytes::from(body));
        if let Some(url) = meta.response_url.as_deref().and_then(|u| Url::parse(u).ok()) {
            response = response.with_url(url);
        }
        Ok(Some(response))
    }

    // Writes body and metadata to temporary files; returns (tmp, final) pairs
    // in the order they must be renamed.
    async fn stage_entry(
        &self,
        request: &Request,
        response: Response,
        seq: u64,
    ) -> Result<[(PathBuf, PathBuf); 2], CacheError> {
        let key = request.key();
        let (meta_path, body_path) = self.entry_paths(&key);
        let response = snapshot(response);
        let meta = EntryMeta {
            method: key.method().to_string(),
            url: key.url().to_string(),
            status: response.status().as_u16(),
            headers: response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            response_url: response.url().map(|u| u.to_string()),
            seq,
        };

        let meta_raw = serde_json::to_vec(&meta)?;
        let body_tmp = tmp_path(&body_path);
        if let Err(e) = fs::write(&body_tmp, response.bytes()).await {
            discard([&body_tmp]).await;
            return Err(e.into());
        }
        let meta_tmp = tmp_path(&meta_path);
        if let Err(e) = fs::write(&meta_tmp, meta_raw).await {
            discard([&body_tmp, &meta_tmp]).await;
            return Err(e.into());
        }

        Ok([(body_tmp, body_path), (meta_tmp, meta_path)])
    }
}

impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let _guard = self.lock.read().await;
        self.read_entry(request).await
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        check_storable(request, &response)?;
        let _guard = self.lock.write().await;
        self.ensure_exists().await?;
        let staged = self.stage_entry(request, response, now_stamp()).await?;
        commit(&staged).await?;
        debug!(generation = %self.name, url = %request.url(), "entry stored");
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        for (request, response) in &entries {
            check_storable(request, response)?;
        }
        // Later duplicates win, and each key must be staged exactly once.
        let mut unique: Vec<(Request, Response)> = Vec::with_capacity(entries.len());
        for (request, response) in entries {
            let key = request.key();
            unique.retain(|(r, _)| r.key() != key);
            unique.push((request, response));
        }

        let _guard = self.lock.write().await;
        self.ensure_exists().await?;

        let base = now_stamp();
        let mut staged = Vec::with_capacity(unique.len() * 2);
        for (i, (request, response)) in unique.into_iter().enumerate() {
            match self.stage_entry(&request, response, base + i as u64).await {
                Ok(pair) => staged.extend(pair),
                Err(e) => {
                    discard(staged.iter().map(|(tmp, _)| tmp).collect::<Vec<_>>()).await;
                    return Err(e);
                }
            }
        }
        commit(&staged).await?;
        debug!(generation = %self.name, entries = staged.len() / 2, "entries stored");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let _guard = self.lock.read().await;
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let meta: EntryMeta = serde_json::from_slice(&fs::read(&path).await?)?;
            metas.push(meta);
        }
        metas.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.url.cmp(&b.url)));

        let mut keys = Vec::with_capacity(metas.len());
        for meta in metas {
            match Url::parse(&meta.url) {
                Ok(url) => keys.push(RequestKey::new(Method::from_token(&meta.method), url)),
                Err(e) => warn!(url = %meta.url, error = %e, "skipping cache entry with bad url"),
            }
        }
        Ok(keys)
    }

    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        let _guard = self.lock.write().await;
        let (meta_path, body_path) = self.entry_paths(&request.key());
        let existed = remove_optional(&meta_path).await?;
        remove_optional(&body_path).await?;
        Ok(existed)
    }
}

/// Generations persisted under a root directory.
///
/// # Examples
///
/// ```rust,no_run
/// use offline_router::cache::{CacheStorage, DiskCacheStorage};
///
/// # async fn demo() -> Result<(), offline_router::cache::CacheError> {
/// let storage = DiskCacheStorage::open_root("/var/cache/offline-router").await?;
/// for name in storage.keys().await? {
///     println!("{name}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl DiskCacheStorage {
    /// Opens (creating if needed) a storage rooted at `root`.
    pub async fn open_root(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn handle(&self, name: &str) -> DiskCache {
        DiskCache {
            name: Arc::from(name),
            dir: self.root.join(digest(name)),
            lock: Arc::clone(&self.lock),
        }
    }

    async fn read_index(&self) -> Result<Vec<String>, CacheError> {
        match read_optional(&self.root.join(INDEX_FILE)).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, names: &[String]) -> Result<(), CacheError> {
        let raw = serde_json::to_vec_pretty(names)?;
        write_atomic(&self.root.join(INDEX_FILE), &raw).await?;
        Ok(())
    }
}

impl CacheStorage for DiskCacheStorage {
    type Cache = DiskCache;

    async fn open(&self, name: &str) -> Result<DiskCache, CacheError> {
        let _guard = self.lock.write().await;
        let cache = self.handle(name);
        let mut names = self.read_index().await?;
        fs::create_dir_all(&cache.dir).await?;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
            self.write_index(&names).await?;
            debug!(generation = %name, "generation created");
        }
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.lock.read().await;
        Ok(self.read_index().await?.iter().any(|n| n == name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let _guard = self.lock.read().await;
        self.read_index().await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.lock.write().await;
        let mut names = self.read_index().await?;
        let Some(pos) = names.iter().position(|n| n == name) else {
            return Ok(false);
        };
        names.remove(pos);
        self.write_index(&names).await?;

        let dir = self.handle(name).dir;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let _guard = self.lock.read().await;
        for name in self.read_index().await? {
            if let Some(response) = self.handle(&name).read_entry(request).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "offline-router-disk-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn req(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let root = scratch_dir();
        {
            let storage = DiskCacheStorage::open_root(&root).await.unwrap();
            let cache = storage.open("v3").await.unwrap();
            let res = Response::new(StatusCode::OK)
                .header("Content-Type", "application/json")
                .header("Connection", "keep-alive")
                .body(r#"{"status":"ok"}"#);
            cache.put(&req("https://x/api?q=1"), res).await.unwrap();
        }

        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["v3"]);
        let hit = storage
            .match_request(&req("https://x/api?q=1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.bytes().as_ref(), br#"{"status":"ok"}"#);
        assert_eq!(hit.headers().get("content-type"), Some("application/json"));
        assert!(!hit.headers().contains("connection"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn keys_in_insertion_order() {
        let root = scratch_dir();
        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        cache
            .put_all(vec![
                (req("https://x/"), Response::new(StatusCode::OK).body("root")),
                (req("https://x/index.html"), Response::new(StatusCode::OK).body("index")),
                (req("https://x/icon.png"), Response::new(StatusCode::OK).body("png")),
            ])
            .await
            .unwrap();

        let paths: Vec<_> = cache
            .keys()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.url().path().to_owned())
            .collect();
        assert_eq!(paths, vec!["/", "/index.html", "/icon.png"]);

        assert!(cache.delete(&req("https://x/icon.png")).await.unwrap());
        assert!(!cache.delete(&req("https://x/icon.png")).await.unwrap());
        assert_eq!(cache.keys().await.unwrap().len(), 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn deleted_generation_is_gone() {
        let root = scratch_dir();
        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        let old = storage.open("v2").await.unwrap();
        storage.open("v3").await.unwrap();
        old.put(&req("https://x/a"), Response::new(StatusCode::OK)).await.unwrap();

        assert!(storage.delete("v2").await.unwrap());
        assert!(!storage.delete("v2").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v3"]);
        assert!(old.match_request(&req("https://x/a")).await.unwrap().is_none());
        assert!(matches!(
            old.put(&req("https://x/b"), Response::new(StatusCode::OK)).await,
            Err(CacheError::GenerationGone { .. })
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn put_all_rejects_before_writing() {
        let root = scratch_dir();
        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        let post = Request::new(Method::Post, "https://x/api".parse().unwrap());
        let result = cache
            .put_all(vec![
                (req("https://x/a"), Response::new(StatusCode::OK)),
                (post, Response::new(StatusCode::OK)),
            ])
            .await;
        assert!(matches!(result, Err(CacheError::UnsupportedMethod { .. })));
        assert!(cache.keys().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp") || n.ends_with(".bak"))
            .collect()
    }

    #[tokio::test]
    async fn put_all_rolls_back_when_commit_fails() {
        let root = scratch_dir();
        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        cache
            .put(&req("https://x/a"), Response::new(StatusCode::OK).body("old"))
            .await
            .unwrap();

        // A directory squatting on b's metadata path makes its commit fail.
        let (b_meta, b_body) = cache.entry_paths(&req("https://x/b").key());
        std::fs::create_dir(&b_meta).unwrap();

        let result = cache
            .put_all(vec![
                (req("https://x/a"), Response::new(StatusCode::OK).body("A")),
                (req("https://x/b"), Response::new(StatusCode::OK).body("B")),
            ])
            .await;
        assert!(matches!(result, Err(CacheError::Io(_))));

        let a = cache.match_request(&req("https://x/a")).await.unwrap().unwrap();
        assert_eq!(a.bytes().as_ref(), b"old");
        assert!(!b_body.exists());
        assert!(leftovers(&cache.dir).is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn put_all_replaces_existing_entries() {
        let root = scratch_dir();
        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        cache
            .put(&req("https://x/a"), Response::new(StatusCode::OK).body("old"))
            .await
            .unwrap();
        cache
            .put_all(vec![(req("https://x/a"), Response::new(StatusCode::OK).body("new"))])
            .await
            .unwrap();

        let a = cache.match_request(&req("https://x/a")).await.unwrap().unwrap();
        assert_eq!(a.bytes().as_ref(), b"new");
        assert!(leftovers(&cache.dir).is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failed_put_leaves_no_temp_files() {
        let root = scratch_dir();
        let storage = DiskCacheStorage::open_root(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();

        // Blocks staging of the metadata file.
        let (meta, body) = cache.entry_paths(&req("https://x/a").key());
        std::fs::create_dir(tmp_path(&meta)).unwrap();
        let result = cache
            .put(&req("https://x/a"), Response::new(StatusCode::OK).body("A"))
            .await;
        assert!(matches!(result, Err(CacheError::Io(_))));
        assert!(!tmp_path(&body).exists());
        std::fs::remove_dir(tmp_path(&meta)).unwrap();

        // Blocks the commit of the metadata file.
        std::fs::create_dir(&meta).unwrap();
        let result = cache
            .put(&req("https://x/a"), Response::new(StatusCode::OK).body("A"))
            .await;
        assert!(matches!(result, Err(CacheError::Io(_))));
        assert!(!body.exists());
        assert!(leftovers(&cache.dir).is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }
}
