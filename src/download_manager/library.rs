//! Dedup/organize stage and the canonical library index.
//!
//! The index holds one `CanonicalEntry` per file committed to the organized
//! tree, keyed by path with a secondary (artist, title) key for duplicate
//! candidate lookup. Commits serialize per destination path, so concurrent
//! workers targeting the same track produce exactly one library file.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::fetcher::MediaResult;
use super::models::{CanonicalEntry, OrganizeError};
use super::organizer;
use super::queue_store::JobQueueStore;

/// What to do when a fetched track's fingerprint is already in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Drop the fetched file and report the existing entry.
    #[default]
    Skip,
    /// Keep the fetched file in the duplicates area instead of dropping it.
    MoveToDuplicates,
}

impl DuplicatePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "skip" => Some(DuplicatePolicy::Skip),
            "move-to-duplicates" => Some(DuplicatePolicy::MoveToDuplicates),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicatePolicy::Skip => "skip",
            DuplicatePolicy::MoveToDuplicates => "move-to-duplicates",
        }
    }
}

/// Outcome of committing a fetched track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new canonical file was created at this path.
    Created(PathBuf),
    /// The track was already owned; the existing canonical path is returned.
    DuplicateSkipped(PathBuf),
    /// The track was already owned; the new file was kept in the duplicates
    /// area at this path.
    MovedToDuplicates(PathBuf),
}

impl CommitOutcome {
    /// The path a job should record as its result.
    pub fn result_path(&self) -> &Path {
        match self {
            CommitOutcome::Created(p) => p,
            CommitOutcome::DuplicateSkipped(p) => p,
            CommitOutcome::MovedToDuplicates(p) => p,
        }
    }
}

/// Summary of metadata-level duplicates in the canonical tree.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub duplicate_groups: usize,
    pub total_duplicates: usize,
}

/// Content fingerprint of an audio payload: sha256 over the staged bytes,
/// computed before any local tag/art mutation.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Normalized comparison key for artist/title matching.
pub fn normalize_key(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
struct IndexMaps {
    by_path: HashMap<String, CanonicalEntry>,
    by_key: HashMap<(String, String), Vec<String>>,
}

impl IndexMaps {
    fn insert(&mut self, entry: CanonicalEntry) {
        self.by_key
            .entry((entry.artist_key.clone(), entry.title_key.clone()))
            .or_default()
            .push(entry.path.clone());
        self.by_path.insert(entry.path.clone(), entry);
    }
}

/// The canonical library: read-mostly entry set plus per-destination-path
/// write locks.
pub struct LibraryIndex {
    store: Arc<dyn JobQueueStore>,
    root: PathBuf,
    duplicates_dir: PathBuf,
    policy: DuplicatePolicy,
    maps: RwLock<IndexMaps>,
    /// One lock per canonical destination path. Locking is scoped to the
    /// path, not the whole library, so unrelated writes stay concurrent.
    path_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LibraryIndex {
    pub fn new(
        store: Arc<dyn JobQueueStore>,
        root: PathBuf,
        duplicates_dir: PathBuf,
        policy: DuplicatePolicy,
    ) -> Result<Self> {
        let entries = store
            .load_canonical_entries()
            .context("Failed to load canonical library entries")?;
        let mut maps = IndexMaps::default();
        let count = entries.len();
        for entry in entries {
            maps.insert(entry);
        }
        info!("Loaded {} canonical library entries", count);

        Ok(Self {
            store,
            root,
            duplicates_dir,
            policy,
            maps: RwLock::new(maps),
            path_locks: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn entry_count(&self) -> usize {
        self.maps.read().unwrap().by_path.len()
    }

    pub fn entry_at(&self, path: &Path) -> Option<CanonicalEntry> {
        self.maps
            .read()
            .unwrap()
            .by_path
            .get(&path.to_string_lossy().to_string())
            .cloned()
    }

    /// Commit a fetched track into the canonical tree.
    ///
    /// Holds the destination-path lock across the duplicate check and the
    /// write, so at most one writer ever creates a given canonical path.
    pub async fn commit(&self, media: &MediaResult) -> Result<CommitOutcome, OrganizeError> {
        let meta = &media.metadata;
        let fingerprint = fingerprint_file(&media.audio_path)
            .map_err(|e| map_io_error(e, &media.audio_path))?;
        let artist_key = normalize_key(&meta.artist);
        let title_key = normalize_key(&meta.title);

        let base = organizer::canonical_path(&self.root, meta, &media.extension);
        let lock = self.path_lock(&base).await;
        let _guard = lock.lock().await;

        // Duplicate check under the lock: candidates are filtered by the
        // (artist, title) key, then compared by fingerprint.
        if let Some(existing) = self.find_duplicate(&artist_key, &title_key, &fingerprint) {
            return self.handle_duplicate(media, existing);
        }

        // Same path, different fingerprint: a different recording computed
        // the same canonical name. Never overwrite; disambiguate once.
        let dest = match self.entry_at(&base) {
            None => base.clone(),
            Some(_) => {
                let alt =
                    organizer::disambiguate(&base, meta.album_artist_or_artist(), &meta.album);
                match self.entry_at(&alt) {
                    None => alt,
                    Some(_) => return Err(OrganizeError::PathCollisionUnresolvable(alt)),
                }
            }
        };

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_io_error(e, parent))?;
        }
        move_file(&media.audio_path, &dest)?;

        if let Some(art) = &media.art {
            self.place_cover_art(&dest, art);
        }

        let entry = CanonicalEntry {
            path: dest.to_string_lossy().to_string(),
            fingerprint,
            artist_key,
            title_key,
            added_at: chrono::Utc::now().timestamp(),
        };
        self.store
            .insert_canonical_entry(&entry)
            .map_err(|e| OrganizeError::Storage(e.to_string()))?;
        self.maps.write().unwrap().insert(entry);

        info!("Committed {:?} to library", dest);
        Ok(CommitOutcome::Created(dest))
    }

    /// Metadata-level duplicate summary over the canonical tree, in the
    /// spirit of the duplicate scan the import tooling exposes.
    pub fn duplicate_report(&self) -> DuplicateReport {
        let maps = self.maps.read().unwrap();
        let mut duplicate_groups = 0;
        let mut total_duplicates = 0;
        for paths in maps.by_key.values() {
            if paths.len() > 1 {
                duplicate_groups += 1;
                total_duplicates += paths.len() - 1;
            }
        }
        DuplicateReport {
            duplicate_groups,
            total_duplicates,
        }
    }

    /// Re-seed the index from the files already on disk. Used when the
    /// database is fresh but the library tree is not.
    pub fn bootstrap_from_disk(&self) -> Result<usize> {
        const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "flac", "ogg", "wav"];

        let mut added = 0;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            if !extension.is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.as_str())) {
                continue;
            }
            let path_str = path.to_string_lossy().to_string();
            if self.maps.read().unwrap().by_path.contains_key(&path_str) {
                continue;
            }

            let fingerprint = match fingerprint_file(path) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!("Skipping unreadable file {:?}: {}", path, e);
                    continue;
                }
            };
            let (artist_key, title_key) = keys_from_path(&self.root, path);
            let entry = CanonicalEntry {
                path: path_str,
                fingerprint,
                artist_key,
                title_key,
                added_at: chrono::Utc::now().timestamp(),
            };
            self.store.insert_canonical_entry(&entry)?;
            self.maps.write().unwrap().insert(entry);
            added += 1;
        }

        if added > 0 {
            info!("Indexed {} existing library files", added);
        }
        Ok(added)
    }

    fn find_duplicate(
        &self,
        artist_key: &str,
        title_key: &str,
        fingerprint: &str,
    ) -> Option<PathBuf> {
        let maps = self.maps.read().unwrap();
        let paths = maps
            .by_key
            .get(&(artist_key.to_string(), title_key.to_string()))?;
        paths
            .iter()
            .find(|p| {
                maps.by_path
                    .get(*p)
                    .is_some_and(|e| e.fingerprint == fingerprint)
            })
            .map(PathBuf::from)
    }

    fn handle_duplicate(
        &self,
        media: &MediaResult,
        existing: PathBuf,
    ) -> Result<CommitOutcome, OrganizeError> {
        match self.policy {
            DuplicatePolicy::Skip => {
                debug!(
                    "Duplicate of {:?} skipped for {}",
                    existing, media.source_ref
                );
                media.discard();
                Ok(CommitOutcome::DuplicateSkipped(existing))
            }
            DuplicatePolicy::MoveToDuplicates => {
                std::fs::create_dir_all(&self.duplicates_dir)
                    .map_err(|e| map_io_error(e, &self.duplicates_dir))?;
                let name = format!(
                    "{} - {}.{}",
                    organizer::sanitize_segment(&media.metadata.artist),
                    organizer::sanitize_segment(&media.metadata.title),
                    media.extension
                );
                let dest = next_free_path(&self.duplicates_dir.join(name));
                move_file(&media.audio_path, &dest)?;
                info!("Duplicate of {:?} kept at {:?}", existing, dest);
                Ok(CommitOutcome::MovedToDuplicates(dest))
            }
        }
    }

    /// Drop `cover.jpg` beside the track when the album folder has none.
    fn place_cover_art(&self, track_path: &Path, art: &[u8]) {
        let Some(album_dir) = track_path.parent() else {
            return;
        };
        let cover = album_dir.join("cover.jpg");
        if cover.exists() {
            return;
        }
        if let Err(e) = std::fs::write(&cover, art) {
            warn!("Failed to write cover art {:?}: {}", cover, e);
        }
    }

    async fn path_lock(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(path.to_string_lossy().to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Derive comparison keys from a library-relative path: the first directory
/// is the artist, the file stem (minus a track-number prefix) is the title.
fn keys_from_path(root: &Path, path: &Path) -> (String, String) {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let artist = relative
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = match stem.split_once(" - ") {
        Some((_, rest)) => rest.to_string(),
        None => stem,
    };
    (normalize_key(&artist), normalize_key(&title))
}

/// Move a staged file into place. Falls back to copy + remove when rename
/// crosses filesystems; the copy goes through a `.part` name so a partial
/// file is never visible at the destination.
fn move_file(src: &Path, dest: &Path) -> Result<(), OrganizeError> {
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            let part_name = match dest.file_name().and_then(|n| n.to_str()) {
                Some(name) => format!("{}.part", name),
                None => return Err(OrganizeError::Storage(format!("bad destination {:?}", dest))),
            };
            let part = dest.with_file_name(part_name);
            std::fs::copy(src, &part).map_err(|e| {
                let _ = std::fs::remove_file(&part);
                map_io_error(e, dest)
            })?;
            std::fs::rename(&part, dest).map_err(|e| map_io_error(e, dest))?;
            let _ = std::fs::remove_file(src);
            Ok(())
        }
    }
}

fn next_free_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown");
    let ext = path.extension().and_then(|e| e.to_str());
    for n in 2.. {
        let name = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// ENOSPC as a raw OS error; `ErrorKind::StorageFull` is not yet stable
/// across the toolchains we build on.
const ENOSPC: i32 = 28;

fn map_io_error(e: std::io::Error, path: &Path) -> OrganizeError {
    if e.kind() == ErrorKind::PermissionDenied {
        OrganizeError::PermissionDenied(path.to_path_buf())
    } else if e.raw_os_error() == Some(ENOSPC) {
        OrganizeError::DiskFull(path.to_path_buf())
    } else {
        OrganizeError::Storage(e.to_string())
    }
}
