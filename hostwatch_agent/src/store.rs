//! Durable tag store: named byte blobs under a root directory, replaced atomically.
//!
//! Layout under the root:
//!   <root>/<tag>                      committed blobs
//!   <root>/.hostwatch-XXXXXX/         private working dir of this process run
//!   <root>/.hostwatch-XXXXXX/<tag>-*/ per-tag scratch dirs holding temp files
//!
//! Scratch files live on the same filesystem as the final paths, so the
//! closing rename is all-or-nothing and readers never see a partial blob.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tempfile::{Builder, NamedTempFile, TempDir};
use thiserror::Error;
use tracing::{debug, Span};

/// Reserved tag naming the store's own scope; never usable as a data tag.
pub const ROOT_TAG: &str = "hostwatch";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tag store is not prepared")]
    NotReady,
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("tag {0:?} not found")]
    NotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Narrow persistence capability: load/save a named blob.
pub trait BlobStore: Send + Sync {
    fn save(&self, tag: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn load(&self, tag: &str) -> Result<Vec<u8>, StoreError>;
}

struct Workspace {
    dir: TempDir,
    // tag -> lazily created scratch dir
    scratch: HashMap<String, TempDir>,
}

pub struct TagStore {
    root: PathBuf,
    work: Mutex<Option<Workspace>>,
    span: Span,
}

impl TagStore {
    pub fn new(root: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            root: root.into(),
            work: Mutex::new(None),
            span,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Private working directory of this run, if prepared.
    pub fn work_dir(&self) -> Option<PathBuf> {
        self.workspace().as_ref().map(|w| w.dir.path().to_path_buf())
    }

    /// Ensure the root exists and create a fresh private working directory.
    pub fn prepare(&self) -> Result<(), StoreError> {
        let _enter = self.span.enter();

        // create_dir_all treats an existing directory as success
        fs::create_dir_all(&self.root).map_err(|e| {
            StoreError::io(format!("can't create root {}", self.root.display()), e)
        })?;

        let dir = Builder::new()
            .prefix(&format!(".{ROOT_TAG}-"))
            .tempdir_in(&self.root)
            .map_err(|e| StoreError::io("can't create working dir", e))?;
        debug!(work_dir = %dir.path().display(), "tag store prepared");

        *self.workspace() = Some(Workspace {
            dir,
            scratch: HashMap::new(),
        });
        Ok(())
    }

    /// Write `bytes` to a temp file in the tag's scratch dir without publishing it.
    pub fn stage(&self, tag: &str, bytes: &[u8]) -> Result<StagedBlob, StoreError> {
        validate_tag(tag)?;
        let scratch = self.scratch_dir(tag)?;

        let mut file = NamedTempFile::new_in(&scratch)
            .map_err(|e| StoreError::io(format!("can't create temp file for {tag:?}"), e))?;
        file.write_all(bytes)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| StoreError::io(format!("can't write temp file for {tag:?}"), e))?;

        Ok(StagedBlob {
            file,
            dest: self.root.join(tag),
            tag: tag.to_owned(),
        })
    }

    /// Remove the private working directory; committed blobs stay in the root.
    pub fn clean(&self) -> Result<(), StoreError> {
        let _enter = self.span.enter();
        let work = self.workspace().take().ok_or(StoreError::NotReady)?;
        let path = work.dir.path().to_path_buf();

        drop(work.scratch);
        work.dir
            .close()
            .map_err(|e| StoreError::io(format!("can't remove {}", path.display()), e))?;
        debug!(work_dir = %path.display(), "tag store cleaned");
        Ok(())
    }

    fn workspace(&self) -> MutexGuard<'_, Option<Workspace>> {
        // the map stays consistent even if a holder panicked
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scratch_dir(&self, tag: &str) -> Result<PathBuf, StoreError> {
        let mut guard = self.workspace();
        let work = guard.as_mut().ok_or(StoreError::NotReady)?;

        if let Some(dir) = work.scratch.get(tag) {
            return Ok(dir.path().to_path_buf());
        }

        let dir = Builder::new()
            .prefix(&format!("{tag}-"))
            .tempdir_in(work.dir.path())
            .map_err(|e| StoreError::io(format!("can't create scratch dir for {tag:?}"), e))?;
        let path = dir.path().to_path_buf();
        work.scratch.insert(tag.to_owned(), dir);
        Ok(path)
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        match self.workspace().as_ref() {
            Some(_) => Ok(()),
            None => Err(StoreError::NotReady),
        }
    }
}

impl BlobStore for TagStore {
    fn save(&self, tag: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let _enter = self.span.enter();
        self.stage(tag, bytes)?.commit()?;
        debug!(tag, len = bytes.len(), "tag saved");
        Ok(())
    }

    fn load(&self, tag: &str) -> Result<Vec<u8>, StoreError> {
        validate_tag(tag)?;
        self.ensure_ready()?;

        let path = self.root.join(tag);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(tag.to_owned()))
            }
            Err(e) => Err(StoreError::io(format!("can't read {}", path.display()), e)),
        }
    }
}

/// A fully written, not yet visible blob. Dropping it discards the temp file.
pub struct StagedBlob {
    file: NamedTempFile,
    dest: PathBuf,
    tag: String,
}

impl StagedBlob {
    pub fn temp_path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically rename the temp file onto the tag's final path.
    pub fn commit(self) -> Result<(), StoreError> {
        let tag = self.tag;
        self.file
            .persist(&self.dest)
            .map_err(|e| StoreError::io(format!("can't move data file for {tag:?}"), e.error))?;
        sync_parent(&self.dest)
            .map_err(|e| StoreError::io(format!("can't sync root for {tag:?}"), e))?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::File::open(parent)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), StoreError> {
    let invalid = tag.is_empty()
        || tag == ROOT_TAG
        || tag.starts_with('.')
        || tag.contains(['/', '\\']);
    if invalid {
        return Err(StoreError::InvalidTag(tag.to_owned()));
    }
    Ok(())
}
