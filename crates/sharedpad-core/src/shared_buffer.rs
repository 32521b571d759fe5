//! Shared document buffer: the transient segment a snapshot travels through
//! during one bootstrap handshake.
//!
//! The segment is a file named [`SEGMENT_NAME`] in a shared directory
//! (`/dev/shm` when present), memory-mapped by both sides. The payload is the
//! length-prefixed encoding of the markup string, and the file is sized to
//! exactly that. An advisory exclusive file lock guards every copy in or out
//! and is released as soon as the copy is done.
//!
//! Lifecycle:
//! - responder: `create_with` (Unattached -> AttachedWrite), then `detach`
//!   when released, which also removes the file
//! - requester: `attach` (Unattached -> AttachedRead), `read`, `detach`

use crate::envelope::{CodecError, decode_value, encode_value};
use fs2::FileExt;
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Logical name of the segment, shared by every instance.
pub const SEGMENT_NAME: &str = "SharedMemory";

#[derive(Debug, Error)]
pub enum SharedBufferError {
    #[error("Shared segment I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Shared segment already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Shared segment is not attached")]
    NotAttached,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, SharedBufferError>;

/// Directory segments live in when none is configured.
pub fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Attachment state of a [`SharedDocumentBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Unattached,
    AttachedRead,
    AttachedWrite,
}

enum Attachment {
    Unattached,
    Read { file: File, map: Mmap },
    Write { file: File, map: MmapMut },
}

/// Holds the exclusive lock for the duration of one copy.
struct CopyLock<'a>(&'a File);

impl<'a> CopyLock<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self> {
        FileExt::lock_exclusive(file).map_err(|source| io_error(path, source))?;
        Ok(Self(file))
    }
}

impl Drop for CopyLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.0) {
            warn!("Failed to unlock shared segment: {}", e);
        }
    }
}

fn io_error(path: &Path, source: io::Error) -> SharedBufferError {
    SharedBufferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One side's handle on the shared segment.
pub struct SharedDocumentBuffer {
    path: PathBuf,
    attachment: Attachment,
}

impl SharedDocumentBuffer {
    /// A handle for the segment in `dir`. Nothing is touched until attached.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SEGMENT_NAME),
            attachment: Attachment::Unattached,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> BufferState {
        match self.attachment {
            Attachment::Unattached => BufferState::Unattached,
            Attachment::Read { .. } => BufferState::AttachedRead,
            Attachment::Write { .. } => BufferState::AttachedWrite,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state() != BufferState::Unattached
    }

    /// Create the segment sized to `markup` and copy it in.
    ///
    /// Fails if this handle is attached or the segment already exists, e.g.
    /// left behind by a responder that never got released.
    pub fn create_with(&mut self, markup: &str) -> Result<()> {
        if self.is_attached() {
            return Err(SharedBufferError::AlreadyExists(self.path.clone()));
        }
        let payload = encode_value("shared segment", &markup.to_string())?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => SharedBufferError::AlreadyExists(self.path.clone()),
                _ => io_error(&self.path, source),
            })?;

        let map = match self.fill(&file, &payload) {
            Ok(map) => map,
            Err(e) => {
                // Don't leave a half-written segment for the next responder
                let _ = std::fs::remove_file(&self.path);
                return Err(e);
            }
        };

        debug!("Created shared segment {:?} ({} bytes)", self.path, payload.len());
        self.attachment = Attachment::Write { file, map };
        Ok(())
    }

    fn fill(&self, file: &File, payload: &[u8]) -> Result<MmapMut> {
        file.set_len(payload.len() as u64)
            .map_err(|source| io_error(&self.path, source))?;
        // SAFETY: the file was created exclusively by us above and sized to
        // the payload; peers only map it read-only under the copy lock.
        let mut map =
            unsafe { MmapMut::map_mut(file) }.map_err(|source| io_error(&self.path, source))?;

        let _lock = CopyLock::acquire(file, &self.path)?;
        map.copy_from_slice(payload);
        map.flush().map_err(|source| io_error(&self.path, source))?;
        Ok(map)
    }

    /// Attach to an existing segment for reading.
    pub fn attach(&mut self) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }
        let file = File::open(&self.path).map_err(|source| io_error(&self.path, source))?;
        // SAFETY: the segment is only written by its creator, before any
        // reader can learn of it, and every copy runs under the file lock.
        let map = unsafe { Mmap::map(&file) }.map_err(|source| io_error(&self.path, source))?;
        debug!("Attached to shared segment {:?} ({} bytes)", self.path, map.len());
        self.attachment = Attachment::Read { file, map };
        Ok(())
    }

    /// Copy the markup out of the segment.
    pub fn read(&self) -> Result<String> {
        let bytes = match &self.attachment {
            Attachment::Unattached => return Err(SharedBufferError::NotAttached),
            Attachment::Read { file, map } => {
                let _lock = CopyLock::acquire(file, &self.path)?;
                map.to_vec()
            }
            Attachment::Write { file, map } => {
                let _lock = CopyLock::acquire(file, &self.path)?;
                map.to_vec()
            }
        };
        Ok(decode_value("shared segment", &bytes)?)
    }

    /// Detach from the segment. Returns whether anything was attached.
    ///
    /// The creating side also removes the segment.
    pub fn detach(&mut self) -> bool {
        match std::mem::replace(&mut self.attachment, Attachment::Unattached) {
            Attachment::Unattached => false,
            Attachment::Read { .. } => {
                debug!("Detached reader from {:?}", self.path);
                true
            }
            Attachment::Write { file, map } => {
                drop(map);
                drop(file);
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to remove shared segment {:?}: {}", self.path, e);
                }
                debug!("Detached writer from {:?}", self.path);
                true
            }
        }
    }
}

impl Drop for SharedDocumentBuffer {
    fn drop(&mut self) {
        self.detach();
    }
}
