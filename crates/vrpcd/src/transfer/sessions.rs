//! Server-held state for chunked uploads.
//!
//! Each session owns a staging file created beside its target so the final
//! commit is a rename within one filesystem. Chunks are appended strictly in
//! arrival order; the caller-supplied index is informational only.

use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tempfile::{Builder, NamedTempFile};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vrpc_protocol::RpcFault;

use super::TRANSFER_TARGET;

/// Sessions untouched for this long are discarded on the next store access.
pub const SESSION_IDLE_LIMIT: Duration = Duration::from_secs(60 * 60);

const STAGING_PREFIX: &str = ".vrpc-upload-";

/// Failures raised by the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live session has the given id.
    #[error("Invalid session_id: {0}")]
    UnknownSession(String),
    /// The accumulated digest differs from the one the caller expected.
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Digest supplied by the caller.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },
    /// The staging file could not be created.
    #[error("Failed to create staging file in {dir}: {source}")]
    Staging {
        /// Directory that should hold the staging file.
        dir: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A chunk could not be written to the staging file.
    #[error("Failed to write chunk: {0}")]
    Write(#[source] io::Error),
    /// The staging file could not be moved into place.
    #[error("Failed to commit upload to {path}: {source}")]
    Commit {
        /// Target path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl From<SessionError> for RpcFault {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::UnknownSession(_) | SessionError::HashMismatch { .. } => {
                Self::invalid_params(error.to_string())
            }
            SessionError::Staging { .. } | SessionError::Write(_) | SessionError::Commit { .. } => {
                Self::permission_denied(error.to_string())
            }
        }
    }
}

/// Parameters fixed when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Final location of the uploaded file.
    pub path: Utf8PathBuf,
    /// Size announced by the client.
    pub total_size: u64,
    /// Permission bits applied on commit.
    pub mode: u32,
    /// Whether an existing file may be replaced on commit.
    pub overwrite: bool,
}

/// Progress reported after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Bytes received so far.
    pub received_size: u64,
    /// Size announced at init.
    pub total_size: u64,
    /// Chunks applied so far.
    pub chunks_received: u64,
}

/// Outcome of a committed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedUpload {
    /// Final path.
    pub path: Utf8PathBuf,
    /// Bytes written.
    pub size: u64,
    /// Hex digest of the content.
    pub sha256: String,
    /// Chunks applied.
    pub chunks_received: u64,
}

#[derive(Debug)]
struct UploadSession {
    target: UploadTarget,
    staging: NamedTempFile,
    hasher: Sha256,
    received_size: u64,
    chunks_received: u64,
    last_activity: Instant,
}

/// Arena of live upload sessions keyed by session id.
///
/// Owned by the single dispatch thread, so no locking is needed.
#[derive(Debug)]
pub struct UploadSessions {
    sessions: HashMap<String, UploadSession>,
    idle_limit: Duration,
}

impl Default for UploadSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadSessions {
    /// Creates an empty store using [`SESSION_IDLE_LIMIT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_limit(SESSION_IDLE_LIMIT)
    }

    /// Creates an empty store with a custom idle limit.
    #[must_use]
    pub fn with_idle_limit(idle_limit: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            idle_limit,
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Reports whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Reports whether `id` names a live session.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Opens a session and its staging file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Staging`] when the parent directory or the
    /// staging file cannot be created.
    pub fn create(&mut self, target: UploadTarget) -> Result<String, SessionError> {
        self.reap_idle();
        let dir = staging_dir(&target.path);
        let staging = fs::create_dir_all(&dir)
            .and_then(|()| Builder::new().prefix(STAGING_PREFIX).tempfile_in(&dir))
            .map_err(|source| SessionError::Staging {
                dir: dir.clone(),
                source,
            })?;
        let id = Uuid::new_v4().to_string();
        info!(
            target: TRANSFER_TARGET,
            session_id = %id,
            path = %target.path,
            total_size = target.total_size,
            "upload session created"
        );
        self.sessions.insert(
            id.clone(),
            UploadSession {
                target,
                staging,
                hasher: Sha256::new(),
                received_size: 0,
                chunks_received: 0,
                last_activity: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Appends `bytes` to the session's staging file.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] for unknown ids and
    /// [`SessionError::Write`] when the staging file rejects the bytes.
    pub fn append(&mut self, id: &str, bytes: &[u8]) -> Result<ChunkProgress, SessionError> {
        self.reap_idle();
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_owned()))?;
        session.staging.write_all(bytes).map_err(SessionError::Write)?;
        session.hasher.update(bytes);
        session.received_size = session.received_size.saturating_add(byte_len(bytes));
        session.chunks_received = session.chunks_received.saturating_add(1);
        session.last_activity = Instant::now();
        debug!(
            target: TRANSFER_TARGET,
            session_id = id,
            received = session.received_size,
            total = session.target.total_size,
            "chunk appended"
        );
        Ok(ChunkProgress {
            received_size: session.received_size,
            total_size: session.target.total_size,
            chunks_received: session.chunks_received,
        })
    }

    /// Verifies and commits a session, consuming it in every case.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] for unknown ids,
    /// [`SessionError::HashMismatch`] when `expected` differs from the
    /// received content, and [`SessionError::Commit`] when the staging file
    /// cannot be moved into place. The target is untouched on error.
    pub fn finish(
        &mut self,
        id: &str,
        expected: Option<&str>,
    ) -> Result<FinishedUpload, SessionError> {
        self.reap_idle();
        let mut session = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_owned()))?;
        let actual = hex::encode(session.hasher.finalize());
        if let Some(expected_digest) = expected.filter(|digest| !digest.eq_ignore_ascii_case(&actual)) {
            warn!(target: TRANSFER_TARGET, session_id = id, "upload digest mismatch");
            return Err(SessionError::HashMismatch {
                expected: expected_digest.to_owned(),
                actual,
            });
        }
        let path = session.target.path.clone();
        let commit_error = |source| SessionError::Commit {
            path: path.clone(),
            source,
        };
        session.staging.flush().map_err(commit_error)?;
        let persisted = if session.target.overwrite {
            session.staging.persist(&path)
        } else {
            session.staging.persist_noclobber(&path)
        };
        persisted.map_err(|error| commit_error(error.error))?;
        fs::set_permissions(&path, Permissions::from_mode(session.target.mode))
            .map_err(commit_error)?;
        info!(
            target: TRANSFER_TARGET,
            session_id = id,
            path = %path,
            size = session.received_size,
            "upload committed"
        );
        Ok(FinishedUpload {
            path,
            size: session.received_size,
            sha256: actual,
            chunks_received: session.chunks_received,
        })
    }

    /// Discards a session and its staging file.
    ///
    /// Returns `false` when no such session exists.
    pub fn abort(&mut self, id: &str) -> bool {
        self.reap_idle();
        let removed = self.sessions.remove(id).is_some();
        if removed {
            info!(target: TRANSFER_TARGET, session_id = id, "upload session aborted");
        }
        removed
    }

    fn reap_idle(&mut self) {
        let limit = self.idle_limit;
        self.sessions.retain(|id, session| {
            let idle = session.last_activity.elapsed();
            let keep = idle < limit;
            if !keep {
                warn!(
                    target: TRANSFER_TARGET,
                    session_id = %id,
                    idle_secs = idle.as_secs(),
                    "reaping idle upload session"
                );
            }
            keep
        });
    }
}

fn staging_dir(target: &Utf8Path) -> Utf8PathBuf {
    target
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map_or_else(|| Utf8PathBuf::from("/"), Utf8Path::to_path_buf)
}

fn byte_len(bytes: &[u8]) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use vrpc_protocol::sha256_hex;

    struct Scratch {
        dir: TempDir,
        sessions: UploadSessions,
    }

    impl Scratch {
        fn target(&self, name: &str, total_size: u64) -> UploadTarget {
            let path = Utf8PathBuf::from_path_buf(self.dir.path().join(name)).expect("utf-8 path");
            UploadTarget {
                path,
                total_size,
                mode: 0o640,
                overwrite: true,
            }
        }

        fn staging_files(&self) -> usize {
            fs::read_dir(self.dir.path())
                .expect("read dir")
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
                .count()
        }
    }

    #[fixture]
    fn scratch() -> Scratch {
        Scratch {
            dir: TempDir::new().expect("temp dir"),
            sessions: UploadSessions::new(),
        }
    }

    #[rstest]
    fn ordered_chunks_commit_with_matching_digest(scratch: Scratch) {
        let payload = b"hello chunked world";
        let target = scratch.target("nested/out.bin", 19);
        let mut sessions = scratch.sessions;
        let id = sessions.create(target.clone()).expect("create");
        for piece in payload.chunks(4) {
            sessions.append(&id, piece).expect("append");
        }
        let digest = sha256_hex(payload);
        let finished = sessions.finish(&id, Some(&digest)).expect("finish");

        assert_eq!(finished.size, 19);
        assert_eq!(finished.chunks_received, 5);
        assert_eq!(finished.sha256, digest);
        assert_eq!(fs::read(&target.path).expect("read"), payload);
        let mode = fs::metadata(&target.path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);
        assert!(sessions.is_empty());
    }

    #[rstest]
    fn wrong_digest_leaves_no_file(mut scratch: Scratch) {
        let target = scratch.target("out.bin", 3);
        let id = scratch.sessions.create(target.clone()).expect("create");
        scratch.sessions.append(&id, b"abc").expect("append");
        let error = scratch
            .sessions
            .finish(&id, Some("00"))
            .expect_err("mismatch");

        assert!(matches!(error, SessionError::HashMismatch { .. }));
        assert!(!target.path.exists());
        assert!(!scratch.sessions.contains(&id));
        assert_eq!(scratch.staging_files(), 0);
    }

    #[rstest]
    fn progress_tracks_received_bytes(mut scratch: Scratch) {
        let target = scratch.target("p.bin", 10);
        let id = scratch.sessions.create(target).expect("create");
        let progress = scratch.sessions.append(&id, b"12345").expect("append");
        assert_eq!(
            progress,
            ChunkProgress {
                received_size: 5,
                total_size: 10,
                chunks_received: 1
            }
        );
    }

    #[rstest]
    fn abort_is_idempotent(mut scratch: Scratch) {
        let target = scratch.target("a.bin", 1);
        let id = scratch.sessions.create(target).expect("create");
        assert_eq!(scratch.staging_files(), 1);
        assert!(scratch.sessions.abort(&id));
        assert!(!scratch.sessions.abort(&id));
        assert!(!scratch.sessions.abort("never-existed"));
        assert_eq!(scratch.staging_files(), 0);
    }

    #[rstest]
    fn unknown_sessions_are_rejected(mut scratch: Scratch) {
        let error = scratch.sessions.append("nope", b"x").expect_err("unknown");
        assert_eq!(RpcFault::from(error).message(), "Invalid session_id: nope");
    }

    #[rstest]
    fn finished_sessions_cannot_be_reused(mut scratch: Scratch) {
        let target = scratch.target("once.bin", 0);
        let id = scratch.sessions.create(target).expect("create");
        scratch.sessions.finish(&id, None).expect("finish");
        assert!(scratch.sessions.append(&id, b"late").is_err());
        assert!(scratch.sessions.finish(&id, None).is_err());
    }

    #[rstest]
    fn no_clobber_sessions_keep_existing_files(mut scratch: Scratch) {
        let mut target = scratch.target("keep.txt", 3);
        target.overwrite = false;
        fs::write(&target.path, b"old").expect("seed");
        let id = scratch.sessions.create(target.clone()).expect("create");
        scratch.sessions.append(&id, b"new").expect("append");
        let error = scratch.sessions.finish(&id, None).expect_err("exists");
        assert!(matches!(error, SessionError::Commit { .. }));
        assert_eq!(fs::read(&target.path).expect("read"), b"old");
    }

    #[test]
    fn idle_sessions_are_reaped_on_access() {
        let dir = TempDir::new().expect("temp dir");
        let mut sessions = UploadSessions::with_idle_limit(Duration::ZERO);
        let path = Utf8PathBuf::from_path_buf(dir.path().join("idle.bin")).expect("utf-8 path");
        let id = sessions
            .create(UploadTarget {
                path,
                total_size: 1,
                mode: 0o644,
                overwrite: true,
            })
            .expect("create");
        let error = sessions.append(&id, b"x").expect_err("reaped");
        assert!(matches!(error, SessionError::UnknownSession(_)));
        assert!(sessions.is_empty());
    }
}
