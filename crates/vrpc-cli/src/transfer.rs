//! Client-side drivers for file transfer.
//!
//! Uploads larger than one chunk go through the agent's session protocol:
//! `init`, one `chunk` per piece in file order, then `finish` carrying the
//! whole-file SHA-256. Any failure after `init` sends a best-effort `abort`.
//! Downloads are positional: the client follows `next_offset` until the
//! agent reports no more data, checking each slice digest and the final
//! size before moving the staged file into place.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, info, warn};
use vrpc_protocol::{Envelope, ErrorKind, RpcFault, routes, sha256_hex};
use vrpc_transport::Transport;

use crate::TRANSFER_TARGET;
use crate::client::{RpcClient, UploadOptions};

fn local_fault(path: &Path, error: &io::Error) -> RpcFault {
    if error.kind() == io::ErrorKind::NotFound {
        RpcFault::with_message(
            ErrorKind::FileNotFound,
            format!("Local file not found: {}", path.display()),
        )
    } else {
        RpcFault::internal(format!("Local file error for {}: {error}", path.display()))
    }
}

fn data_of(envelope: &Envelope) -> &Value {
    envelope.data.as_ref().unwrap_or(&Value::Null)
}

fn decode_content(data: &Value) -> Result<Vec<u8>, RpcFault> {
    let content = data.get("content").and_then(Value::as_str).unwrap_or_default();
    STANDARD.decode(content).map_err(|error| {
        RpcFault::with_message(
            ErrorKind::JsonParse,
            format!("Invalid base64 content in reply: {error}"),
        )
    })
}

fn staging_file(local: &Path) -> Result<NamedTempFile, RpcFault> {
    let dir = local
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|error| local_fault(dir, &error))?;
    Builder::new()
        .prefix(".vrpc-download-")
        .tempfile_in(dir)
        .map_err(|error| local_fault(dir, &error))
}

fn persist(staging: NamedTempFile, local: &Path) -> Result<(), RpcFault> {
    staging
        .as_file()
        .sync_all()
        .map_err(|error| local_fault(local, &error))?;
    staging
        .persist(local)
        .map(drop)
        .map_err(|error| local_fault(local, &error.error))
}

impl<T: Transport> RpcClient<T> {
    /// Uploads a local file in a single request.
    ///
    /// # Errors
    ///
    /// Returns `3002` when the local file is missing and the remote fault
    /// otherwise.
    pub fn upload_file(
        &mut self,
        local: &Path,
        remote: &str,
        options: &UploadOptions,
    ) -> Result<Envelope, RpcFault> {
        let bytes = fs::read(local).map_err(|error| local_fault(local, &error))?;
        let body = json!({
            "path": remote,
            "content": STANDARD.encode(&bytes),
            "mode": options.mode,
            "overwrite": options.overwrite,
        });
        self.call("POST", routes::FILE_UPLOAD, Some(&body), None)
    }

    /// Uploads a local file through an upload session.
    ///
    /// `progress` receives `(sent, total)` after each acknowledged chunk.
    ///
    /// # Errors
    ///
    /// Returns `3002` when the local file is missing, and the remote fault
    /// from any step. The session is aborted when a step after `init` fails.
    pub fn chunked_upload<P>(
        &mut self,
        local: &Path,
        remote: &str,
        options: &UploadOptions,
        mut progress: P,
    ) -> Result<Envelope, RpcFault>
    where
        P: FnMut(u64, u64),
    {
        let mut file = File::open(local).map_err(|error| local_fault(local, &error))?;
        let total = file
            .metadata()
            .map_err(|error| local_fault(local, &error))?
            .len();

        let init_body = json!({
            "path": remote,
            "size": total,
            "mode": options.mode,
            "overwrite": options.overwrite,
        });
        let init = self.call("POST", routes::CHUNKED_UPLOAD_INIT, Some(&init_body), None)?;
        let init_data = data_of(&init);
        let Some(session) = init_data.get("session_id").and_then(Value::as_str) else {
            return Err(RpcFault::internal("Failed to initialize upload session"));
        };
        let session_id = session.to_owned();
        let chunk_size = init_data
            .get("chunk_size")
            .and_then(Value::as_u64)
            .and_then(|size| usize::try_from(size).ok())
            .map_or(self.settings().piece_size(), |limit| {
                limit.clamp(1, self.settings().piece_size())
            });
        info!(
            target: TRANSFER_TARGET,
            session_id = session_id.as_str(),
            remote,
            total,
            chunk_size,
            "upload session opened"
        );

        match self.send_chunks(&session_id, &mut file, local, chunk_size, total, &mut progress) {
            Ok(digest) => {
                let finish_body = json!({"session_id": session_id, "sha256": digest});
                let finished =
                    self.call("POST", routes::CHUNKED_UPLOAD_FINISH, Some(&finish_body), None);
                if let Err(fault) = &finished {
                    warn!(
                        target: TRANSFER_TARGET,
                        session_id = session_id.as_str(),
                        %fault,
                        "upload rejected"
                    );
                }
                finished
            }
            Err(fault) => {
                self.abort_upload(&session_id);
                Err(fault)
            }
        }
    }

    fn send_chunks<P>(
        &mut self,
        session_id: &str,
        file: &mut File,
        local: &Path,
        chunk_size: usize,
        total: u64,
        progress: &mut P,
    ) -> Result<String, RpcFault>
    where
        P: FnMut(u64, u64),
    {
        let piece = u64::try_from(chunk_size).unwrap_or(u64::MAX);
        let mut hasher = Sha256::new();
        let mut sent = 0_u64;
        let mut chunk_index = 0_u64;
        loop {
            let mut chunk = Vec::with_capacity(chunk_size);
            Read::by_ref(file)
                .take(piece)
                .read_to_end(&mut chunk)
                .map_err(|error| local_fault(local, &error))?;
            if chunk.is_empty() {
                break;
            }
            hasher.update(&chunk);
            let body = json!({
                "session_id": session_id,
                "chunk_index": chunk_index,
                "content": STANDARD.encode(&chunk),
            });
            self.call("POST", routes::CHUNKED_UPLOAD_CHUNK, Some(&body), None)?;
            sent = sent.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
            chunk_index = chunk_index.saturating_add(1);
            debug!(target: TRANSFER_TARGET, session_id, chunk_index, sent, total, "chunk sent");
            progress(sent, total);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn abort_upload(&mut self, session_id: &str) {
        if !self.is_connected() {
            return;
        }
        let body = json!({"session_id": session_id});
        if let Err(fault) = self.call("POST", routes::CHUNKED_UPLOAD_ABORT, Some(&body), None) {
            warn!(target: TRANSFER_TARGET, session_id, %fault, "abort failed");
        }
    }

    /// Downloads a remote file by following `next_offset`.
    ///
    /// The file is staged beside `local` and moved into place only after
    /// the received size matches the size the agent reported. `progress`
    /// receives `(received, total)` after each slice.
    ///
    /// # Errors
    ///
    /// Returns the remote fault from any slice, `2002` for undecodable
    /// content, and `5001` when a slice digest or the final size does not
    /// match or the local file cannot be written.
    pub fn chunked_download<P>(
        &mut self,
        remote: &str,
        local: &Path,
        mut progress: P,
    ) -> Result<Envelope, RpcFault>
    where
        P: FnMut(u64, u64),
    {
        let mut staging = staging_file(local)?;
        let mut hasher = Sha256::new();
        let mut offset = 0_u64;
        let mut total = 0_u64;
        let chunk_size = self.settings().piece_size();
        loop {
            let body = json!({"path": remote, "offset": offset, "size": chunk_size});
            let envelope = self.call("POST", routes::CHUNKED_DOWNLOAD, Some(&body), None)?;
            let data = data_of(&envelope);
            let chunk = decode_content(data)?;
            let expected = data.get("chunk_sha256").and_then(Value::as_str);
            if expected.is_some_and(|digest| digest != sha256_hex(&chunk)) {
                return Err(RpcFault::internal(format!(
                    "Chunk hash mismatch at offset {offset}"
                )));
            }
            staging
                .write_all(&chunk)
                .map_err(|error| local_fault(local, &error))?;
            hasher.update(&chunk);
            total = data.get("total_size").and_then(Value::as_u64).unwrap_or(total);
            offset = offset.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
            progress(offset, total);

            let has_more = data.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            if !has_more {
                break;
            }
            if chunk.is_empty() {
                return Err(RpcFault::internal(format!(
                    "Download stalled at offset {offset}"
                )));
            }
            if let Some(next) = data.get("next_offset").and_then(Value::as_u64) {
                offset = next;
            }
        }

        if offset != total {
            return Err(RpcFault::internal(format!(
                "Size mismatch: expected {total}, got {offset}"
            )));
        }
        persist(staging, local)?;
        let digest = hex::encode(hasher.finalize());
        info!(target: TRANSFER_TARGET, remote, size = total, "download complete");
        Ok(Envelope::success(Some(json!({
            "path": local.display().to_string(),
            "size": total,
            "sha256": digest,
        }))))
    }

    /// Downloads a remote file, choosing the transfer strategy by size.
    ///
    /// Files no larger than one chunk are fetched in a single request; larger
    /// files use [`RpcClient::chunked_download`].
    ///
    /// # Errors
    ///
    /// Returns `3002` when the remote file does not exist and any fault from
    /// the chosen transfer.
    pub fn download_file(&mut self, remote: &str, local: &Path) -> Result<Envelope, RpcFault> {
        let info = self.file_info(remote)?;
        let info_data = data_of(&info);
        if !info_data.get("exists").and_then(Value::as_bool).unwrap_or(false) {
            return Err(RpcFault::with_message(
                ErrorKind::FileNotFound,
                format!("Remote file not found: {remote}"),
            ));
        }
        let size = info_data.get("size").and_then(Value::as_u64).unwrap_or(0);
        let limit = u64::try_from(self.settings().piece_size()).unwrap_or(u64::MAX);
        if size > limit {
            return self.chunked_download(remote, local, |_, _| {});
        }

        let body = json!({"path": remote});
        let envelope = self.call("POST", routes::FILE_DOWNLOAD, Some(&body), None)?;
        let bytes = decode_content(data_of(&envelope))?;
        let mut staging = staging_file(local)?;
        staging
            .write_all(&bytes)
            .map_err(|error| local_fault(local, &error))?;
        persist(staging, local)?;
        Ok(Envelope::success(Some(json!({
            "path": local.display().to_string(),
            "size": bytes.len(),
            "sha256": sha256_hex(&bytes),
        }))))
    }
}
