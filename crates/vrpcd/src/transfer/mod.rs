//! Chunked upload and positional download handlers.
//!
//! Uploads are stateful: `init` opens a session, `chunk` appends to it in
//! arrival order, and `finish` or `abort` destroys it. Downloads are
//! stateless; each call names the offset it wants.

mod sessions;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tracing::info;
use vrpc_protocol::{RpcFault, sha256_hex};

pub use sessions::{
    ChunkProgress, FinishedUpload, SESSION_IDLE_LIMIT, SessionError, UploadSessions, UploadTarget,
};

use crate::handlers::{parse_mode, percentage};
use crate::server::RequestContext;

/// Tracing target for transfer diagnostics.
pub(crate) const TRANSFER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transfer");

/// Largest slice returned by one download call.
pub const MAX_DOWNLOAD_SLICE: u64 = 5 * 1024 * 1024;

/// Mode applied to uploads that do not declare one.
pub const DEFAULT_UPLOAD_MODE: &str = "0644";

/// Opens an upload session for `{path, size, mode, overwrite}`.
///
/// # Errors
///
/// Returns `2003` without a path, `4001` when policy rejects the path or the
/// file exists and `overwrite` is false, and `2001` for a malformed mode.
pub fn upload_init(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let raw_path = params.required_string("path")?;
    let total_size = params.unsigned("size")?.unwrap_or(0);
    let mode = parse_mode(params.string("mode")?.unwrap_or(DEFAULT_UPLOAD_MODE))?;
    let overwrite = params.boolean("overwrite")?.unwrap_or(true);

    let path = ctx.policy.paths.resolve(raw_path)?;
    if path.exists() && !overwrite {
        return Err(RpcFault::permission_denied(format!(
            "File already exists: {raw_path}"
        )));
    }
    let session_id = ctx.sessions.create(UploadTarget {
        path: path.clone(),
        total_size,
        mode,
        overwrite,
    })?;
    Ok(json!({
        "session_id": session_id,
        "chunk_size": ctx.config.chunk_size(),
        "path": path,
    }))
}

/// Appends one base64 chunk to a session.
///
/// # Errors
///
/// Returns `2003` for missing fields, `2001` for an unknown session or
/// undecodable content, and `4001` when the staging file cannot be written.
pub fn upload_chunk(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let session_id = params.required_string("session_id")?;
    let chunk_index = params.unsigned("chunk_index")?.unwrap_or(0);
    let content = params
        .string("content")?
        .ok_or_else(|| RpcFault::missing_required("content"))?;
    let bytes = decode_content(content)?;
    let progress = ctx.sessions.append(session_id, &bytes)?;
    Ok(json!({
        "session_id": session_id,
        "chunk_index": chunk_index,
        "received_size": progress.received_size,
        "total_size": progress.total_size,
        "progress": percentage(progress.received_size, progress.total_size),
    }))
}

/// Verifies and commits a session.
///
/// # Errors
///
/// Returns `2001` for an unknown session or a digest mismatch (the session
/// is destroyed either way) and `4001` when the commit fails.
pub fn upload_finish(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let session_id = params.required_string("session_id")?;
    let expected = params.string("sha256")?.filter(|digest| !digest.is_empty());
    let finished = ctx.sessions.finish(session_id, expected)?;
    Ok(json!({
        "path": finished.path,
        "size": finished.size,
        "sha256": finished.sha256,
        "chunks_received": finished.chunks_received,
    }))
}

/// Discards a session. Unknown ids are not an error.
///
/// # Errors
///
/// Returns `2003` without a session id.
pub fn upload_abort(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let session_id = ctx.params().required_string("session_id")?;
    if ctx.sessions.abort(session_id) {
        Ok(json!({"message": "Upload session aborted", "session_id": session_id}))
    } else {
        info!(target: TRANSFER_TARGET, session_id, "abort for unknown session");
        Ok(json!({"message": "Session not found or already cleaned up"}))
    }
}

/// Returns one slice of a file starting at `offset`.
///
/// # Errors
///
/// Returns `2003` without a path, `4001` when policy rejects it, `3002` when
/// it does not exist, and `2001` when it is not a regular file or `offset`
/// lies beyond its end.
pub fn download(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let raw_path = params.required_string("path")?;
    let offset = params.unsigned("offset")?.unwrap_or(0);
    let requested = params
        .unsigned("size")?
        .unwrap_or_else(|| u64::try_from(ctx.config.chunk_size()).unwrap_or(MAX_DOWNLOAD_SLICE));

    let path = ctx.policy.paths.resolve(raw_path)?;
    if !path.exists() {
        return Err(RpcFault::file_not_found(raw_path));
    }
    if !path.is_file() {
        return Err(RpcFault::invalid_params(format!("Not a file: {raw_path}")));
    }
    let read_error = |error: std::io::Error| {
        RpcFault::permission_denied(format!("Failed to read file: {error}"))
    };
    let mut file = File::open(&path).map_err(read_error)?;
    let total_size = file.metadata().map_err(read_error)?.len();
    if offset > total_size {
        return Err(RpcFault::invalid_params(format!("Invalid offset: {offset}")));
    }
    let length = requested
        .min(MAX_DOWNLOAD_SLICE)
        .min(total_size.saturating_sub(offset));
    file.seek(SeekFrom::Start(offset)).map_err(read_error)?;
    let mut content = Vec::new();
    file.take(length)
        .read_to_end(&mut content)
        .map_err(read_error)?;

    let size = u64::try_from(content.len()).unwrap_or(u64::MAX);
    let end = offset.saturating_add(size);
    let has_more = end < total_size;
    Ok(json!({
        "path": path,
        "content": STANDARD.encode(&content),
        "offset": offset,
        "size": size,
        "total_size": total_size,
        "chunk_sha256": sha256_hex(&content),
        "has_more": has_more,
        "next_offset": has_more.then_some(end),
    }))
}

/// Decodes base64 request content.
pub(crate) fn decode_content(content: &str) -> Result<Vec<u8>, RpcFault> {
    STANDARD
        .decode(content)
        .map_err(|error| RpcFault::invalid_params(format!("Invalid base64 content: {error}")))
}
