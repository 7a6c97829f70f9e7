//! Single-shot file transfer and metadata handlers.

use std::fs::{self, File, Metadata, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tempfile::Builder;
use tracing::{debug, info};
use vrpc_protocol::{RpcFault, sha256_hex};

use super::{HANDLER_TARGET, parse_mode};
use crate::server::RequestContext;
use crate::transfer::{DEFAULT_UPLOAD_MODE, decode_content};

/// Regular files at least this large are reported without a digest.
pub const INFO_HASH_LIMIT: u64 = 100 * 1024 * 1024;

/// Writes `{path, content, mode?, overwrite?}` atomically.
///
/// # Errors
///
/// Returns `2003` for missing fields, `2001` for bad base64 or mode, and
/// `4001` when policy rejects the path, the file exists without
/// `overwrite`, or the write fails.
pub fn upload(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let raw_path = params.required_string("path")?;
    let content = params
        .string("content")?
        .ok_or_else(|| RpcFault::missing_required("content"))?;
    let mode = parse_mode(params.string("mode")?.unwrap_or(DEFAULT_UPLOAD_MODE))?;
    let overwrite = params.boolean("overwrite")?.unwrap_or(true);

    let path = ctx.policy.paths.resolve(raw_path)?;
    if path.exists() && !overwrite {
        return Err(RpcFault::permission_denied(format!(
            "File already exists: {raw_path}"
        )));
    }
    let bytes = decode_content(content)?;
    write_atomically(&path, &bytes, mode, overwrite)
        .map_err(|error| RpcFault::permission_denied(format!("Failed to write file: {error}")))?;
    info!(target: HANDLER_TARGET, path = %path, size = bytes.len(), "file uploaded");
    Ok(json!({
        "path": path,
        "size": bytes.len(),
        "sha256": sha256_hex(&bytes),
    }))
}

fn write_atomically(path: &Utf8Path, bytes: &[u8], mode: u32, overwrite: bool) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Utf8Path::new("/"));
    fs::create_dir_all(dir)?;
    let mut staging = Builder::new().prefix(".vrpc-write-").tempfile_in(dir)?;
    staging.write_all(bytes)?;
    staging.as_file().set_permissions(Permissions::from_mode(mode))?;
    staging.as_file().sync_all()?;
    let persisted = if overwrite {
        staging.persist(path)
    } else {
        staging.persist_noclobber(path)
    };
    persisted.map(drop).map_err(|error| error.error)
}

/// Reads `{path, offset?, length?}` in one reply.
///
/// An offset beyond the end yields empty content.
///
/// # Errors
///
/// Returns `2003` without a path, `4001` when policy rejects it or reading
/// fails, `3002` when it does not exist, and `2001` when it is not a
/// regular file.
pub fn download(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let params = ctx.params();
    let raw_path = params.required_string("path")?;
    let offset = params.unsigned("offset")?.unwrap_or(0);
    let length = params.unsigned("length")?.filter(|length| *length > 0);

    let path = ctx.policy.paths.resolve(raw_path)?;
    if !path.exists() {
        return Err(RpcFault::file_not_found(raw_path));
    }
    if !path.is_file() {
        return Err(RpcFault::invalid_params(format!("Not a file: {raw_path}")));
    }
    let read_error =
        |error: io::Error| RpcFault::permission_denied(format!("Failed to read file: {error}"));
    let mut file = File::open(&path).map_err(read_error)?;
    let total_size = file.metadata().map_err(read_error)?.len();
    file.seek(SeekFrom::Start(offset)).map_err(read_error)?;
    let mut content = Vec::new();
    file.take(length.unwrap_or(u64::MAX))
        .read_to_end(&mut content)
        .map_err(read_error)?;
    Ok(json!({
        "path": path,
        "content": STANDARD.encode(&content),
        "size": content.len(),
        "total_size": total_size,
        "offset": offset,
        "sha256": sha256_hex(&content),
    }))
}

/// Describes `path` from the query string or body.
///
/// Paths rejected by policy and missing paths both report
/// `exists: false` rather than a fault.
///
/// # Errors
///
/// Returns `2003` without a path and `4001` when the file cannot be
/// inspected.
pub fn info(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let raw_path = ctx.params().required_string("path")?;
    let Ok(path) = ctx.policy.paths.resolve(raw_path) else {
        return Ok(json!({"path": raw_path, "exists": false}));
    };
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Ok(json!({"path": path, "exists": false}));
        }
        Err(error) => {
            return Err(RpcFault::permission_denied(format!(
                "Failed to stat file: {error}"
            )));
        }
    };
    let kind = file_type(&metadata);
    let mut reply = json!({
        "path": path,
        "exists": true,
        "type": kind,
        "size": metadata.len(),
        "mode": format!("{:04o}", metadata.mode() & 0o777),
        "uid": metadata.uid(),
        "gid": metadata.gid(),
        "mtime": metadata.mtime(),
        "atime": metadata.atime(),
        "ctime": metadata.ctime(),
    });
    if kind == "file" && metadata.len() < INFO_HASH_LIMIT {
        match hash_file(&path) {
            Ok(digest) => {
                if let Some(fields) = reply.as_object_mut() {
                    fields.insert("sha256".to_owned(), Value::String(digest));
                }
            }
            Err(error) => debug!(target: HANDLER_TARGET, path = %path, %error, "digest skipped"),
        }
    }
    Ok(reply)
}

fn file_type(metadata: &Metadata) -> &'static str {
    let kind = metadata.file_type();
    if kind.is_symlink() {
        "symlink"
    } else if kind.is_file() {
        "file"
    } else if kind.is_dir() {
        "directory"
    } else {
        "other"
    }
}

fn hash_file(path: &Utf8Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
