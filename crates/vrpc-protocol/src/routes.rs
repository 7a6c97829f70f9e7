//! Request paths served by the guest agent.

/// Liveness probe.
pub const PING: &str = "/api/v1/ping";
/// Static host description.
pub const SYSTEM_INFO: &str = "/api/v1/system/info";
/// Live resource usage.
pub const SYSTEM_STATUS: &str = "/api/v1/system/status";
/// Shell command execution.
pub const SHELL_EXEC: &str = "/api/v1/shell/exec";
/// Single-shot upload.
pub const FILE_UPLOAD: &str = "/api/v1/file/upload";
/// Single-shot download.
pub const FILE_DOWNLOAD: &str = "/api/v1/file/download";
/// File metadata.
pub const FILE_INFO: &str = "/api/v1/file/info";
/// Opens a chunked upload session.
pub const CHUNKED_UPLOAD_INIT: &str = "/api/v1/file/chunked/upload/init";
/// Appends one chunk to a session.
pub const CHUNKED_UPLOAD_CHUNK: &str = "/api/v1/file/chunked/upload/chunk";
/// Commits a session to its target path.
pub const CHUNKED_UPLOAD_FINISH: &str = "/api/v1/file/chunked/upload/finish";
/// Discards a session.
pub const CHUNKED_UPLOAD_ABORT: &str = "/api/v1/file/chunked/upload/abort";
/// Positional chunk download.
pub const CHUNKED_DOWNLOAD: &str = "/api/v1/file/chunked/download";
/// systemd unit control.
pub const SERVICE_CONTROL: &str = "/api/v1/service/control";
