/// Maximum length of a stored file name in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum length of a receiver identity in bytes.
/// Hex-encoded it must leave room for a file name inside a payload key.
pub const MAX_IDENTITY_LENGTH: usize = 64;

/// Default upload limit (512MB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Buffer size for streaming payloads to and from disk (64KB)
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Number of identity characters used in a default display name
pub const DEFAULT_NAME_PREFIX_CHARS: usize = 4;

/// Fallback name for files whose name sanitizes to nothing
pub const UNKNOWN_FILE_NAME: &str = "unknown_file";

/// Registry document name inside the data directory
pub const REGISTRY_FILE: &str = "registry.json";

/// Payload directory name inside the data directory
pub const PAYLOAD_DIR: &str = "payloads";
