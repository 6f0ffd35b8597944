use super::constants::{
    DEFAULT_NAME_PREFIX_CHARS, MAX_FILENAME_LENGTH, MAX_IDENTITY_LENGTH, UNKNOWN_FILE_NAME,
};
use crate::error::BrokerError;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use uuid::Uuid;

/// Separates the encoded identity, nonce and file name inside a payload key
const KEY_SEPARATOR: char = '_';

const KEY_NONCE_LENGTH: usize = 8;

/// Windows device names that must never be used as file names
/// See: https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Characters Windows rejects in file names (`:` would also open an NTFS stream)
const FORBIDDEN_CHARS: [char; 7] = [':', '*', '?', '"', '<', '>', '|'];

pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Reject identities that cannot be stored or routed
pub fn validate_identity(identity: &str) -> Result<(), BrokerError> {
    if identity.trim().is_empty() {
        return Err(BrokerError::InvalidIdentity(
            "receiver id must not be empty".to_string(),
        ));
    }
    if identity.len() > MAX_IDENTITY_LENGTH {
        return Err(BrokerError::InvalidIdentity(format!(
            "receiver id too long ({} bytes, max {})",
            identity.len(),
            MAX_IDENTITY_LENGTH
        )));
    }
    if identity.chars().any(char::is_control) {
        return Err(BrokerError::InvalidIdentity(
            "receiver id must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Display name used when a receiver registers without one
pub fn default_display_name(identity: &str) -> String {
    let prefix: String = identity.chars().take(DEFAULT_NAME_PREFIX_CHARS).collect();
    format!("Receiver-{}", prefix)
}

/// Cut `s` to at most `max` bytes without splitting a character
fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cutoff = max;
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

/// Shorten `name` to at most `max` bytes, keeping a short extension
fn shorten_file_name(name: &mut String, max: usize) {
    if name.len() <= max {
        return;
    }
    match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx < 20 && name.len() - idx < max => {
            let ext = name[idx..].to_string();
            name.truncate(idx);
            truncate_at_boundary(name, max - ext.len());
            name.push_str(&ext);
        }
        _ => truncate_at_boundary(name, max),
    }
}

/// Reduce an uploaded file name to a single safe path component.
///
/// Directory parts (either separator style) are dropped, control characters
/// are removed, characters Windows forbids in file names become `_`, and names that would resolve to a directory or a Windows
/// device fall back to `unknown_file`. Over-long names are truncated,
/// keeping a short extension when there is one.
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let mut clean: String = last
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect();

    if clean.trim().is_empty()
        || clean == "."
        || clean == ".."
        || RESERVED_NAMES.iter().any(|r| clean.eq_ignore_ascii_case(r))
    {
        return UNKNOWN_FILE_NAME.to_string();
    }

    shorten_file_name(&mut clean, MAX_FILENAME_LENGTH);
    clean
}

fn encode_identity(identity: &str) -> String {
    identity.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_identity(encoded: &str) -> Option<String> {
    if encoded.is_empty() || encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Build the storage key for a payload: `<hex identity>_<nonce>_<file name>`.
///
/// `file_name` must already be sanitized. It is shortened further when the
/// whole key would not fit in a single path component.
pub fn make_payload_key(identity: &str, file_name: &str) -> String {
    let nonce = &Uuid::new_v4().simple().to_string()[..KEY_NONCE_LENGTH];
    let prefix = format!(
        "{}{sep}{}{sep}",
        encode_identity(identity),
        nonce,
        sep = KEY_SEPARATOR
    );
    let mut name = file_name.to_string();
    shorten_file_name(&mut name, MAX_FILENAME_LENGTH.saturating_sub(prefix.len()).max(1));
    prefix + &name
}

/// Recover the owning receiver identity from a payload key
pub fn payload_key_owner(key: &str) -> Option<String> {
    let (encoded, rest) = key.split_once(KEY_SEPARATOR)?;
    let (nonce, name) = rest.split_once(KEY_SEPARATOR)?;
    if nonce.is_empty() || name.is_empty() {
        return None;
    }
    decode_identity(encoded)
}

/// File name portion of a payload key
pub fn payload_key_file_name(key: &str) -> Option<&str> {
    let (_, rest) = key.split_once(KEY_SEPARATOR)?;
    let (_, name) = rest.split_once(KEY_SEPARATOR)?;
    Some(name).filter(|n| !n.is_empty())
}

/// Whether `key` names a single file inside the payload directory
pub fn is_safe_payload_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(['/', '\\'])
        && !key.chars().any(char::is_control)
        && payload_key_owner(key).is_some()
}

/// Create a new file with owner-only permissions (0o600 on Unix)
pub async fn create_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}
