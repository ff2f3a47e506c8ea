//! Input validation for operator-supplied session parameters
//!
//! Everything that ends up on a transcoder command line or in a file path
//! passes through here first, so a bad value is rejected before the camera is
//! contacted or a process is spawned.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::path::{Component, Path};
use std::sync::OnceLock;

/// Maximum length for URIs (UDP sinks, HTTP control endpoints)
pub const MAX_URI_LENGTH: usize = 2048;

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum length for a bare output file name (without extension)
pub const MAX_FILE_NAME_LENGTH: usize = 128;

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

fn file_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap_or_else(|_| unreachable!())
    })
}

/// Validate a bare file name used for a recording (no directories, no dots-only)
pub fn validate_file_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_FILE_NAME_LENGTH, field_name)?;

    if !file_name_pattern().is_match(name) {
        return Err(anyhow!(
            "{} may only contain letters, digits, '.', '_' and '-' (got '{}')",
            field_name,
            name
        ));
    }

    Ok(())
}

/// Validate a directory path without requiring it to exist
pub fn validate_dir(path: &Path, field_name: &str) -> Result<()> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("{} contains invalid UTF-8", field_name))?;

    validate_non_empty(path_str, field_name)?;
    validate_length(path_str, MAX_PATH_LENGTH, field_name)?;

    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(anyhow!(
            "{} contains '..' component (path traversal attempt)",
            field_name
        ));
    }

    Ok(())
}

/// Validate URI handed to the transcoder as an output sink
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r', ' '];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains whitespace or shell metacharacters",
            field_name
        ));
    }

    if !uri.contains("://") {
        return Err(anyhow!("{} must include a scheme (e.g. udp://)", field_name));
    }

    Ok(())
}

/// Validate port number (1-65535)
pub fn validate_port(port: u16, field_name: &str) -> Result<()> {
    if port == 0 {
        return Err(anyhow!("{} must be between 1 and 65535, got 0", field_name));
    }
    Ok(())
}
