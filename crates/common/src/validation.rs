//! Validation of task specs and source references before they reach ffmpeg
//! or the filesystem, plus clock helpers that never panic.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for URIs (RTSP, HTTP, etc.)
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum length for display names
pub const MAX_NAME_LENGTH: usize = 512;

// ============================================================================
// Safe Time Operations
// ============================================================================

/// Get current Unix timestamp in milliseconds, safely handling clock errors
pub fn safe_unix_millis() -> u64 {
    u64::try_from(safe_unix_duration().as_millis()).unwrap_or(u64::MAX)
}

/// Duration since the UNIX epoch; zero (with a warning) if the clock is off
fn safe_unix_duration() -> Duration {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "System clock is before UNIX epoch (1970-01-01), using timestamp 0"
            );
            Duration::ZERO
        }
    }
}

// ============================================================================
// String Validation
// ============================================================================

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

/// Validate display name
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_NAME_LENGTH, field_name)?;
    Ok(())
}

/// Validate URI or device reference passed to a subprocess
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    // Prevent shell metacharacters (command injection)
    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    Ok(())
}

// ============================================================================
// Path Validation (Prevent Path Traversal)
// ============================================================================

/// Validate file path to prevent path traversal attacks
///
/// Ensures path:
/// - Exists and is accessible
/// - Is within allowed base directory (if specified)
/// - Doesn't exceed maximum length
pub fn validate_path(path: &Path, base_dir: Option<&Path>, field_name: &str) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("{} contains invalid UTF-8", field_name))?;

    validate_length(path_str, MAX_PATH_LENGTH, field_name)?;

    // Canonicalize to resolve ".." and symlinks
    let canonical = path
        .canonicalize()
        .with_context(|| format!("{} does not exist or is inaccessible", field_name))?;

    if let Some(base) = base_dir {
        let canonical_base = base
            .canonicalize()
            .with_context(|| format!("Base directory does not exist: {:?}", base))?;

        if !canonical.starts_with(&canonical_base) {
            return Err(anyhow!(
                "{} is outside allowed directory (path: {:?}, base: {:?})",
                field_name,
                canonical,
                canonical_base
            ));
        }
    }

    Ok(canonical)
}

/// Resolve a video file reference against the media root.
///
/// Relative references are joined onto `media_root`; absolute references are
/// accepted only when they already live under it. The file must exist.
pub fn resolve_media_path(source_ref: &str, media_root: &Path) -> Result<PathBuf> {
    validate_non_empty(source_ref, "source_ref")?;
    let candidate = Path::new(source_ref);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        media_root.join(candidate)
    };

    let resolved = validate_path(&joined, Some(media_root), "source_ref")?;
    if !resolved.is_file() {
        return Err(anyhow!("source_ref {:?} is not a regular file", resolved));
    }
    Ok(resolved)
}

// ============================================================================
// Numeric Validation
// ============================================================================

/// Validate value is within range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

/// Validate a probability-like threshold in `[0, 1]`; NaN is rejected
pub fn validate_unit_interval(value: f32, field_name: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(anyhow!("{} must be a finite number", field_name));
    }
    validate_range(value, 0.0, 1.0, field_name)
}

// ============================================================================
// Tests
// ============================================================================
