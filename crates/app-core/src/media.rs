//! Upload validation for avatars and listing images
//!
//! Uploads themselves belong to the storage collaborator. This module only
//! rejects files the backend would refuse, before any bytes leave the client.

use app_state::mutation::ViewError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum image file size (5MB)
pub const MAX_IMAGE_SIZE: usize = 5 * 1024 * 1024;

/// Errors that can occur during media validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    /// Unsupported format
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// File too large
    #[error("File size {size} exceeds maximum {max}")]
    FileTooLarge {
        /// Actual file size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Zero-byte file
    #[error("File is empty")]
    Empty,
}

/// Result type for media operations
pub type Result<T> = std::result::Result<T, MediaError>;

impl From<MediaError> for ViewError {
    fn from(err: MediaError) -> Self {
        ViewError::validation(err.to_string())
    }
}

/// Supported image formats for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupportedFormat {
    /// JPEG format
    Jpeg,
    /// PNG format
    Png,
    /// WebP format
    Webp,
}

impl SupportedFormat {
    /// Get the MIME type for this format
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    /// Try to detect format from MIME type
    pub fn from_mime_type(mime_type: &str) -> Result<Self> {
        match mime_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Ok(Self::Jpeg),
            "image/png" => Ok(Self::Png),
            "image/webp" => Ok(Self::Webp),
            _ => Err(MediaError::UnsupportedFormat(mime_type.to_string())),
        }
    }
}

/// Limits applied to uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLimits {
    /// Largest accepted file in bytes
    pub max_bytes: usize,
    /// Accepted formats
    pub allowed_formats: Vec<SupportedFormat>,
}

impl UploadLimits {
    /// Limits for profile avatars
    pub fn avatar() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024,
            allowed_formats: vec![SupportedFormat::Jpeg, SupportedFormat::Png],
        }
    }

    /// Set the maximum size
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_IMAGE_SIZE,
            allowed_formats: vec![
                SupportedFormat::Jpeg,
                SupportedFormat::Png,
                SupportedFormat::Webp,
            ],
        }
    }
}

/// Validate an upload before any network call
///
/// # Examples
/// ```
/// use app_core::media::{validate_upload, SupportedFormat, UploadLimits};
///
/// let format = validate_upload("image/png", 120_000, &UploadLimits::default()).unwrap();
/// assert_eq!(format, SupportedFormat::Png);
/// ```
pub fn validate_upload(mime_type: &str, size: usize, limits: &UploadLimits) -> Result<SupportedFormat> {
    let format = SupportedFormat::from_mime_type(mime_type)?;
    if !limits.allowed_formats.contains(&format) {
        return Err(MediaError::UnsupportedFormat(mime_type.to_string()));
    }

    if size == 0 {
        return Err(MediaError::Empty);
    }
    if size > limits.max_bytes {
        return Err(MediaError::FileTooLarge {
            size,
            max: limits.max_bytes,
        });
    }

    Ok(format)
}
