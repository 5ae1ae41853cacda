//! Image records and their lifecycle.
//!
//! An [`Image`] is a plain value. The transition methods only mutate the
//! record; persisting the result is up to whoever drives the transfer.

use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Kvm,
    Container,
}

impl ImageType {
    pub const ALL: [ImageType; 2] = [ImageType::Kvm, ImageType::Container];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing image source")]
    MissingSource,
    #[error("missing image type")]
    MissingType,
    #[error("invalid image type `{0}`")]
    InvalidType(String),
}

impl FromStr for ImageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(ValidationError::MissingType),
            "kvm" => Ok(Self::Kvm),
            "container" => Ok(Self::Container),
            other => Err(ValidationError::InvalidType(other.into())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Downloading,
    Complete,
    Error,
}

impl ImageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ImageStatus,
    pub to: ImageStatus,
}

/// Metadata for a single guest image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub comment: String,
    pub status: ImageStatus,
    pub size: u64,
    pub expected_size: Option<u64>,
    pub download_start: Option<DateTime<Utc>>,
    pub download_end: Option<DateTime<Utc>>,
}

impl Image {
    /// Creates a new `Pending` record with a freshly assigned id.
    pub fn new(source: impl Into<String>, image_type: ImageType, comment: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            image_type,
            comment: comment.into(),
            status: ImageStatus::Pending,
            size: 0,
            expected_size: None,
            download_start: None,
            download_end: None,
        }
    }

    pub fn set_downloading(&mut self, expected_size: Option<u64>) -> Result<(), TransitionError> {
        self.check_transition(ImageStatus::Downloading)?;
        self.status = ImageStatus::Downloading;
        self.expected_size = expected_size;
        self.download_start = Some(Utc::now());
        Ok(())
    }

    /// Records the current number of persisted bytes. Last write wins.
    pub fn update_size(&mut self, size: u64) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to: self.status,
            });
        }
        self.size = size;
        Ok(())
    }

    /// Moves the record into its terminal state: `Error` when the transfer
    /// failed, `Complete` otherwise.
    pub fn set_finished(&mut self, failed: bool) -> Result<(), TransitionError> {
        let to = if failed {
            ImageStatus::Error
        } else {
            ImageStatus::Complete
        };
        self.check_transition(to)?;
        self.status = to;
        self.download_end = Some(Utc::now());
        Ok(())
    }

    fn check_transition(&self, to: ImageStatus) -> Result<(), TransitionError> {
        use ImageStatus::*;

        let allowed = matches!(
            (self.status, to),
            (Pending, Downloading) | (Pending | Downloading, Complete | Error)
        );
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }
}
