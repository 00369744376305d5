//! Media catalog model exchanged by media requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of media item. `All` is the union of photos and videos.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MediaType {
    Photo = 1,
    Video = 2,
    All = 3,
}

impl MediaType {
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Whether this type includes every kind in `other`
    pub fn contains(self, other: MediaType) -> bool {
        self.bits() & other.bits() == other.bits()
    }
}

/// Encoding of a media resource
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceFormat {
    Jpg = 0,
    Dng = 1,
    Mp4 = 2,
}

/// One downloadable file of a media item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaResource {
    pub uid: String,
    pub format: ResourceFormat,
    /// Size in bytes
    pub size: u64,
}

/// A photo or video stored on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub uid: String,
    pub name: String,
    /// Identifier of the flight run the media belongs to
    pub run_uid: String,
    pub creation_date: DateTime<Utc>,
    pub media_type: MediaType,
    pub resources: Vec<MediaResource>,
}

impl MediaItem {
    /// Combined size of all resources in bytes
    pub fn total_size(&self) -> u64 {
        self.resources.iter().map(|r| r.size).sum()
    }

    pub fn resource(&self, format: ResourceFormat) -> Option<&MediaResource> {
        self.resources.iter().find(|r| r.format == format)
    }
}
