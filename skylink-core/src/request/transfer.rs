//! Native transfer operations behind requests

use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::media::MediaItem;
use super::RequestReporter;
use crate::device::DeviceHandle;

/// Hook cancelling a native operation; invoked at most once
pub type CancelHook = Box<dyn FnOnce() + Send>;

/// Kind of transfer a request performs
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum TransferKind {
    ListMedia,
    DownloadThumbnail,
    DownloadMedia,
    DeleteMedia,
    UpdateFirmware,
    FtpUpload,
    DownloadCrashml,
    DownloadFlightLog,
}

/// FTP server targeted by an upload.
///
/// The integer values are shared with the native peer and must not change.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
#[repr(i32)]
pub enum FtpServerType {
    Media = 0,
    Update = 1,
    FlightPlan = 2,
}

/// Transfer protocols provided by a backend
///
/// Each operation starts the native work and returns immediately with a hook
/// that cancels it. The implementation reports through the given reporter
/// from any thread; reports made after cancellation are discarded.
///
/// Progress units: media download, crash report and flight log downloads
/// report percent (`u8`, 0..=100); firmware update and FTP upload report a
/// fraction (`f32`, 0.0..=1.0).
pub trait TransferBackend: Send + Sync {
    /// List the media stored on the device
    fn list_media(
        &self,
        handle: DeviceHandle,
        reporter: RequestReporter<Vec<MediaItem>, ()>,
    ) -> CancelHook;

    /// Fetch the thumbnail of a media item
    fn download_thumbnail(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        reporter: RequestReporter<Bytes, ()>,
    ) -> CancelHook;

    /// Download every resource of a media item into `destination`
    fn download_media(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        destination: &Path,
        reporter: RequestReporter<Vec<PathBuf>, u8>,
    ) -> CancelHook;

    /// Delete a media item from the device
    fn delete_media(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        reporter: RequestReporter<(), ()>,
    ) -> CancelHook;

    /// Upload and apply a firmware file
    fn update_firmware(
        &self,
        handle: DeviceHandle,
        firmware: &Path,
        reporter: RequestReporter<(), f32>,
    ) -> CancelHook;

    /// Upload a file to one of the device FTP servers
    fn ftp_upload(
        &self,
        handle: DeviceHandle,
        server: FtpServerType,
        source: &Path,
        destination: &str,
        reporter: RequestReporter<(), f32>,
    ) -> CancelHook;

    /// Download crash reports into `destination`; completes with the count
    fn download_crashml(
        &self,
        handle: DeviceHandle,
        destination: &Path,
        reporter: RequestReporter<usize, u8>,
    ) -> CancelHook;

    /// Download flight logs into `destination`; completes with the count
    fn download_flight_log(
        &self,
        handle: DeviceHandle,
        destination: &Path,
        reporter: RequestReporter<usize, u8>,
    ) -> CancelHook;
}
