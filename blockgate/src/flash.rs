//! Copies raw images to and from an opened [`StorageDeviceFile`].
//!
//! Both directions move data in 1 MiB chunks, check the cancellation flag
//! between chunks and report progress through callbacks, so the caller
//! decides how (and whether) to display it.

use anyhow::{Result, anyhow, bail};
use blockgate_core::StorageDeviceFile;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

fn check_running(running: &AtomicBool) -> Result<()> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(anyhow!("Operation cancelled by user"))
    }
}

/// Writes an image file to an open device, with optional verification.
///
/// The device must be open for writing, and for reading too if `verify` is
/// set. The final chunk of an image whose length is not a multiple of the
/// sector size is padded with zeros on the device.
///
/// # Errors
///
/// This function will return an error if:
/// - The image cannot be read or is larger than the device.
/// - The device rejects a chunk.
/// - The verification hash does not match.
/// - The operation is cancelled.
pub fn write_image<F1, F2>(
    image_path: &Path,
    device: &mut StorageDeviceFile,
    verify: bool,
    running: &AtomicBool,
    on_write_start: impl FnOnce(u64),
    mut on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    mut on_verify_progress: F2,
) -> Result<()>
where
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    let mut image_file = File::open(image_path)?;
    let image_len = image_file.metadata()?.len();

    if let Some(device_len) = device.size() {
        if image_len > device_len {
            bail!(
                "Image is {image_len} bytes but {} only holds {device_len} bytes",
                device.file_name()
            );
        }
    }

    if !device.seek(0) {
        bail!("Could not seek to the start of {}", device.file_name());
    }

    on_write_start(image_len);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written: u64 = 0;
    while written < image_len {
        check_running(running)?;

        let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
        image_file.read_exact(&mut buffer[..to_read])?;

        if device.write(&buffer[..to_read]) != to_read {
            bail!("Write to {} failed at byte {written}", device.file_name());
        }
        written += to_read as u64;
        on_write_progress(written);
    }

    device.sync();
    info!(device = %device.file_name(), bytes = written, "image written");

    if verify {
        verify_image(image_path, image_len, device, running, on_verify_start, &mut on_verify_progress)?;
    }

    Ok(())
}

/// Re-reads the first `image_len` bytes of the device and compares their
/// SHA-256 digest with the image's.
fn verify_image(
    image_path: &Path,
    image_len: u64,
    device: &mut StorageDeviceFile,
    running: &AtomicBool,
    on_verify_start: impl FnOnce(u64),
    on_verify_progress: &mut impl FnMut(u64),
) -> Result<()> {
    let mut image_file = File::open(image_path)?;
    if !device.seek(0) {
        bail!("Could not seek to the start of {}", device.file_name());
    }

    on_verify_start(image_len);

    let mut image_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();

    let mut image_buf = vec![0u8; BUFFER_SIZE];
    let mut device_buf = vec![0u8; BUFFER_SIZE];

    let mut remaining = image_len;
    while remaining > 0 {
        check_running(running)?;

        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        image_file.read_exact(&mut image_buf[..chunk])?;
        if device.read(&mut device_buf[..chunk]) != chunk {
            bail!(
                "Read back from {} failed at byte {}",
                device.file_name(),
                image_len - remaining
            );
        }

        image_hasher.update(&image_buf[..chunk]);
        device_hasher.update(&device_buf[..chunk]);

        remaining -= chunk as u64;
        on_verify_progress(image_len - remaining);
    }

    if image_hasher.finalize() != device_hasher.finalize() {
        bail!("Verification failed: hash mismatch.");
    }
    debug!(device = %device.file_name(), "verification passed");
    Ok(())
}

/// Reads the entire contents of an open device into a new image file.
///
/// A cancelled read removes the partial image.
///
/// # Errors
///
/// This function will return an error if:
/// - The device size cannot be determined or is zero.
/// - The output file cannot be created or written.
/// - The device rejects a read.
/// - The operation is cancelled.
pub fn read_image<F>(
    device: &mut StorageDeviceFile,
    image_path: &Path,
    running: &AtomicBool,
    on_read_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let size_bytes = device
        .size()
        .ok_or_else(|| anyhow!("Could not determine the size of {}", device.file_name()))?;
    if size_bytes == 0 {
        bail!("Device size is reported as zero");
    }
    if !device.seek(0) {
        bail!("Could not seek to the start of {}", device.file_name());
    }

    on_read_start(size_bytes);

    let mut image_file = File::create(image_path)?;
    let mut buffer = vec![0u8; BUFFER_SIZE];

    let mut read_total: u64 = 0;
    while read_total < size_bytes {
        if !running.load(Ordering::SeqCst) {
            drop(image_file);
            fs::remove_file(image_path)?;
            bail!("Operation cancelled by user");
        }

        let to_read = std::cmp::min(BUFFER_SIZE as u64, size_bytes - read_total) as usize;
        if device.read(&mut buffer[..to_read]) != to_read {
            bail!("Read from {} failed at byte {read_total}", device.file_name());
        }
        image_file.write_all(&buffer[..to_read])?;

        read_total += to_read as u64;
        on_progress(read_total);
    }

    image_file.flush()?;
    info!(device = %device.file_name(), bytes = read_total, "image read");
    Ok(())
}
