//! Raw file-descriptor primitives the buffered stream is built on.
//!
//! The stream core only needs four operations: open, positioned read,
//! size query and close. Keeping them behind a trait lets tests swap in
//! instrumented in-memory collaborators.

use std::fs::{File, OpenOptions};
use std::path::Path;

use stream_error::Result;

/// An open descriptor produced by [`RawIo::open`].
pub trait RawFile: Send {
    /// Read up to `buf.len()` bytes at absolute `offset`.
    ///
    /// Implementations must normalize end-of-file into a short count:
    /// a return value smaller than `buf.len()` means the file holds no
    /// byte past `offset + n`. Short reads in the middle of a file are
    /// not allowed.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Release the descriptor.
    fn close(self) -> Result<()>;
}

/// The raw-I/O collaborator behind a [`crate::FileStream`].
pub trait RawIo: Send + Sync {
    type File: RawFile;

    /// Open `path` for read-write access.
    fn open(&self, path: &Path) -> Result<Self::File>;

    /// Size of the file at `path`, in bytes.
    fn size(&self, path: &Path) -> Result<u64>;
}

/// Collaborator backed by the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdIo;

impl RawIo for StdIo {
    type File = File;

    fn open(&self, path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(file)
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

impl RawFile for File {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        // The device may return less than requested mid-file; keep reading
        // until the buffer is full or the file genuinely ends, so a short
        // count is a reliable end-of-file signal for the caller.
        let mut filled = 0;
        while filled < buf.len() {
            let read = positioned_read(
                self,
                &mut buf[filled..],
                offset + filled as u64,
            )?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[cfg(unix)]
fn positioned_read(
    file: &File,
    buf: &mut [u8],
    offset: u64,
) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positioned_read(
    file: &File,
    buf: &mut [u8],
    offset: u64,
) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
