//! Buffered sequential file stream.
//!
//! One [`FileStream`] per opened file. Reads are amortized through a
//! fixed-size read-ahead buffer which is reused across refills and never
//! exposed outside the stream. All operations against one stream are
//! serialized through its [`OpQueue`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use stream_error::{FileStreamError, Result};

use crate::queue::OpQueue;
use crate::raw::{RawFile, RawIo, StdIo};

/// Default capacity of the read-ahead buffer, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default delimiter consumed by [`FileStream::readline`].
pub const DEFAULT_NEWLINE: &str = "\n";

/// Default decoding applied to bytes returned by read operations.
pub const DEFAULT_ENCODING: Encoding = Encoding::Utf8;

/// Byte-to-text decoding scheme for read results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8; invalid sequences decode to U+FFFD.
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per character.
    Latin1,
}

impl Encoding {
    /// Decode the window into characters, each paired with the number of
    /// window bytes it was produced from.
    ///
    /// Invalid or truncated UTF-8 sequences decode to U+FFFD but are
    /// billed at their real byte length, so consuming a decoded prefix
    /// always maps back onto the window without overshooting it, even
    /// when a code point is split across two refills.
    fn decode(&self, bytes: &[u8]) -> Vec<(char, usize)> {
        match self {
            Encoding::Utf8 => {
                let mut pieces = Vec::new();
                let mut rest = bytes;
                while !rest.is_empty() {
                    match std::str::from_utf8(rest) {
                        Ok(valid) => {
                            pieces.extend(
                                valid.chars().map(|c| (c, c.len_utf8())),
                            );
                            break;
                        }
                        Err(err) => {
                            let valid =
                                std::str::from_utf8(&rest[..err.valid_up_to()])
                                    .unwrap_or_default();
                            pieces.extend(
                                valid.chars().map(|c| (c, c.len_utf8())),
                            );
                            let bad = err
                                .error_len()
                                .unwrap_or(rest.len() - err.valid_up_to());
                            pieces.push((char::REPLACEMENT_CHARACTER, bad));
                            rest = &rest[err.valid_up_to() + bad..];
                        }
                    }
                }
                pieces
            }
            Encoding::Latin1 => {
                bytes.iter().map(|&b| (b as char, 1)).collect()
            }
        }
    }
}

/// First position in `pieces` where the decoded characters of `marker`
/// occur contiguously.
fn find_marker(pieces: &[(char, usize)], marker: &str) -> Option<usize> {
    let marker: Vec<char> = marker.chars().collect();
    if marker.is_empty() || pieces.len() < marker.len() {
        return None;
    }
    (0..=pieces.len() - marker.len()).find(|&i| {
        pieces[i..i + marker.len()]
            .iter()
            .map(|&(c, _)| c)
            .eq(marker.iter().copied())
    })
}

/// Seek origin selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Whence {
    /// Absolute offset from the start of the file.
    #[default]
    Start,
    /// Relative to the current logical position ([`FileStream::tell`]).
    Current,
    /// Relative to the end of the file.
    End,
}

impl TryFrom<i32> for Whence {
    type Error = FileStreamError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(FileStreamError::UnknownWhence(other)),
        }
    }
}

/// Configuration recognized at open time.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Capacity of the read-ahead buffer, in bytes.
    /// Zero falls back to [`DEFAULT_BUFFER_SIZE`].
    pub buffer_size: usize,
    /// Decoding applied to bytes returned by read operations.
    pub encoding: Encoding,
    /// Delimiter consumed by [`FileStream::readline`].
    pub newline: String,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            encoding: DEFAULT_ENCODING,
            newline: DEFAULT_NEWLINE.to_string(),
        }
    }
}

/// Mutable stream state, guarded by the stream's mutex and only ever
/// mutated by the single operation the queue lets through.
struct State<F> {
    /// Open descriptor; taken exactly once on close.
    file: Option<F>,
    /// End of data already pulled from the file into the buffer.
    /// Monotonically non-decreasing except on seek.
    file_pos: u64,
    /// Fixed-capacity read-ahead buffer, overwritten on refill,
    /// never reallocated.
    buf: Vec<u8>,
    /// Unconsumed window: `0 <= buf_start <= buf_end <= buf.len()`.
    buf_start: usize,
    buf_end: usize,
    /// Set when a refill reads fewer bytes than requested;
    /// cleared only by a successful seek.
    found_eof: bool,
    /// Monotonic false-to-true, irreversible.
    closed: bool,
}

impl<F> State<F> {
    fn is_eof(&self) -> bool {
        self.buf_start == self.buf_end && self.found_eof
    }

    fn logical_pos(&self) -> u64 {
        self.file_pos - (self.buf_end - self.buf_start) as u64
    }
}

/// A buffered, sequential, single-consumer reader over one open file.
///
/// Operations may be issued from multiple threads on a shared stream;
/// the internal queue guarantees at most one of read, readline, seek and
/// close is mid-flight at a time, executed strictly in submission order.
/// [`FileStream::tell`] and the status predicates are synchronous and do
/// not take a queue turn.
pub struct FileStream<Io: RawIo = StdIo> {
    io: Io,
    path: PathBuf,
    encoding: Encoding,
    newline: String,
    queue: OpQueue,
    state: Mutex<State<Io::File>>,
}

impl FileStream<StdIo> {
    /// Open `path` on the real filesystem with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StreamOptions::default())
    }

    /// Open `path` on the real filesystem with explicit options.
    pub fn open_with(
        path: impl AsRef<Path>,
        options: StreamOptions,
    ) -> Result<Self> {
        Self::open_io(StdIo, path, options)
    }
}

impl<Io: RawIo> FileStream<Io> {
    /// Open `path` through an explicit raw-I/O collaborator.
    ///
    /// Fails if the collaborator cannot produce a read-write descriptor
    /// for `path`; the underlying error is propagated verbatim and no
    /// stream is produced.
    pub fn open_io(
        io: Io,
        path: impl AsRef<Path>,
        options: StreamOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let buffer_size = if options.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            options.buffer_size
        };

        let file = io.open(&path)?;
        log::debug!(
            "stream/{}: opened, {} byte buffer",
            path.display(),
            buffer_size
        );

        Ok(Self {
            io,
            path,
            encoding: options.encoding,
            newline: options.newline,
            queue: OpQueue::new(),
            state: Mutex::new(State {
                file: Some(file),
                file_pos: 0,
                buf: vec![0; buffer_size],
                buf_start: 0,
                buf_end: 0,
                found_eof: false,
                closed: false,
            }),
        })
    }

    /// Path this stream was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical read position: bytes consumed so far, accounting
    /// for buffered-but-unconsumed bytes.
    pub fn tell(&self) -> u64 {
        self.lock().logical_pos()
    }

    /// True once [`FileStream::close`] has run.
    pub fn closed(&self) -> bool {
        self.lock().closed
    }

    /// True when the buffer window is drained and the last refill came
    /// up short.
    pub fn eof(&self) -> bool {
        self.lock().is_eof()
    }

    /// A stream is readable until it is closed or reaches end of file.
    pub fn readable(&self) -> bool {
        let state = self.lock();
        !state.closed && !state.is_eof()
    }

    /// A stream is seekable until it is closed.
    pub fn seekable(&self) -> bool {
        !self.lock().closed
    }

    /// Read up to `n` decoded characters.
    ///
    /// `None` and `Some(0)` both read to end of file. Returns fewer than
    /// `n` characters only at end of file. Fails with
    /// [`FileStreamError::NotReadable`] if the stream is closed or already
    /// at end of file; the queue still advances past a failed read.
    pub fn read(&self, n: Option<usize>) -> Result<String> {
        self.queue.run(|| self.do_read(n))
    }

    /// Read one line, consuming the newline marker but excluding it from
    /// the result.
    ///
    /// Reaching end of file before any marker yields whatever accumulated,
    /// so a partial final line is a valid result, not an error; callers
    /// distinguish it from "no more lines" by checking [`FileStream::eof`]
    /// afterward.
    pub fn readline(&self) -> Result<String> {
        self.queue.run(|| self.do_readline())
    }

    /// Reposition the logical read offset.
    ///
    /// The target must land inside `[0, size)`; on success the read-ahead
    /// window is discarded and the EOF flag cleared, on failure state is
    /// left untouched. Seeking exactly to end of file is rejected.
    pub fn seek(&self, offset: i64, whence: Whence) -> Result<()> {
        self.queue.run(|| self.do_seek(offset, whence))
    }

    /// Close the stream, releasing the descriptor.
    ///
    /// Takes its own turn in the queue, so operations submitted earlier
    /// drain first.
    ///
    /// # Panics
    ///
    /// Closing an already-closed stream is a usage error and panics.
    pub fn close(&self) -> Result<()> {
        self.queue.run(|| self.do_close())
    }

    fn do_read(&self, n: Option<usize>) -> Result<String> {
        let mut state = self.lock();
        if state.closed || state.is_eof() {
            return Err(FileStreamError::NotReadable);
        }

        // Zero means no limit.
        let mut budget = n.filter(|&n| n > 0);
        let mut out = String::new();

        loop {
            if state.buf_start == state.buf_end {
                if state.found_eof {
                    return Ok(out);
                }
                self.refill(&mut state)?;
                continue;
            }

            let pieces = self
                .encoding
                .decode(&state.buf[state.buf_start..state.buf_end]);

            match budget {
                Some(want) if want <= pieces.len() => {
                    for &(c, src_len) in pieces.iter().take(want) {
                        out.push(c);
                        state.buf_start += src_len;
                    }
                    debug_assert!(state.buf_start <= state.buf_end);
                    return Ok(out);
                }
                Some(want) => {
                    budget = Some(want - pieces.len());
                    state.buf_start = state.buf_end;
                    out.extend(pieces.iter().map(|&(c, _)| c));
                }
                None => {
                    state.buf_start = state.buf_end;
                    out.extend(pieces.iter().map(|&(c, _)| c));
                }
            }
        }
    }

    fn do_readline(&self) -> Result<String> {
        let mut state = self.lock();
        if state.closed || state.is_eof() {
            return Err(FileStreamError::NotReadable);
        }

        let mut line = String::new();

        loop {
            if state.buf_start == state.buf_end {
                if state.found_eof {
                    return Ok(line);
                }
                self.refill(&mut state)?;
                continue;
            }

            let pieces = self
                .encoding
                .decode(&state.buf[state.buf_start..state.buf_end]);
            match find_marker(&pieces, &self.newline) {
                Some(at) => {
                    let marker_chars = self.newline.chars().count();
                    for &(c, src_len) in &pieces[..at] {
                        line.push(c);
                        state.buf_start += src_len;
                    }
                    for &(_, src_len) in &pieces[at..at + marker_chars] {
                        state.buf_start += src_len;
                    }
                    debug_assert!(state.buf_start <= state.buf_end);
                    return Ok(line);
                }
                None => {
                    state.buf_start = state.buf_end;
                    line.extend(pieces.iter().map(|&(c, _)| c));
                }
            }
        }
    }

    fn do_seek(&self, offset: i64, whence: Whence) -> Result<()> {
        // Size is queried out-of-band; the read-ahead window plays no part.
        let size = self.io.size(&self.path)?;

        let mut state = self.lock();
        let new_pos = match whence {
            Whence::Start => offset,
            Whence::Current => offset + state.logical_pos() as i64,
            Whence::End => offset + size as i64,
        };

        if new_pos < 0 || new_pos as u64 >= size {
            return Err(FileStreamError::InvalidOffset(new_pos));
        }

        state.file_pos = new_pos as u64;
        state.found_eof = false;
        state.buf_start = 0;
        state.buf_end = 0;

        log::debug!("stream/{}: seek to {}", self.path.display(), new_pos);
        Ok(())
    }

    fn do_close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            panic!("stream/{}: already closed", self.path.display());
        }
        state.closed = true;
        let file = state.file.take();
        drop(state);

        if let Some(file) = file {
            file.close()?;
        }
        log::debug!("stream/{}: closed", self.path.display());
        Ok(())
    }

    /// Pull the next chunk of the file into the buffer.
    ///
    /// Sets the window to `[0, bytes_read)` and advances `file_pos`.
    /// A short read is the sole end-of-file signal.
    fn refill(&self, state: &mut State<Io::File>) -> Result<()> {
        let State {
            file,
            file_pos,
            buf,
            buf_start,
            buf_end,
            found_eof,
            ..
        } = state;
        let file = file.as_mut().ok_or(FileStreamError::NotReadable)?;

        let read = file.read_at(buf, *file_pos)?;
        *file_pos += read as u64;
        *buf_start = 0;
        *buf_end = read;
        if read < buf.len() {
            *found_eof = true;
        }

        debug_assert!(*buf_end <= buf.len());
        log::debug!(
            "stream/{}: refilled {} bytes at offset {}",
            self.path.display(),
            read,
            *file_pos - read as u64
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State<Io::File>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn ops_submitted(&self) -> u64 {
        self.queue.issued()
    }
}
