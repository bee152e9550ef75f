//! Buffered streams on top of [`Handle`].
//!
//! A [`Stream`] owns one block-sized buffer that holds either read-ahead
//! data or pending output, never both. As with C stdio, switching from
//! writing to reading requires `fflush` or `fseek` in between, and from
//! reading to writing requires `fseek`; breaking that rule panics.

use std::fmt;
use std::io::SeekFrom;
use tracing::warn;

use crate::error::{VfsError, VfsResult};
use crate::io::DirHandle;
use crate::physical::Handle;
use crate::types::{AccessMode, OpenFlags};

const BLOCK_SIZE: usize = 1024;

/// Mode used for files created by [`DirHandle::fopen`].
const CREATE_MODE: u32 = 0o666;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Eof,
    Error,
}

/// Parse an `fopen` mode string.
///
/// The first character is `r`, `w` or `a`; up to two of `b`, `t` and `+`
/// may follow. Anything after that is ignored.
pub fn parse_mode(mode: &str) -> VfsResult<OpenFlags> {
    let mut chars = mode.chars();
    let mut flags = match chars.next() {
        Some('r') => OpenFlags::read(),
        Some('w') => OpenFlags::create_truncate(),
        Some('a') => OpenFlags::create().with_append(),
        _ => return Err(VfsError::invalid_argument(format!("fopen mode '{mode}'"))),
    };
    for c in chars.take(2) {
        match c {
            'b' | 't' => {}
            '+' => flags = flags.with_access(AccessMode::ReadWrite),
            _ => break,
        }
    }
    Ok(flags)
}

impl DirHandle {
    /// Open a buffered stream with an `fopen`-style mode string.
    pub fn fopen(&self, path: &str, mode: &str) -> VfsResult<Stream> {
        let flags = parse_mode(mode)?;
        let handle = self.open(path, flags, CREATE_MODE)?;
        Ok(Stream::new(handle, flags))
    }
}

/// A buffered file stream.
pub struct Stream {
    handle: Handle,
    flags: OpenFlags,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    status: Status,
    operation: Operation,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("buffered", &(self.end - self.start))
            .field("status", &self.status)
            .field("operation", &self.operation)
            .finish()
    }
}

impl Stream {
    pub fn new(handle: Handle, flags: OpenFlags) -> Self {
        Self {
            handle,
            flags,
            buf: vec![0; BLOCK_SIZE],
            start: 0,
            end: 0,
            status: Status::Ok,
            operation: Operation::None,
        }
    }

    /// The underlying handle, like `fileno`.
    pub fn stream_handle(&self) -> &Handle {
        &self.handle
    }

    fn assert_read_sanity(&self) {
        assert!(self.flags.readable(), "reading from a write-only stream");
        if self.operation == Operation::Write {
            panic!("reading directly after writing without fflush or fseek in between");
        }
    }

    fn assert_write_sanity(&self) {
        assert!(self.flags.writable(), "writing to a read-only stream");
        if self.operation == Operation::Read {
            panic!("writing directly after reading without fseek in between");
        }
        debug_assert_eq!(self.start, 0);
    }

    fn fill_read_buffer(&mut self) -> VfsResult<()> {
        let n = loop {
            match self.handle.read(&mut self.buf) {
                Err(VfsError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                other => break other?,
            }
        };
        self.start = 0;
        self.end = n;
        Ok(())
    }

    /// Write all of `data` to the handle.
    fn write_through(&mut self, data: &[u8]) -> (usize, VfsResult<()>) {
        let mut written = 0;
        while written < data.len() {
            match self.handle.write(&data[written..]) {
                Ok(0) => return (written, Err(VfsError::corrupt("write made no progress"))),
                Ok(n) => written += n,
                Err(VfsError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return (written, Err(e)),
            }
        }
        (written, Ok(()))
    }

    fn flush_write_buffer(&mut self) -> VfsResult<()> {
        let pending = self.buf[self.start..self.end].to_vec();
        let (_, result) = self.write_through(&pending);
        if let Err(e) = result {
            self.status = Status::Error;
            return Err(e);
        }
        self.start = 0;
        self.end = 0;
        Ok(())
    }

    /// Read up to `nmemb` elements of `size` bytes into `buf`.
    ///
    /// Returns the number of whole elements read. After a short count the
    /// file position is undefined until the next `fseek`.
    pub fn fread(&mut self, buf: &mut [u8], size: usize, nmemb: usize) -> usize {
        self.assert_read_sanity();
        self.operation = Operation::Read;
        if size == 0 || nmemb == 0 {
            return 0;
        }
        let total = size * nmemb;
        assert!(buf.len() >= total, "fread buffer smaller than size * nmemb");

        let buffered = (self.end - self.start).min(total);
        buf[..buffered].copy_from_slice(&self.buf[self.start..self.start + buffered]);
        self.start += buffered;
        let mut done = buffered;

        while done < total {
            match self.handle.read(&mut buf[done..total]) {
                Ok(0) => {
                    self.status = Status::Eof;
                    self.operation = Operation::None;
                    break;
                }
                Ok(n) => done += n,
                Err(VfsError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.status = Status::Error;
                    break;
                }
            }
        }
        done / size
    }

    /// Read a line of at most `size - 1` bytes, newline included.
    ///
    /// Returns `None` at end of file when nothing was read, or on error.
    pub fn fgets(&mut self, size: usize) -> Option<Vec<u8>> {
        self.assert_read_sanity();
        self.operation = Operation::Read;

        let mut out = Vec::new();
        let mut left = size.saturating_sub(1);
        while left > 0 {
            if self.start == self.end {
                if self.fill_read_buffer().is_err() {
                    self.status = Status::Error;
                    return None;
                }
                if self.start == self.end {
                    self.status = Status::Eof;
                    self.operation = Operation::None;
                    if out.is_empty() {
                        return None;
                    }
                    break;
                }
            }

            let max = (self.end - self.start).min(left);
            let chunk = &self.buf[self.start..self.start + max];
            if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                out.extend_from_slice(&chunk[..=pos]);
                self.start += pos + 1;
                return Some(out);
            }
            out.extend_from_slice(chunk);
            self.start += max;
            left -= max;
        }
        Some(out)
    }

    /// Read one byte. `None` at end of file or on error.
    pub fn fgetc(&mut self) -> Option<u8> {
        self.assert_read_sanity();
        self.operation = Operation::Read;

        if self.start == self.end {
            if self.fill_read_buffer().is_err() {
                self.status = Status::Error;
                return None;
            }
            if self.start == self.end {
                self.status = Status::Eof;
                self.operation = Operation::None;
                return None;
            }
        }
        let c = self.buf[self.start];
        self.start += 1;
        Some(c)
    }

    /// Push back a byte. Not supported; always returns `None`.
    pub fn ungetc(&mut self, _c: u8) -> Option<u8> {
        assert!(self.flags.readable(), "ungetc on a write-only stream");
        None
    }

    /// Step back `n` bytes within the read buffer.
    ///
    /// Only bytes still in the buffer can be stepped over.
    pub fn backtrack(&mut self, n: usize) -> usize {
        assert!(self.flags.readable(), "backtrack on a write-only stream");
        assert!(n <= self.start, "backtracking past the read buffer");
        self.operation = Operation::Read;
        self.start -= n;
        n
    }

    /// Write up to `nmemb` elements of `size` bytes from `buf`.
    ///
    /// Returns the number of whole elements written. After a short count
    /// the file position is undefined until the next `fseek`.
    pub fn fwrite(&mut self, buf: &[u8], size: usize, nmemb: usize) -> usize {
        self.assert_write_sanity();
        self.operation = Operation::Write;
        if size == 0 || nmemb == 0 {
            return 0;
        }
        let total = size * nmemb;
        assert!(buf.len() >= total, "fwrite buffer smaller than size * nmemb");
        let data = &buf[..total];

        if total < BLOCK_SIZE - self.end {
            self.buf[self.end..self.end + total].copy_from_slice(data);
            self.end += total;
            return nmemb;
        }

        if self.flush_write_buffer().is_err() {
            return 0;
        }
        if total < BLOCK_SIZE {
            self.buf[..total].copy_from_slice(data);
            self.end = total;
            return nmemb;
        }

        let (written, result) = self.write_through(data);
        if result.is_err() {
            self.status = Status::Error;
        }
        written / size
    }

    /// Write one byte.
    pub fn fputc(&mut self, c: u8) -> VfsResult<()> {
        self.assert_write_sanity();
        self.operation = Operation::Write;
        if self.end == BLOCK_SIZE {
            self.flush_write_buffer()?;
        }
        self.buf[self.end] = c;
        self.end += 1;
        Ok(())
    }

    /// Write a string.
    pub fn fputs(&mut self, s: &str) -> VfsResult<()> {
        if s.is_empty() {
            self.assert_write_sanity();
            self.operation = Operation::Write;
            return Ok(());
        }
        if self.fwrite(s.as_bytes(), s.len(), 1) != 1 {
            return Err(VfsError::corrupt("short write"));
        }
        Ok(())
    }

    /// Write formatted output, as in `stream.fprintf(format_args!(...))`.
    pub fn fprintf(&mut self, args: fmt::Arguments<'_>) -> VfsResult<()> {
        self.fputs(&fmt::format(args))
    }

    /// Move the file position. Drops read-ahead data and writes out
    /// pending output first; clears end-of-file and error status.
    pub fn fseek(&mut self, pos: SeekFrom) -> VfsResult<()> {
        match self.operation {
            Operation::Read => {
                self.start = 0;
                self.end = 0;
            }
            Operation::Write => self.flush_write_buffer()?,
            Operation::None => {}
        }
        self.operation = Operation::None;
        self.handle.lseek(pos)?;
        self.status = Status::Ok;
        Ok(())
    }

    /// Current logical file position.
    pub fn ftell(&self) -> VfsResult<u64> {
        let pos = self.handle.lseek(SeekFrom::Current(0))?;
        let buffered = (self.end - self.start) as u64;
        Ok(match self.operation {
            Operation::Write => pos + buffered,
            Operation::Read => pos.saturating_sub(buffered),
            Operation::None => pos,
        })
    }

    /// Write out pending output.
    pub fn fflush(&mut self) -> VfsResult<()> {
        if self.operation == Operation::Write {
            self.flush_write_buffer()?;
            self.operation = Operation::None;
        }
        Ok(())
    }

    pub fn feof(&self) -> bool {
        self.status == Status::Eof
    }

    pub fn ferror(&self) -> bool {
        self.status == Status::Error
    }

    pub fn clearerr(&mut self) {
        self.status = Status::Ok;
    }

    /// Flush and close. Errors from either step are reported.
    pub fn fclose(mut self) -> VfsResult<()> {
        let flushed = self.fflush();
        self.operation = Operation::None;
        let handle = self.handle.clone();
        drop(self);
        let closed = handle.close();
        flushed.and(closed)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.operation == Operation::Write {
            if let Err(e) = self.fflush() {
                warn!(error = %e, "flushing stream on drop failed");
            }
        }
    }
}
