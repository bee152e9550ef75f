//! Windowed, buffered reads over an open file.
//!
//! A [`FileBlock`] exposes the byte range `[offset, offset + size)` of a
//! [`Handle`] and serves reads from an internal buffer when it can. Read
//! ahead is controlled by a usage hint. Archive backends read their source
//! file through a [`BlockReader`].

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::VfsResult;
use crate::physical::Handle;

/// Which way reads are expected to progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageHint {
    /// Buffer only what is asked for.
    #[default]
    None,
    /// Buffer data after the requested range.
    Forward,
    /// Buffer data before the requested range.
    Backward,
    /// Buffer data on both sides.
    Around,
}

/// A view on part of a file.
#[derive(Debug)]
pub struct FileBlock {
    handle: Handle,
    offset: u64,
    size: u64,
    hint: UsageHint,
    read_ahead: usize,
    buffer: Vec<u8>,
    // Offset of `buffer[0]` within the block.
    buf_offset: u64,
}

impl FileBlock {
    /// A block covering the whole file.
    pub fn open(handle: Handle) -> VfsResult<Self> {
        let size = handle.fstat()?.size;
        Ok(Self::open_range(handle, 0, size))
    }

    /// A block covering `size` bytes starting at `offset`.
    pub fn open_range(handle: Handle, offset: u64, size: u64) -> Self {
        Self {
            handle,
            offset,
            size,
            hint: UsageHint::None,
            read_ahead: 0,
            buffer: Vec::new(),
            buf_offset: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_usage_hint(&mut self, hint: UsageHint, read_ahead: usize) {
        self.hint = hint;
        self.read_ahead = read_ahead;
    }

    /// Drop buffered data.
    pub fn clear_buffers(&mut self) {
        self.buffer = Vec::new();
        self.buf_offset = 0;
    }

    fn clamp(&self, offset: u64, len: usize) -> usize {
        if offset >= self.size {
            return 0;
        }
        len.min((self.size - offset).min(usize::MAX as u64) as usize)
    }

    fn buffered(&self, offset: u64, len: usize) -> bool {
        offset >= self.buf_offset
            && offset + len as u64 <= self.buf_offset + self.buffer.len() as u64
    }

    /// Borrow up to `len` bytes at `offset` (relative to the block).
    ///
    /// Reading past the end of the block is not an error; the slice is
    /// just shorter, like `read` at end of file. The slice is valid until
    /// the next call on this block.
    pub fn access(&mut self, offset: u64, len: usize) -> VfsResult<&[u8]> {
        let len = self.clamp(offset, len);
        if len == 0 {
            return Ok(&[]);
        }

        if !self.buffered(offset, len) {
            let ahead = self.read_ahead as u64;
            let (start, end) = if (len as u64) < ahead && self.hint != UsageHint::None {
                match self.hint {
                    UsageHint::Forward => (offset, (offset + ahead).min(self.size)),
                    UsageHint::Backward => {
                        let end = offset + len as u64;
                        (end.saturating_sub(ahead), end)
                    }
                    UsageHint::Around | UsageHint::None => {
                        let before = (ahead - len as u64) / 2;
                        let start = offset.saturating_sub(before);
                        (start, (start + ahead).min(self.size))
                    }
                }
            } else {
                (offset, offset + len as u64)
            };

            self.buffer.resize((end - start) as usize, 0);
            self.buf_offset = start;
            self.handle.lseek(SeekFrom::Start(self.offset + start))?;
            let filled = read_full(&self.handle, &mut self.buffer)?;
            self.buffer.truncate(filled);
        }

        let from = (offset - self.buf_offset) as usize;
        let to = (from + len).min(self.buffer.len());
        Ok(self.buffer.get(from..to).unwrap_or(&[]))
    }

    /// Copy bytes at `offset` into `buf`, using buffered data first.
    pub fn copy(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let len = self.clamp(offset, buf.len());
        if len == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..len];

        let mut copied = 0;
        let buf_end = self.buf_offset + self.buffer.len() as u64;
        if offset >= self.buf_offset && offset < buf_end {
            let from = (offset - self.buf_offset) as usize;
            let n = ((buf_end - offset) as usize).min(len);
            buf[..n].copy_from_slice(&self.buffer[from..from + n]);
            copied = n;
            if copied == len {
                return Ok(copied);
            }
        }

        self.handle
            .lseek(SeekFrom::Start(self.offset + offset + copied as u64))?;
        copied += read_full(&self.handle, &mut buf[copied..])?;
        Ok(copied)
    }

    /// Release the block and its handle reference.
    pub fn close(self) -> VfsResult<()> {
        self.handle.close()
    }

    /// Turn this block into a `Read + Seek` stream.
    pub fn into_reader(self) -> BlockReader {
        BlockReader {
            block: self,
            pos: 0,
        }
    }
}

fn read_full(handle: &Handle, buf: &mut [u8]) -> VfsResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match handle.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(crate::error::VfsError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Sequential reader over a [`FileBlock`].
#[derive(Debug)]
pub struct BlockReader {
    block: FileBlock,
    pos: u64,
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.block.copy(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlockReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => self.block.size.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of block",
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::VfsError;
    use crate::fstypes::{Capability, FileSystemHandler, FileSystemId, MountedTree, NativeFile};
    use crate::gphys::GpRoot;
    use crate::physical::{PDirHandle, PRoot};
    use crate::types::{FileAttr, MountFlags, OpenFlags};
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory file that counts reads.
    pub(crate) struct MemFile {
        data: Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl NativeFile for MemFile {
        fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.data.read(buf)?)
        }

        fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
            Ok(self.data.seek(pos)?)
        }

        fn fstat(&mut self) -> VfsResult<FileAttr> {
            Ok(FileAttr::file(self.data.get_ref().len() as u64, 0o644))
        }
    }

    struct MemFs;

    impl FileSystemHandler for MemFs {
        fn supports(&self, cap: Capability) -> bool {
            matches!(cap, Capability::Seek | Capability::Fstat)
        }

        fn mount(&self, _source: Option<Handle>, _flags: MountFlags) -> VfsResult<MountedTree> {
            Ok(MountedTree {
                root_dir: GpRoot::new(None, true, false).make_root_dir(true),
                extra: None,
            })
        }

        fn open(
            &self,
            _dir: &PDirHandle,
            name: &str,
            _flags: OpenFlags,
            _mode: u32,
        ) -> VfsResult<Box<dyn NativeFile>> {
            Err(VfsError::not_found(name))
        }
    }

    /// A handle over `data` on a throwaway root.
    pub(crate) fn mem_handle(data: Vec<u8>) -> (Handle, Arc<AtomicUsize>) {
        let handler: Arc<dyn FileSystemHandler> = Arc::new(MemFs);
        let tree = handler.mount(None, MountFlags::read_only()).unwrap();
        let root = PRoot::new(FileSystemId(0x40), handler, MountFlags::read_only(), tree, None);
        let reads = Arc::new(AtomicUsize::new(0));
        let file = MemFile {
            data: Cursor::new(data),
            reads: reads.clone(),
        };
        (Handle::new(root, Box::new(file), OpenFlags::read()), reads)
    }

    fn setup() -> (FileBlock, Arc<AtomicUsize>) {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (handle, reads) = mem_handle(data);
        (FileBlock::open(handle).unwrap(), reads)
    }

    #[test]
    fn test_access_clamps_to_block() {
        let (mut block, _reads) = setup();
        assert_eq!(block.size(), 1000);
        assert_eq!(block.access(990, 100).unwrap().len(), 10);
        assert!(block.access(1000, 10).unwrap().is_empty());
        assert!(block.access(5000, 10).unwrap().is_empty());
    }

    #[test]
    fn test_forward_read_ahead_serves_from_buffer() {
        let (mut block, reads) = setup();
        block.set_usage_hint(UsageHint::Forward, 256);

        assert_eq!(block.access(10, 4).unwrap(), &[10, 11, 12, 13]);
        let after_first = reads.load(Ordering::SeqCst);
        assert_eq!(block.access(100, 50).unwrap()[0], 100);
        assert_eq!(reads.load(Ordering::SeqCst), after_first);

        block.clear_buffers();
        block.access(100, 1).unwrap();
        assert!(reads.load(Ordering::SeqCst) > after_first);
    }

    #[test]
    fn test_backward_and_around() {
        let (mut block, _reads) = setup();
        block.set_usage_hint(UsageHint::Backward, 100);
        assert_eq!(block.access(500, 2).unwrap(), &[500u16 as u8, 501u16 as u8]);
        assert!(block.buffered(420, 80));

        block.set_usage_hint(UsageHint::Around, 100);
        block.clear_buffers();
        block.access(500, 10).unwrap();
        assert!(block.buffered(455, 100));
    }

    #[test]
    fn test_copy_uses_buffer_then_handle() {
        let (mut block, _reads) = setup();
        block.access(0, 16).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(block.copy(8, &mut buf).unwrap(), 32);
        assert_eq!(buf[0], 8);
        assert_eq!(buf[31], 39);

        let mut tail = [0u8; 8];
        assert_eq!(block.copy(996, &mut tail).unwrap(), 4);
    }

    #[test]
    fn test_range_and_reader() {
        let (handle, _reads) = mem_handle(b"headerPAYLOADtrailer".to_vec());
        let block = FileBlock::open_range(handle, 6, 7);
        let mut reader = block.into_reader();

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "PAYLOAD");

        reader.seek(SeekFrom::End(-4)).unwrap();
        let mut four = [0u8; 4];
        reader.read_exact(&mut four).unwrap();
        assert_eq!(&four, b"LOAD");
        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
    }
}
