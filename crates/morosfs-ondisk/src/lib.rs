#![forbid(unsafe_code)]
//! On-disk format definitions for the MOROS filesystem.
//!
//! Pure parsing crate — no I/O, no side effects. Operates on byte slices
//! already read from the backing image.
//!
//! # Format
//!
//! The image is an array of 512-byte blocks. Every block used as a directory
//! block or a file-data block begins with a 4-byte big-endian field holding
//! the **block number** of the next block in its chain (0 terminates the
//! chain); the remaining 508 bytes are payload. Block number 0 is reserved
//! as the nil sentinel and is never a valid target.
//!
//! Directory payload is a packed sequence of entries with no alignment
//! padding:
//!
//! ```text
//! kind        1 byte   0 = directory, nonzero = regular file
//! start block 4 bytes  big-endian block number of the entry's chain head
//! size        4 bytes  big-endian content length (files); unused for dirs
//! name length 1 byte
//! name        n bytes  UTF-8, not NUL-terminated
//! ```
//!
//! Scanning within a block stops at a start-block field of 0 (the rest of
//! the payload is unused space) or at the 512-byte boundary.

/// Size of one block in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Size of the chain next-pointer at the start of every block.
pub const NEXT_PTR_LEN: usize = 4;

/// Usable payload bytes per block.
pub const PAYLOAD_LEN: usize = BLOCK_SIZE - NEXT_PTR_LEN;

/// Byte offset of the superblock region.
///
/// The reference layout reserves this block for format metadata. Nothing in
/// it is required to read the filesystem, so the reader never fetches it;
/// the constant documents the layout.
pub const SUPERBLOCK_ADDR: u64 = 2048 * BLOCK_SIZE as u64;

/// Byte offset of the root directory's chain head.
pub const ROOT_ADDR: u64 = (2048 + 2 + 512) * BLOCK_SIZE as u64;

/// Fixed size of a directory entry header (everything before the name).
const ENTRY_HEADER_LEN: usize = 1 + 4 + 4 + 1;

/// Byte address of a block within the image.
///
/// On disk, addresses are stored as 4-byte big-endian block numbers; this
/// wrapper always carries the byte offset (number × 512). The zero address
/// is the nil sentinel shared by "end of chain" and "entry absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr(pub u64);

impl BlockAddr {
    /// The nil sentinel.
    pub const NIL: Self = Self(0);

    /// Address of the root directory's chain head.
    pub const ROOT: Self = Self(ROOT_ADDR);

    /// Convert an on-disk block number into a byte address.
    #[must_use]
    pub fn from_block_number(number: u32) -> Self {
        Self(u64::from(number) * BLOCK_SIZE as u64)
    }

    /// Whether this is the nil sentinel.
    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

/// Entry discriminator: 0 = directory, nonzero = regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

impl EntryKind {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            Self::Directory
        } else {
            Self::File
        }
    }
}

/// A parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    /// Byte address of the entry's own chain head. Never nil: the scan
    /// terminates before producing an entry with start block 0.
    pub addr: BlockAddr,
    /// Declared content length. Meaningful for files only.
    pub size: u32,
    pub name: String,
}

fn read_u8(buf: &[u8], off: usize) -> Option<u8> {
    buf.get(off).copied()
}

fn read_be_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse the chain next-pointer at the start of a block.
///
/// Returns nil when the block is too short to carry one, which only happens
/// on malformed input — a full block always has four leading bytes.
#[must_use]
pub fn chain_next(block: &[u8]) -> BlockAddr {
    match read_be_u32(block, 0) {
        Some(number) => BlockAddr::from_block_number(number),
        None => BlockAddr::NIL,
    }
}

/// Iterator over the packed directory entries of one block.
///
/// Yields entries in layout order. Stops at a start-block field of 0, at the
/// block boundary, or at a header/name that would straddle the boundary
/// (trailing bytes that cannot form a complete entry are unused space).
#[derive(Debug)]
pub struct EntryIter<'a> {
    block: &'a [u8],
    pos: usize,
}

impl<'a> EntryIter<'a> {
    /// Iterate the entries of a full directory block (next-pointer included).
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            pos: NEXT_PTR_LEN,
        }
    }
}

impl Iterator for EntryIter<'_> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        let end = self.block.len().min(BLOCK_SIZE);
        if self.pos + ENTRY_HEADER_LEN > end {
            return None;
        }

        let kind = EntryKind::from_byte(read_u8(self.block, self.pos)?);
        let start = read_be_u32(self.block, self.pos + 1)?;
        if start == 0 {
            // Unused space from here to the end of the block.
            return None;
        }
        let size = read_be_u32(self.block, self.pos + 5)?;
        let name_len = usize::from(read_u8(self.block, self.pos + 9)?);

        let name_start = self.pos + ENTRY_HEADER_LEN;
        let name_end = name_start + name_len;
        if name_end > end {
            return None;
        }
        let name = String::from_utf8_lossy(&self.block[name_start..name_end]).into_owned();

        self.pos = name_end;
        Some(DirEntry {
            kind,
            addr: BlockAddr::from_block_number(start),
            size,
            name,
        })
    }
}
