#![forbid(unsafe_code)]
//! MOROS image reader.
//!
//! Owns a random-access handle to a backing image and implements root
//! resolution, path-to-entry resolution over directory block chains,
//! directory listing, and file content reassembly from chained data blocks.
//!
//! There is no cache between requests: the image is immutable for the
//! lifetime of a mount, chain walks are bounded by directory depth and file
//! size, and every request re-walks from the root.
//!
//! All device access goes through [`ByteDevice::read_exact_at`] — explicit
//! positioned reads with no shared seek cursor — so concurrent attribute
//! queries, listings, and content reads are each atomic with respect to the
//! handle.

use morosfs_error::{MorosError, Result};
use morosfs_ondisk::{
    chain_next, BlockAddr, EntryIter, EntryKind, BLOCK_SIZE, NEXT_PTR_LEN, PAYLOAD_LEN,
};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Byte device ─────────────────────────────────────────────────────────────

/// Byte-addressed read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_bounds(offset: u64, len: usize, total: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| MorosError::Format("read range overflows u64".to_owned()))?;
    if end > total {
        return Err(MorosError::Format(format!(
            "read out of bounds: offset={offset} len={len} image_len={total}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style positioned I/O.
///
/// `std::os::unix::fs::FileExt::read_exact_at` takes `&File` and does not
/// touch the file's seek position, so one shared handle serves concurrent
/// requests without locking.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open the image read-only. Failure here is fatal at mount time.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device, primarily for tests and tooling.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| MorosError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

// ── Resolved entries and attributes ─────────────────────────────────────────

/// Descriptor for a resolved path: the terminal component's directory entry,
/// or the synthetic root entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRef {
    pub kind: EntryKind,
    /// Chain head of the entry's contents (directory blocks or data blocks).
    pub addr: BlockAddr,
    /// Declared content length; 0 for the root and meaningless for dirs.
    pub size: u32,
    pub name: String,
}

impl EntryRef {
    fn root() -> Self {
        Self {
            kind: EntryKind::Directory,
            addr: BlockAddr::ROOT,
            size: 0,
            name: String::new(),
        }
    }
}

/// Attributes reported for a path.
///
/// The format carries no timestamps or ownership; the host boundary fills
/// those with epoch/root constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub kind: EntryKind,
    /// Fixed access mode: 0o755 for directories, 0o644 for files.
    pub perm: u16,
    /// Declared size for files, always 0 for directories.
    pub size: u64,
}

// ── Path-based operations ───────────────────────────────────────────────────

/// The operations the host filesystem boundary consumes.
///
/// Path-based by design: the format has no inode concept, so every request
/// names its target by absolute slash-separated path and is resolved from
/// the root.
pub trait PathOps: Send + Sync {
    /// Report attributes for `path`, or `NotFound`.
    fn getattr(&self, path: &str) -> Result<Attributes>;

    /// List entry names under `path`, prefixed by `.` and `..`.
    ///
    /// An unresolvable path lists only the pseudo-entries; this layer does
    /// not distinguish "not found" from "empty" (check attributes first if
    /// the distinction matters).
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Read up to `size` content bytes starting at `offset`.
    ///
    /// Returns fewer bytes only when the window runs past the declared size
    /// or the physical end of the chain.
    fn read(&self, path: &str, size: u32, offset: u64) -> Result<Vec<u8>>;
}

// ── Image reader ────────────────────────────────────────────────────────────

/// Read-only view of a MOROS filesystem image.
pub struct MorosImage {
    device: Arc<dyn ByteDevice>,
}

impl std::fmt::Debug for MorosImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MorosImage")
            .field("image_len", &self.device.len_bytes())
            .finish()
    }
}

impl MorosImage {
    /// Open an image file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileByteDevice::open(path)?)))
    }

    /// Wrap an already-open device.
    #[must_use]
    pub fn new(device: Arc<dyn ByteDevice>) -> Self {
        Self { device }
    }

    fn read_block(&self, addr: BlockAddr) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        self.device.read_exact_at(addr.0, &mut block)?;
        Ok(block)
    }

    /// Resolve an absolute path to its terminal entry.
    ///
    /// The root (`""` or `"/"`) resolves immediately to the synthetic root
    /// entry. Each component is located by walking the current directory's
    /// block chain; a match on a non-final component descends into that
    /// entry's chain. Any unmatched component is `NotFound`. An entry whose
    /// start block is 0 can never match: the per-block scan terminates at
    /// the sentinel before reaching it.
    pub fn resolve(&self, path: &str) -> Result<EntryRef> {
        let mut components = path.split('/').filter(|c| !c.is_empty());
        let Some(mut wanted) = components.next() else {
            return Ok(EntryRef::root());
        };

        let mut next = BlockAddr::ROOT;
        'chain: while !next.is_nil() {
            let block = self.read_block(next)?;
            next = chain_next(&block);
            for entry in EntryIter::new(&block) {
                if entry.name == wanted {
                    match components.next() {
                        None => return Ok(entry.into()),
                        Some(component) => {
                            wanted = component;
                            next = entry.addr;
                            continue 'chain;
                        }
                    }
                }
            }
        }

        trace!(path, component = wanted, "path resolution miss");
        Err(MorosError::NotFound(path.to_owned()))
    }

    fn list_chain(&self, head: BlockAddr) -> Result<Vec<String>> {
        let mut names = vec![".".to_owned(), "..".to_owned()];
        let mut next = head;
        while !next.is_nil() {
            let block = self.read_block(next)?;
            next = chain_next(&block);
            names.extend(EntryIter::new(&block).map(|entry| entry.name));
        }
        Ok(names)
    }
}

impl From<morosfs_ondisk::DirEntry> for EntryRef {
    fn from(entry: morosfs_ondisk::DirEntry) -> Self {
        Self {
            kind: entry.kind,
            addr: entry.addr,
            size: entry.size,
            name: entry.name,
        }
    }
}

impl PathOps for MorosImage {
    fn getattr(&self, path: &str) -> Result<Attributes> {
        let entry = self.resolve(path)?;
        Ok(match entry.kind {
            EntryKind::Directory => Attributes {
                kind: EntryKind::Directory,
                perm: 0o755,
                size: 0,
            },
            EntryKind::File => Attributes {
                kind: EntryKind::File,
                perm: 0o644,
                size: u64::from(entry.size),
            },
        })
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        match self.resolve(path) {
            Ok(entry) => self.list_chain(entry.addr),
            // Reference behavior: an unresolvable path lists as empty.
            Err(MorosError::NotFound(_)) => Ok(vec![".".to_owned(), "..".to_owned()]),
            Err(other) => Err(other),
        }
    }

    fn read(&self, path: &str, size: u32, offset: u64) -> Result<Vec<u8>> {
        let entry = self.resolve(path)?;

        // Each chain block accounts for exactly PAYLOAD_LEN content bytes of
        // the declared size, regardless of how many bytes it emits. The
        // output window starts once the pending skip drops below a block's
        // payload and is truncated to the requested size at the end.
        let payload_len = PAYLOAD_LEN as u64;
        let mut next = entry.addr;
        let mut remaining = u64::from(entry.size);
        let mut skip = offset;
        let mut out = Vec::new();

        while !next.is_nil() {
            let block = self.read_block(next)?;
            next = chain_next(&block);
            if skip < payload_len {
                let take = usize::try_from(payload_len.min(remaining)).unwrap_or(PAYLOAD_LEN);
                let payload = &block[NEXT_PTR_LEN..NEXT_PTR_LEN + take];
                let start = usize::try_from(skip).unwrap_or(PAYLOAD_LEN).min(take);
                out.extend_from_slice(&payload[start..]);
                skip = 0;
            } else {
                skip -= payload_len;
            }
            remaining = remaining.saturating_sub(payload_len);
        }

        out.truncate(size as usize);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Root chain head block number in the reference layout.
    const ROOT_BLOCK: u32 = 2048 + 2 + 512;

    /// Builds raw MOROS images block by block.
    struct ImageBuilder {
        bytes: Vec<u8>,
        cursors: HashMap<u32, usize>,
    }

    impl ImageBuilder {
        fn new(blocks: u32) -> Self {
            Self {
                bytes: vec![0u8; blocks as usize * BLOCK_SIZE],
                cursors: HashMap::new(),
            }
        }

        fn offset(block: u32) -> usize {
            block as usize * BLOCK_SIZE
        }

        fn set_next(&mut self, block: u32, next: u32) {
            let at = Self::offset(block);
            self.bytes[at..at + 4].copy_from_slice(&next.to_be_bytes());
        }

        fn add_entry(&mut self, dir_block: u32, kind: u8, start: u32, size: u32, name: &str) {
            let cursor = self.cursors.entry(dir_block).or_insert(NEXT_PTR_LEN);
            let mut at = Self::offset(dir_block) + *cursor;
            self.bytes[at] = kind;
            self.bytes[at + 1..at + 5].copy_from_slice(&start.to_be_bytes());
            self.bytes[at + 5..at + 9].copy_from_slice(&size.to_be_bytes());
            self.bytes[at + 9] = u8::try_from(name.len()).unwrap();
            at += 10;
            self.bytes[at..at + name.len()].copy_from_slice(name.as_bytes());
            *cursor += 10 + name.len();
            assert!(*cursor <= BLOCK_SIZE, "entry overflows block {dir_block}");
        }

        /// Write file data as a chain of consecutive blocks from `start`.
        fn write_file(&mut self, start: u32, data: &[u8]) {
            let mut block = start;
            for (index, chunk) in data.chunks(PAYLOAD_LEN).enumerate() {
                let last = (index + 1) * PAYLOAD_LEN >= data.len();
                self.set_next(block, if last { 0 } else { block + 1 });
                let at = Self::offset(block) + NEXT_PTR_LEN;
                self.bytes[at..at + chunk.len()].copy_from_slice(chunk);
                block += 1;
            }
        }

        fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }

        fn build(self) -> MorosImage {
            MorosImage::new(Arc::new(MemByteDevice::new(self.bytes)))
        }
    }

    fn hello_image() -> MorosImage {
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 10, "hello.txt");
        builder.write_file(3000, b"helloworld");
        builder.build()
    }

    #[test]
    fn hello_full_read_returns_declared_size() {
        let fs = hello_image();
        assert_eq!(fs.read("/hello.txt", 10, 0).unwrap(), b"helloworld");
    }

    #[test]
    fn hello_offset_read_returns_tail() {
        let fs = hello_image();
        assert_eq!(fs.read("/hello.txt", 5, 5).unwrap(), b"world");
    }

    #[test]
    fn read_window_in_the_middle() {
        let fs = hello_image();
        assert_eq!(fs.read("/hello.txt", 4, 2).unwrap(), b"llow");
    }

    #[test]
    fn read_past_declared_size_is_short() {
        let fs = hello_image();
        assert_eq!(fs.read("/hello.txt", 64, 0).unwrap(), b"helloworld");
        assert!(fs.read("/hello.txt", 64, 10).unwrap().is_empty());
    }

    #[test]
    fn file_attributes_report_declared_size() {
        let fs = hello_image();
        let attr = fs.getattr("/hello.txt").unwrap();
        assert_eq!(attr.kind, EntryKind::File);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.size, 10);
    }

    #[test]
    fn root_attributes_are_directory_with_zero_size() {
        let fs = hello_image();
        for path in ["/", ""] {
            let attr = fs.getattr(path).unwrap();
            assert_eq!(attr.kind, EntryKind::Directory);
            assert_eq!(attr.perm, 0o755);
            assert_eq!(attr.size, 0);
        }
    }

    #[test]
    fn directory_attributes_ignore_size_field() {
        let mut builder = ImageBuilder::new(3100);
        // A directory entry whose size field carries garbage.
        builder.add_entry(ROOT_BLOCK, 0, 3001, 9999, "sub");
        builder.set_next(3001, 0);
        let fs = builder.build();

        let attr = fs.getattr("/sub").unwrap();
        assert_eq!(attr.kind, EntryKind::Directory);
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn root_listing_has_pseudo_entries_then_layout_order() {
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 1, "b.txt");
        builder.add_entry(ROOT_BLOCK, 0, 3001, 0, "a");
        builder.add_entry(ROOT_BLOCK, 1, 3002, 1, "c.txt");
        let fs = builder.build();

        assert_eq!(fs.list_dir("/").unwrap(), [".", "..", "b.txt", "a", "c.txt"]);
    }

    #[test]
    fn listing_follows_directory_chain_across_blocks() {
        let mut builder = ImageBuilder::new(3100);
        builder.set_next(ROOT_BLOCK, 3050);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 1, "first");
        builder.add_entry(3050, 1, 3001, 1, "second");
        let fs = builder.build();

        assert_eq!(fs.list_dir("/").unwrap(), [".", "..", "first", "second"]);

        // Resolution also crosses the chain boundary.
        assert_eq!(fs.resolve("/second").unwrap().addr, BlockAddr::from_block_number(3001));
    }

    #[test]
    fn empty_subdirectory_lists_only_pseudo_entries() {
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 0, 3001, 0, "sub");
        builder.set_next(3001, 0);
        let fs = builder.build();

        assert_eq!(fs.list_dir("/sub").unwrap(), [".", ".."]);
    }

    #[test]
    fn unresolvable_path_lists_only_pseudo_entries() {
        let fs = hello_image();
        assert_eq!(fs.list_dir("/nope").unwrap(), [".", ".."]);
    }

    #[test]
    fn nested_resolution_and_missing_components() {
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 0, 3001, 0, "docs");
        builder.add_entry(3001, 1, 3002, 5, "notes.txt");
        builder.write_file(3002, b"notes");
        let fs = builder.build();

        assert_eq!(fs.read("/docs/notes.txt", 5, 0).unwrap(), b"notes");

        // Missing at depth 1, 2, and below a file.
        assert!(matches!(fs.getattr("/missing"), Err(MorosError::NotFound(_))));
        assert!(matches!(
            fs.getattr("/docs/missing"),
            Err(MorosError::NotFound(_))
        ));
        assert!(matches!(
            fs.getattr("/docs/notes.txt/deeper"),
            Err(MorosError::NotFound(_))
        ));
    }

    #[test]
    fn zero_start_block_never_matches_even_by_name() {
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 0, 10, "ghost");
        let fs = builder.build();

        assert!(matches!(fs.getattr("/ghost"), Err(MorosError::NotFound(_))));
    }

    fn chain_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn multi_block_file_reads_span_the_chain() {
        let content = chain_content(700);
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 700, "big.bin");
        builder.write_file(3000, &content);
        let fs = builder.build();

        assert_eq!(fs.read("/big.bin", 700, 0).unwrap(), content);
        // Window straddling the 508-byte block boundary.
        assert_eq!(fs.read("/big.bin", 16, 500).unwrap(), &content[500..516]);
        // Window entirely within the second block.
        assert_eq!(fs.read("/big.bin", 100, 600).unwrap(), &content[600..700]);
    }

    #[test]
    fn sequential_windows_reproduce_full_read() {
        let content = chain_content(1200);
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 1200, "big.bin");
        builder.write_file(3000, &content);
        let fs = builder.build();

        let full = fs.read("/big.bin", 1200, 0).unwrap();
        let mut stitched = fs.read("/big.bin", 256, 0).unwrap();
        stitched.extend(fs.read("/big.bin", 1200 - 256, 256).unwrap());
        assert_eq!(stitched, full);
        assert_eq!(full, content);
    }

    #[test]
    fn file_backed_device_serves_the_same_image() {
        let content = chain_content(600);
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 600, "disk.bin");
        builder.write_file(3000, &content);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moros.img");
        std::fs::write(&path, builder.into_bytes()).unwrap();

        let fs = MorosImage::open(&path).unwrap();
        assert_eq!(fs.read("/disk.bin", 600, 0).unwrap(), content);
        assert_eq!(fs.list_dir("/").unwrap(), [".", "..", "disk.bin"]);
    }

    #[test]
    fn chain_pointer_past_image_end_is_a_format_error() {
        let mut builder = ImageBuilder::new(3100);
        builder.add_entry(ROOT_BLOCK, 1, 3000, 10, "dangling");
        builder.set_next(3000, 4_000_000);
        let fs = builder.build();

        assert!(matches!(
            fs.read("/dangling", 10, 0),
            Err(MorosError::Format(_))
        ));
    }

    #[test]
    fn opening_missing_image_fails() {
        assert!(MorosImage::open("/no/such/image.img").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn windowed_reads_concatenate_to_full_read(
            size in 1usize..1400,
            split in 0usize..1400,
        ) {
            let content = chain_content(size);
            let mut builder = ImageBuilder::new(3100);
            builder.add_entry(ROOT_BLOCK, 1, 3000, size as u32, "f");
            builder.write_file(3000, &content);
            let fs = builder.build();

            let full = fs.read("/f", size as u32, 0).unwrap();
            prop_assert_eq!(&full, &content);

            let split = split.min(size);
            let mut stitched = fs.read("/f", split as u32, 0).unwrap();
            stitched.extend(fs.read("/f", (size - split) as u32, split as u64).unwrap());
            prop_assert_eq!(stitched, full);
        }
    }
}
