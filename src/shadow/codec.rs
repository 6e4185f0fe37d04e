//! # Shadow-File Wire Format
//!
//! Bit-exact encode and decode of the two on-disk blocks the writer
//! publishes each tick. All multi-byte fields are little-endian; each
//! block ends in (or, for the header, contains) a CRC-32 computed over
//! all preceding bytes of the same block.
//!
//! ## Header (36 bytes, at offset 0)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------
//! 0       4     magic "STHD"
//! 4       4     page_size
//! 8       8     tick
//! 16      8     index_offset  (byte offset of index block)
//! 24      8     index_length  (byte length of index block)
//! 32      4     checksum      (CRC-32 over bytes 0..32)
//! ```
//!
//! ## Index Block (20 + 16 * num_entries bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------
//! 0       4     magic "STIX"
//! 4       8     tick
//! 12      4     num_entries
//! 16      16*N  entries: page, shadow_page, length, checksum
//! 16+16N  4     checksum (CRC-32 over bytes 0..16+16N)
//! ```
//!
//! The writer writes the index block first and the header second, each
//! freshly checksummed. A reader that finds a valid header but an index
//! whose tick differs has raced a publication; it must treat the read
//! as torn and retry later. Entry order on disk is strictly ascending
//! by logical page, mirroring the in-memory index.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::shadow::index::IndexEntry;

pub const MD_HEADER_MAGIC: &[u8; 4] = b"STHD";
pub const MD_INDEX_MAGIC: &[u8; 4] = b"STIX";

pub const MD_HEADER_SIZE: usize = 36;
/// Fixed bytes of an index block: 16-byte prefix plus trailing CRC.
pub const MD_INDEX_BASE_SIZE: usize = 20;
pub const MD_INDEX_ENTRY_SIZE: usize = 16;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32 used for header, index block, and page-image checksums.
pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Byte length of an index block holding `num_entries` entries.
pub fn index_size(num_entries: u32) -> u64 {
    (MD_INDEX_BASE_SIZE + num_entries as usize * MD_INDEX_ENTRY_SIZE) as u64
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MdHeader {
    magic: [u8; 4],
    page_size: U32,
    tick: U64,
    index_offset: U64,
    index_length: U64,
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<MdHeader>() == MD_HEADER_SIZE);

impl MdHeader {
    pub fn new(page_size: u32, tick: u64, index_offset: u64, index_length: u64) -> Self {
        let mut header = Self {
            magic: *MD_HEADER_MAGIC,
            page_size: U32::new(page_size),
            tick: U64::new(tick),
            index_offset: U64::new(index_offset),
            index_length: U64::new(index_length),
            checksum: U32::new(0),
        };
        let sum = checksum(&header.as_bytes()[..MD_HEADER_SIZE - 4]);
        header.checksum = U32::new(sum);
        header
    }

    /// Decodes and validates a header image. Any failure here means the
    /// bytes do not (yet) hold a complete header; callers on the read
    /// path treat that as a torn read, not as corruption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= MD_HEADER_SIZE,
            "buffer too small for shadow header: {} < {}",
            bytes.len(),
            MD_HEADER_SIZE
        );

        let header = Self::read_from_bytes(&bytes[..MD_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse shadow header: {:?}", e))?;

        ensure!(
            &header.magic == MD_HEADER_MAGIC,
            "invalid magic bytes in shadow header"
        );

        let expected = header.checksum.get();
        let actual = checksum(&bytes[..MD_HEADER_SIZE - 4]);
        ensure!(
            actual == expected,
            "shadow header checksum mismatch: computed {:08x}, stored {:08x}",
            actual,
            expected
        );

        Ok(header)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn tick(&self) -> u64 {
        self.tick.get()
    }

    pub fn index_offset(&self) -> u64 {
        self.index_offset.get()
    }

    pub fn index_length(&self) -> u64 {
        self.index_length.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MdIndexPrefix {
    magic: [u8; 4],
    tick: U64,
    num_entries: U32,
}

const _: () = assert!(std::mem::size_of::<MdIndexPrefix>() == MD_INDEX_BASE_SIZE - 4);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MdIndexEntry {
    page: U32,
    shadow_page: U32,
    length: U32,
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<MdIndexEntry>() == MD_INDEX_ENTRY_SIZE);

/// Encodes an index block for the given tick. Entries must already be
/// sorted strictly ascending by logical page.
pub fn encode_index(tick: u64, entries: &[IndexEntry]) -> Result<Vec<u8>> {
    let num_entries = u32::try_from(entries.len())
        .map_err(|_| eyre::eyre!("shadow index has too many entries to encode"))?;

    let mut buf = Vec::with_capacity(index_size(num_entries) as usize);

    let prefix = MdIndexPrefix {
        magic: *MD_INDEX_MAGIC,
        tick: U64::new(tick),
        num_entries: U32::new(num_entries),
    };
    buf.extend_from_slice(prefix.as_bytes());

    for entry in entries {
        let page = u32::try_from(entry.page)
            .map_err(|_| eyre::eyre!("logical page {} does not fit the on-disk format", entry.page))?;
        let shadow_page = u32::try_from(entry.shadow_page).map_err(|_| {
            eyre::eyre!(
                "shadow page {} does not fit the on-disk format",
                entry.shadow_page
            )
        })?;
        let wire = MdIndexEntry {
            page: U32::new(page),
            shadow_page: U32::new(shadow_page),
            length: U32::new(entry.length),
            checksum: U32::new(entry.checksum),
        };
        buf.extend_from_slice(wire.as_bytes());
    }

    let sum = checksum(&buf);
    buf.extend_from_slice(&sum.to_le_bytes());

    debug_assert_eq!(buf.len() as u64, index_size(num_entries));
    Ok(buf)
}

/// Decodes an index block, returning its tick and entries. As with the
/// header, any failure is a sign of a torn or incomplete write on the
/// read path.
pub fn decode_index(bytes: &[u8]) -> Result<(u64, Vec<IndexEntry>)> {
    ensure!(
        bytes.len() >= MD_INDEX_BASE_SIZE,
        "buffer too small for shadow index block: {} < {}",
        bytes.len(),
        MD_INDEX_BASE_SIZE
    );

    let prefix = MdIndexPrefix::read_from_bytes(&bytes[..MD_INDEX_BASE_SIZE - 4])
        .map_err(|e| eyre::eyre!("failed to parse shadow index prefix: {:?}", e))?;

    ensure!(
        &prefix.magic == MD_INDEX_MAGIC,
        "invalid magic bytes in shadow index block"
    );

    let num_entries = prefix.num_entries.get();
    let total = index_size(num_entries) as usize;
    ensure!(
        bytes.len() >= total,
        "shadow index block truncated: {} < {}",
        bytes.len(),
        total
    );

    let mut stored = [0u8; 4];
    stored.copy_from_slice(&bytes[total - 4..total]);
    let expected = u32::from_le_bytes(stored);
    let actual = checksum(&bytes[..total - 4]);
    ensure!(
        actual == expected,
        "shadow index checksum mismatch: computed {:08x}, stored {:08x}",
        actual,
        expected
    );

    let mut entries = Vec::with_capacity(num_entries as usize);
    let mut offset = MD_INDEX_BASE_SIZE - 4;
    for _ in 0..num_entries {
        let wire = MdIndexEntry::read_from_bytes(&bytes[offset..offset + MD_INDEX_ENTRY_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse shadow index entry: {:?}", e))?;
        entries.push(IndexEntry {
            page: u64::from(wire.page.get()),
            shadow_page: u64::from(wire.shadow_page.get()),
            length: wire.length.get(),
            checksum: wire.checksum.get(),
            ..IndexEntry::default()
        });
        offset += MD_INDEX_ENTRY_SIZE;
    }

    for pair in entries.windows(2) {
        ensure!(
            pair[0].page < pair[1].page,
            "shadow index entries not strictly ascending: {} then {}",
            pair[0].page,
            pair[1].page
        );
    }

    Ok((prefix.tick.get(), entries))
}
