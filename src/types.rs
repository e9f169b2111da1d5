//! Stream type/descriptor records, range information and the
//! variable-sized entry block codec.

use crate::error::{Error, Result};
use crate::ids::Guid;

pub const MAX_STREAM_NAME_LENGTH: usize = 256;

/// High bit of an encoded entry size marks the stream as holding
/// variable-sized entries; the remaining bits carry a size hint used as
/// the fixed block capacity for that stream.
const VARIABLE_ENTRY_SIZE_FLAG: u32 = 0x8000_0000;

pub fn make_variable_entry_size(size_hint: u32) -> u32 {
    VARIABLE_ENTRY_SIZE_FLAG | (size_hint & !VARIABLE_ENTRY_SIZE_FLAG)
}

pub fn is_variable_entry_size(encoded: u32) -> bool {
    encoded & VARIABLE_ENTRY_SIZE_FLAG != 0
}

pub fn entry_size(encoded: u32) -> u32 {
    encoded & !VARIABLE_ENTRY_SIZE_FLAG
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamTypeFlags: u32 {
        const NONE = 0x0;
        const TEMPORAL_ORDER = 0x1;
        const BIG_ENDIAN = 0x2;
        const ARCH_32_BIT = 0x4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        const NONE = 0x0;
        const HIDDEN = 0x1;
        const DYNAMIC = 0x2;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamEnumFilter: u32 {
        const REGULAR = 0x1;
        const HIDDEN = 0x2;
        const DYNAMIC = 0x4;
        const ALL = Self::REGULAR.bits() | Self::HIDDEN.bits() | Self::DYNAMIC.bits();
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamAccessFlags: u32 {
        const NONE = 0x0;
        const SEQUENTIAL_SCAN = 0x1;
        const RANDOM_ACCESS = 0x2;
        const SYNCHRONOUS = 0x4;
        const REVERSE_QUERY = 0x8;
        const REVERSE_READ = 0x10;
        const USER_FLAG0 = 0x20;
        const USER_FLAG1 = 0x40;
        const USER_FLAG2 = 0x80;
        const USER_FLAG3 = 0x100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTypeDescriptor {
    pub name: String,
    pub id: Guid,
    pub flags: StreamTypeFlags,
    pub encoded_entry_size: u32,
}

const TEMPORAL_ORDER_MIN_ENTRY_SIZE: u32 = 6; // sizeof(CycleCount) in the wire format

impl StreamTypeDescriptor {
    pub fn new(
        name: impl Into<String>,
        id: Guid,
        flags: StreamTypeFlags,
        encoded_entry_size: u32,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() >= MAX_STREAM_NAME_LENGTH {
            return Err(Error::Argument("stream type name length invalid".into()));
        }

        let variable = is_variable_entry_size(encoded_entry_size);
        let size = entry_size(encoded_entry_size);
        if !variable && size == 0 {
            return Err(Error::Argument("entry size must be nonzero".into()));
        }

        if flags.contains(StreamTypeFlags::TEMPORAL_ORDER) {
            if variable {
                return Err(Error::Argument(
                    "temporal order streams cannot have variable-sized entries".into(),
                ));
            }
            if size < TEMPORAL_ORDER_MIN_ENTRY_SIZE {
                return Err(Error::Argument(
                    "temporal order entries must be at least 6 bytes to hold a cycle count".into(),
                ));
            }
        }

        Ok(StreamTypeDescriptor {
            name,
            id,
            flags,
            encoded_entry_size,
        })
    }

    pub fn is_variable(&self) -> bool {
        is_variable_entry_size(self.encoded_entry_size)
    }

    pub fn entry_size(&self) -> u32 {
        entry_size(self.encoded_entry_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub flags: StreamFlags,
    pub stream_type: StreamTypeDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

pub const INVALID_ENTRY_INDEX: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRangeInformation {
    pub index: Range,
    pub cycle: Range,
    pub time: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSegmentLink {
    pub stream: crate::ids::StreamId,
    pub sequence_number: crate::ids::SequenceNumber,
}

/// Control element stamped at the end of a segment's line in the buffer
/// pool. Fields above the midline are written by the client during
/// append; fields below are stamped by the server when the segment is
/// closed, so a reader never needs to trust client-supplied aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentControlElement {
    pub cookie: u64,
    pub link: StreamSegmentLink,

    // Client-writable during append.
    pub raw_entry_count: u32,

    // Server-stamped on close.
    pub entry_count: u32,
    pub start_index: u64,
    pub start_cycle: u64,
    pub end_cycle: u64,
    pub start_time: u64,
    pub end_time: u64,
}

/// Encoded size of `SegmentControlElement`: two `u64`s (cookie, stream
/// id+sequence number), five `u32`/`u64` aggregate fields below.
pub const SEGMENT_CONTROL_ELEMENT_SIZE: usize = 8 + 4 + 8 + 4 + 4 + 8 + 8 + 8 + 8 + 8;

impl SegmentControlElement {
    pub fn empty(link: StreamSegmentLink, cookie: u64) -> Self {
        SegmentControlElement {
            cookie,
            link,
            raw_entry_count: 0,
            entry_count: 0,
            start_index: INVALID_ENTRY_INDEX,
            start_cycle: 0,
            end_cycle: 0,
            start_time: 0,
            end_time: 0,
        }
    }

    /// Packs the control element into its little-endian wire/in-memory
    /// layout, the same field-by-field technique `VDataBlockHeader` and
    /// the message header use instead of a `#[repr(C)]` reinterpret.
    pub fn encode(self) -> [u8; SEGMENT_CONTROL_ELEMENT_SIZE] {
        let mut buf = [0u8; SEGMENT_CONTROL_ELEMENT_SIZE];
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        use byteorder::{LittleEndian, WriteBytesExt};
        cursor.write_u64::<LittleEndian>(self.cookie).unwrap();
        cursor.write_u32::<LittleEndian>(self.link.stream.0).unwrap();
        cursor.write_u64::<LittleEndian>(self.link.sequence_number).unwrap();
        cursor.write_u32::<LittleEndian>(self.raw_entry_count).unwrap();
        cursor.write_u32::<LittleEndian>(self.entry_count).unwrap();
        cursor.write_u64::<LittleEndian>(self.start_index).unwrap();
        cursor.write_u64::<LittleEndian>(self.start_cycle).unwrap();
        cursor.write_u64::<LittleEndian>(self.end_cycle).unwrap();
        cursor.write_u64::<LittleEndian>(self.start_time).unwrap();
        cursor.write_u64::<LittleEndian>(self.end_time).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        use byteorder::{LittleEndian, ReadBytesExt};
        let mut cursor = std::io::Cursor::new(bytes);
        let cookie = cursor.read_u64::<LittleEndian>().unwrap();
        let stream = crate::ids::StreamId(cursor.read_u32::<LittleEndian>().unwrap());
        let sequence_number = cursor.read_u64::<LittleEndian>().unwrap();
        let raw_entry_count = cursor.read_u32::<LittleEndian>().unwrap();
        let entry_count = cursor.read_u32::<LittleEndian>().unwrap();
        let start_index = cursor.read_u64::<LittleEndian>().unwrap();
        let start_cycle = cursor.read_u64::<LittleEndian>().unwrap();
        let end_cycle = cursor.read_u64::<LittleEndian>().unwrap();
        let start_time = cursor.read_u64::<LittleEndian>().unwrap();
        let end_time = cursor.read_u64::<LittleEndian>().unwrap();
        SegmentControlElement {
            cookie,
            link: StreamSegmentLink { stream, sequence_number },
            raw_entry_count,
            entry_count,
            start_index,
            start_cycle,
            end_cycle,
            start_time,
            end_time,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamStatistics {
    pub compressed_size: u64,
    pub entry_count: u64,
    pub raw_entry_count: u64,
    pub ranges: StreamRangeInformation,
}

#[derive(Debug, Clone)]
pub struct StreamQueryInformation {
    pub descriptor: StreamDescriptor,
    pub stats: StreamStatistics,
}

// --- Variable-sized entry block codec -------------------------------
//
// Variable data is chained across fixed-size blocks. Each block starts
// with a two-byte header: the continuation bit marks "another block
// follows for this entry", the low fourteen bits carry the number of
// payload bytes actually used in this block.

pub const VARIABLE_BLOCK_HEADER_SIZE: usize = 2;
const CONTINUATION_BIT: u16 = 0x4000;
const SIZE_MASK: u16 = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VDataBlockHeader {
    pub continuation: bool,
    pub size: u16,
}

impl VDataBlockHeader {
    pub fn encode(self) -> u16 {
        let mut v = self.size & SIZE_MASK;
        if self.continuation {
            v |= CONTINUATION_BIT;
        }
        v
    }

    pub fn decode(raw: u16) -> Self {
        VDataBlockHeader {
            continuation: raw & CONTINUATION_BIT != 0,
            size: raw & SIZE_MASK,
        }
    }
}

/// Writes `data` into consecutive fixed-size blocks of `block_size`
/// bytes (header included) starting at `buffer[0]`. Returns the number
/// of blocks written. `buffer` must be large enough to hold every block.
pub fn write_variable_data(buffer: &mut [u8], block_size: usize, data: &[u8]) -> Result<usize> {
    let capacity = block_size
        .checked_sub(VARIABLE_BLOCK_HEADER_SIZE)
        .ok_or_else(|| Error::Argument("block size too small for header".into()))?;
    if capacity == 0 || capacity as u32 > SIZE_MASK as u32 {
        return Err(Error::Argument("block capacity out of range".into()));
    }

    let blocks_needed = data.len().div_ceil(capacity).max(1);
    if buffer.len() < blocks_needed * block_size {
        return Err(Error::ArgumentOutOfBounds);
    }

    let mut written = 0usize;
    let mut block = 0usize;
    loop {
        let remaining = data.len() - written;
        let chunk_len = remaining.min(capacity);
        let more = remaining > chunk_len;

        let offset = block * block_size;
        let header = VDataBlockHeader {
            continuation: more,
            size: chunk_len as u16,
        };
        buffer[offset..offset + VARIABLE_BLOCK_HEADER_SIZE]
            .copy_from_slice(&header.encode().to_le_bytes());

        let payload_start = offset + VARIABLE_BLOCK_HEADER_SIZE;
        buffer[payload_start..payload_start + chunk_len]
            .copy_from_slice(&data[written..written + chunk_len]);
        if chunk_len < capacity {
            buffer[payload_start + chunk_len..payload_start + capacity].fill(0);
        }

        written += chunk_len;
        block += 1;

        if !more {
            break;
        }
    }

    Ok(block)
}

/// Reads a chained variable-sized entry starting at block 0 of `buffer`.
pub fn read_variable_data(buffer: &[u8], block_size: usize) -> Result<Vec<u8>> {
    let capacity = block_size
        .checked_sub(VARIABLE_BLOCK_HEADER_SIZE)
        .ok_or_else(|| Error::Argument("block size too small for header".into()))?;

    let mut out = Vec::new();
    let mut block = 0usize;
    loop {
        let offset = block * block_size;
        if offset + block_size > buffer.len() {
            return Err(Error::ArgumentOutOfBounds);
        }
        let header = VDataBlockHeader::decode(u16::from_le_bytes(
            buffer[offset..offset + VARIABLE_BLOCK_HEADER_SIZE]
                .try_into()
                .unwrap(),
        ));
        let payload_start = offset + VARIABLE_BLOCK_HEADER_SIZE;
        let size = header.size as usize;
        if size > capacity {
            return Err(Error::InvalidOperation(
                "corrupt variable data block header".into(),
            ));
        }
        out.extend_from_slice(&buffer[payload_start..payload_start + size]);

        block += 1;
        if !header.continuation {
            break;
        }
    }

    Ok(out)
}

/// Scans forward from block 0, counting completed entries (a completed
/// entry ends at a block whose continuation bit is clear), and returns
/// the block offset at which entry `index` begins.
pub fn find_variable_entry(buffer: &[u8], block_size: usize, index: usize) -> Result<usize> {
    let mut block = 0usize;
    let mut entry = 0usize;
    let mut entry_start_block = 0usize;

    loop {
        let offset = block * block_size;
        if offset + block_size > buffer.len() {
            return Err(Error::NotFound("variable entry index out of range".into()));
        }
        let header = VDataBlockHeader::decode(u16::from_le_bytes(
            buffer[offset..offset + VARIABLE_BLOCK_HEADER_SIZE]
                .try_into()
                .unwrap(),
        ));

        if !header.continuation {
            if entry == index {
                return Ok(entry_start_block * block_size);
            }
            entry += 1;
            entry_start_block = block + 1;
        }

        block += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_single_block_entry() {
        let block_size = 16;
        let mut buf = vec![0u8; block_size];
        let data = b"hello";
        let blocks = write_variable_data(&mut buf, block_size, data).unwrap();
        assert_eq!(blocks, 1);
        let read_back = read_variable_data(&buf, block_size).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn chains_across_multiple_blocks() {
        let block_size = 8; // capacity 6 bytes per block
        let data: Vec<u8> = (0u8..20).collect();
        let mut buf = vec![0u8; block_size * 4];
        let blocks = write_variable_data(&mut buf, block_size, &data).unwrap();
        assert_eq!(blocks, 4);
        let read_back = read_variable_data(&buf, block_size).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn temporal_order_rejects_variable_entries() {
        let encoded = make_variable_entry_size(32);
        let err = StreamTypeDescriptor::new(
            "t",
            Guid::NIL,
            StreamTypeFlags::TEMPORAL_ORDER,
            encoded,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn segment_control_element_round_trips_through_encode_decode() {
        let link = StreamSegmentLink {
            stream: crate::ids::StreamId(4),
            sequence_number: 9,
        };
        let mut control = SegmentControlElement::empty(link, 0xC0FFEE);
        control.raw_entry_count = 7;
        control.entry_count = 7;
        control.start_index = 42;
        control.start_cycle = 100;
        control.end_cycle = 107;
        control.start_time = 5;
        control.end_time = 12;

        let encoded = control.encode();
        assert_eq!(encoded.len(), SEGMENT_CONTROL_ELEMENT_SIZE);
        let decoded = SegmentControlElement::decode(&encoded);
        assert_eq!(decoded, control);
    }

    #[test]
    fn finds_second_chained_entry() {
        let block_size = 8;
        let mut buf = vec![0u8; block_size * 8];
        let first = write_variable_data(&mut buf, block_size, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
        write_variable_data(&mut buf[first * block_size..], block_size, &[9, 9]).unwrap();

        let offset = find_variable_entry(&buf, block_size, 1).unwrap();
        assert_eq!(offset, first * block_size);
    }
}
