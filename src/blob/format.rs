//! On-disk encoding of blob records, handles, indices and footers.
//!
//! Every structure here is framed by hand and guarded by a CRC32C
//! (Castagnoli) checksum where it touches disk. All fixed-width integers
//! are little-endian; all variable-width integers are LEB128 varints.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};
use integer_encoding::VarInt;

use crate::error::{Error, Result};

pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Number of bytes preceding every record payload.
///
/// ```text
/// +-----------+----------------+---------------+-------------+
/// |crc32c: u32|record_size: u32|compression: u8|reserved: [3]|
/// +-----------+----------------+---------------+-------------+
/// ```
///
/// The checksum covers everything after itself, payload included.
pub const BLOB_HEADER_SIZE: usize = 12;

/// Leading byte of an encoded [`BlobIndex`].
///
/// This constant is shared with the enclosing engine's value-type
/// numbering: no inline value handed to the table layer may begin with it,
/// otherwise it would be mistaken for a pointer on the way back out.
pub const BLOB_INDEX_TAG: u8 = 1;

/// Identifies a file as a blob file. First 64 bits of sha1("shaledb/blob").
pub const BLOB_FILE_MAGIC: u64 = 0x3e9a21b164750974;

/// Per-record compression algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Snappy),
            other => Err(Error::InvalidArgument(format!(
                "unknown compression type: {other}"
            ))),
        }
    }
}

fn put_length_prefixed_slice(dst: &mut Vec<u8>, value: &[u8]) {
    dst.extend_from_slice(&(value.len() as u64).encode_var_vec());
    dst.extend_from_slice(value);
}

fn get_length_prefixed_slice<'a>(src: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = get_varint64(src)? as usize;
    if src.len() < len {
        return None;
    }
    let (value, rest) = src.split_at(len);
    *src = rest;
    Some(value)
}

fn get_varint64(src: &mut &[u8]) -> Option<u64> {
    let (value, read) = u64::decode_var(*src)?;
    *src = &src[read..];
    Some(value)
}

/// A user key-value pair as it appears inside a blob file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BlobRecord {
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        put_length_prefixed_slice(dst, &self.key);
        put_length_prefixed_slice(dst, &self.value);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let key = get_length_prefixed_slice(&mut src)
            .ok_or_else(|| Error::corruption("BlobRecord", "truncated key"))?
            .to_vec();
        let value = get_length_prefixed_slice(&mut src)
            .ok_or_else(|| Error::corruption("BlobRecord", "truncated value"))?
            .to_vec();
        if !src.is_empty() {
            return Err(Error::corruption("BlobRecord", "trailing bytes"));
        }
        Ok(Self { key, value })
    }
}

/// Locates one encoded record payload within a single blob file.
///
/// `offset` points at the first byte *after* the record header; `size` is
/// the on-disk payload length, post-compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlobHandle {
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.offset.encode_var_vec());
        dst.extend_from_slice(&self.size.encode_var_vec());
    }

    pub fn decode_from(src: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(src)
            .ok_or_else(|| Error::corruption("BlobHandle", "truncated offset"))?;
        let size =
            get_varint64(src).ok_or_else(|| Error::corruption("BlobHandle", "truncated size"))?;
        Ok(Self { offset, size })
    }
}

/// The pointer stored in a table in place of a separated value.
///
/// ```text
/// +-------+---------------------+------------------+----------------+
/// |tag: u8|file_number: varint64|offset: varint64  |size: varint64  |
/// +-------+---------------------+------------------+----------------+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobIndex {
    pub file_number: u64,
    pub handle: BlobHandle,
}

impl BlobIndex {
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.push(BLOB_INDEX_TAG);
        dst.extend_from_slice(&self.file_number.encode_var_vec());
        self.handle.encode_into(dst);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        match src.first() {
            Some(&BLOB_INDEX_TAG) => src = &src[1..],
            Some(other) => {
                return Err(Error::Corruption(
                    "BlobIndex",
                    format!("unexpected tag byte: {other}"),
                ))
            }
            None => return Err(Error::corruption("BlobIndex", "empty")),
        }
        let file_number = get_varint64(&mut src)
            .ok_or_else(|| Error::corruption("BlobIndex", "truncated file number"))?;
        let handle = BlobHandle::decode_from(&mut src)
            .map_err(|err| Error::Corruption("BlobIndex", err.to_string()))?;
        if !src.is_empty() {
            return Err(Error::corruption("BlobIndex", "trailing bytes"));
        }
        Ok(Self {
            file_number,
            handle,
        })
    }
}

/// Manager-level descriptor of a live blob file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobFileMeta {
    pub file_number: u64,
    pub file_size: u64,
}

impl BlobFileMeta {
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.file_number.encode_var_vec());
        dst.extend_from_slice(&self.file_size.encode_var_vec());
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let file_number = get_varint64(&mut src)
            .ok_or_else(|| Error::corruption("BlobFileMeta", "truncated file number"))?;
        let file_size = get_varint64(&mut src)
            .ok_or_else(|| Error::corruption("BlobFileMeta", "truncated file size"))?;
        if !src.is_empty() {
            return Err(Error::corruption("BlobFileMeta", "trailing bytes"));
        }
        Ok(Self {
            file_number,
            file_size,
        })
    }
}

/// Fixed-size trailer of every blob file.
///
/// ```text
/// +-------------------------------+-------------+-----------+
/// |meta_index_handle, zero-padded |magic: u64 LE|crc32c: u32|
/// |to 20 bytes                    |             |           |
/// +-------------------------------+-------------+-----------+
/// ```
///
/// The checksum covers all preceding footer bytes. The meta-index handle is
/// reserved for a future per-file meta block; writers currently emit a zero
/// handle and readers accept any well-formed one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobFileFooter {
    pub meta_index_handle: BlobHandle,
}

impl BlobFileFooter {
    /// Two maximum-length varint64s, the magic and the checksum.
    pub const ENCODED_LENGTH: usize = 20 + 8 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LENGTH);
        self.meta_index_handle.encode_into(&mut buf);
        // Pad the variable handle encoding to a fixed size.
        buf.resize(Self::ENCODED_LENGTH - 12, 0);
        let mut fixed = [0u8; 8];
        LittleEndian::write_u64(&mut fixed, BLOB_FILE_MAGIC);
        buf.extend_from_slice(&fixed);
        let crc = CRC32.checksum(&buf);
        LittleEndian::write_u32(&mut fixed[..4], crc);
        buf.extend_from_slice(&fixed[..4]);
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != Self::ENCODED_LENGTH {
            return Err(Error::Corruption(
                "BlobFileFooter",
                format!("expected {} bytes, got {}", Self::ENCODED_LENGTH, src.len()),
            ));
        }
        let magic = LittleEndian::read_u64(&src[20..28]);
        if magic != BLOB_FILE_MAGIC {
            return Err(Error::corruption("BlobFileFooter", "magic number"));
        }
        let checksum = LittleEndian::read_u32(&src[28..32]);
        if CRC32.checksum(&src[..28]) != checksum {
            return Err(Error::corruption("BlobFileFooter", "checksum"));
        }
        let mut handle_bytes = &src[..20];
        let meta_index_handle = BlobHandle::decode_from(&mut handle_bytes)
            .map_err(|err| Error::Corruption("BlobFileFooter", err.to_string()))?;
        Ok(Self { meta_index_handle })
    }
}

/// Assembles the header and payload for one record on the write path.
///
/// The encoder chooses whether to keep the compressed form: when the
/// configured algorithm fails to shrink the serialized record the payload
/// is stored raw, and the header records the algorithm actually used.
pub struct BlobEncoder {
    compression: CompressionType,
    header: [u8; BLOB_HEADER_SIZE],
    record_buffer: Vec<u8>,
    compressed_buffer: Vec<u8>,
    compressed: bool,
}

impl BlobEncoder {
    pub fn new(compression: CompressionType) -> Self {
        Self {
            compression,
            header: [0u8; BLOB_HEADER_SIZE],
            record_buffer: Vec::new(),
            compressed_buffer: Vec::new(),
            compressed: false,
        }
    }

    pub fn encode_record(&mut self, record: &BlobRecord) -> Result<()> {
        self.record_buffer.clear();
        self.compressed_buffer.clear();
        record.encode_into(&mut self.record_buffer);

        let compression = match self.compression {
            CompressionType::None => CompressionType::None,
            CompressionType::Snappy => {
                self.compressed_buffer = snap::raw::Encoder::new()
                    .compress_vec(&self.record_buffer)
                    .map_err(|err| {
                        Error::InvalidArgument(format!("snappy compression failed: {err}"))
                    })?;
                if self.compressed_buffer.len() < self.record_buffer.len() {
                    CompressionType::Snappy
                } else {
                    CompressionType::None
                }
            }
        };
        self.compressed = compression == CompressionType::Snappy;

        let payload_len = self.payload().len();
        if payload_len > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "blob record of {payload_len} bytes exceeds the format limit"
            )));
        }

        self.header[9..].fill(0);
        LittleEndian::write_u32(&mut self.header[4..8], payload_len as u32);
        self.header[8] = compression as u8;
        let mut digest = CRC32.digest();
        digest.update(&self.header[4..]);
        digest.update(self.payload());
        let crc = digest.finalize();
        LittleEndian::write_u32(&mut self.header[..4], crc);
        Ok(())
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        if self.compressed {
            &self.compressed_buffer
        } else {
            &self.record_buffer
        }
    }

    pub fn encoded_size(&self) -> usize {
        BLOB_HEADER_SIZE + self.payload().len()
    }
}

/// Decodes records framed by [`BlobEncoder`].
///
/// `decode_header` consumes exactly the 12 header bytes and keeps the
/// checksummed tail around so the CRC can be extended over the payload in
/// `decode_record` without re-reading the header.
#[derive(Default)]
pub struct BlobDecoder {
    crc: u32,
    header_tail: [u8; 8],
    record_size: u32,
    compression: CompressionType,
}

impl BlobDecoder {
    pub fn decode_header(&mut self, src: &mut &[u8]) -> Result<()> {
        if src.len() < BLOB_HEADER_SIZE {
            return Err(Error::corruption("BlobHeader", "truncated"));
        }
        let (header, rest) = src.split_at(BLOB_HEADER_SIZE);
        self.crc = LittleEndian::read_u32(&header[..4]);
        self.header_tail.copy_from_slice(&header[4..]);
        self.record_size = LittleEndian::read_u32(&header[4..8]);
        self.compression = CompressionType::from_u8(header[8]).map_err(|_| {
            Error::Corruption("BlobHeader", format!("unknown compression type: {}", header[8]))
        })?;
        *src = rest;
        Ok(())
    }

    /// On-disk payload size announced by the last decoded header.
    pub fn record_size(&self) -> usize {
        self.record_size as usize
    }

    pub fn decode_record(
        &self,
        src: &mut &[u8],
        record: &mut BlobRecord,
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        if src.len() < self.record_size as usize {
            return Err(Error::corruption("BlobRecord", "truncated payload"));
        }
        let (payload, rest) = src.split_at(self.record_size as usize);
        *src = rest;

        let mut digest = CRC32.digest();
        digest.update(&self.header_tail);
        digest.update(payload);
        if digest.finalize() != self.crc {
            return Err(Error::corruption("BlobRecord", "checksum mismatch"));
        }

        *record = match self.compression {
            CompressionType::None => BlobRecord::decode(payload)?,
            CompressionType::Snappy => {
                *scratch = snap::raw::Decoder::new()
                    .decompress_vec(payload)
                    .map_err(|err| Error::Corruption("BlobRecord", err.to_string()))?;
                BlobRecord::decode(scratch)?
            }
        };
        Ok(())
    }
}
