//! Flat sorted-table format, the default base for the blob adapter.
//!
//! # File Format
//!
//! ```text
//! +---------------+
//! | entries       |  key_len: u32 | value_len: u32 | key | value
//! +---------------+
//! | index         |  key_len: u32 | key | offset: u64, one per entry
//! +---------------+
//! | footer (32 B) |  index_offset: u64 | entry_count: u64 |
//! |               |  data_crc32c: u32 | magic: u64 | crc32c: u32
//! +---------------+
//! ```
//!
//! All integers are little-endian. `data_crc` covers every byte before the
//! footer (entries and index) and backs checksum verification; the final
//! checksum covers the preceding footer bytes. The whole index is loaded
//! into memory at open and binary-searched per lookup.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use crc::Digest;

use crate::blob::format::CRC32;
use crate::error::{Error, Result};

use super::{
    TableBuilder, TableBuildResult, TableFactory, TableIterator, TableProperties, TableReader,
};

/// Identifies a flat table file. First 64 bits of sha1("shaledb/table").
const TABLE_MAGIC: u64 = 0xa45adbaf7edc3d2b;

const FOOTER_LENGTH: usize = 8 + 8 + 4 + 8 + 4;

const ENTRY_HEADER_LENGTH: usize = 8;

/// Factory for the flat format.
pub struct BaseTableFactory;

impl TableFactory for BaseTableFactory {
    fn name(&self) -> &'static str {
        "FlatTable"
    }

    fn new_builder(&self, path: &Path) -> Result<Box<dyn TableBuilder>> {
        Ok(Box::new(BaseTableBuilder::create(path)?))
    }

    fn new_reader(&self, path: &Path) -> Result<Box<dyn TableReader>> {
        Ok(Box::new(BaseTableReader::open(path)?))
    }
}

pub struct BaseTableBuilder {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    index: Vec<(Vec<u8>, u64)>,
    offset: u64,
    digest: Digest<'static, u32>,
    last_key: Option<Vec<u8>>,
    closed: bool,
}

impl BaseTableBuilder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            path,
            index: Vec::new(),
            offset: 0,
            digest: CRC32.digest(),
            last_key: None,
            closed: false,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.digest.update(bytes);
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("table builder already closed".to_string()))?
            .write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

impl TableBuilder for BaseTableBuilder {
    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidArgument(format!(
                    "keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }

        let mut entry = Vec::with_capacity(ENTRY_HEADER_LENGTH + key.len() + value.len());
        let mut lens = [0u8; ENTRY_HEADER_LENGTH];
        LittleEndian::write_u32(&mut lens[..4], key.len() as u32);
        LittleEndian::write_u32(&mut lens[4..], value.len() as u32);
        entry.extend_from_slice(&lens);
        entry.extend_from_slice(key);
        entry.extend_from_slice(value);

        self.index.push((key.to_vec(), self.offset));
        self.write_all(&entry)?;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> Result<TableBuildResult> {
        let index_offset = self.offset;
        let index = std::mem::take(&mut self.index);
        for (key, offset) in &index {
            let mut buf = Vec::with_capacity(4 + key.len() + 8);
            let mut fixed = [0u8; 8];
            LittleEndian::write_u32(&mut fixed[..4], key.len() as u32);
            buf.extend_from_slice(&fixed[..4]);
            buf.extend_from_slice(key);
            LittleEndian::write_u64(&mut fixed, *offset);
            buf.extend_from_slice(&fixed);
            self.write_all(&buf)?;
        }

        let data_crc = std::mem::replace(&mut self.digest, CRC32.digest()).finalize();
        let mut footer = [0u8; FOOTER_LENGTH];
        LittleEndian::write_u64(&mut footer[..8], index_offset);
        LittleEndian::write_u64(&mut footer[8..16], index.len() as u64);
        LittleEndian::write_u32(&mut footer[16..20], data_crc);
        LittleEndian::write_u64(&mut footer[20..28], TABLE_MAGIC);
        let crc = CRC32.checksum(&footer[..28]);
        LittleEndian::write_u32(&mut footer[28..], crc);

        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::InvalidArgument("table builder already closed".to_string()))?;
        file.write_all(&footer)?;
        file.flush()?;
        file.get_ref().sync_all()?;
        self.closed = true;

        Ok(TableBuildResult {
            num_entries: index.len() as u64,
            blob_files: Vec::new(),
        })
    }

    fn abandon(&mut self) -> Result<()> {
        self.closed = true;
        self.file.take();
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for BaseTableBuilder {
    fn drop(&mut self) {
        if !self.closed {
            self.file.take();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct BaseTableReader {
    file: File,
    index: Arc<Vec<(Vec<u8>, u64)>>,
    index_offset: u64,
    data_crc: u32,
    file_size: u64,
}

impl BaseTableReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_LENGTH as u64 {
            return Err(Error::corruption(
                "TableFooter",
                "file too small to hold a footer",
            ));
        }

        let mut footer = [0u8; FOOTER_LENGTH];
        file.read_exact_at(&mut footer, file_size - FOOTER_LENGTH as u64)?;
        if LittleEndian::read_u64(&footer[20..28]) != TABLE_MAGIC {
            return Err(Error::corruption("TableFooter", "magic number"));
        }
        if CRC32.checksum(&footer[..28]) != LittleEndian::read_u32(&footer[28..]) {
            return Err(Error::corruption("TableFooter", "checksum"));
        }
        let index_offset = LittleEndian::read_u64(&footer[..8]);
        let entry_count = LittleEndian::read_u64(&footer[8..16]);
        let data_crc = LittleEndian::read_u32(&footer[16..20]);

        let index_end = file_size - FOOTER_LENGTH as u64;
        if index_offset > index_end {
            return Err(Error::corruption("TableFooter", "index out of bounds"));
        }
        let mut index_bytes = vec![0u8; (index_end - index_offset) as usize];
        file.read_exact_at(&mut index_bytes, index_offset)?;

        let mut index = Vec::with_capacity(entry_count as usize);
        let mut at = 0;
        while at < index_bytes.len() {
            if at + 4 > index_bytes.len() {
                return Err(Error::corruption("TableIndex", "truncated entry"));
            }
            let key_len = LittleEndian::read_u32(&index_bytes[at..at + 4]) as usize;
            at += 4;
            if at + key_len + 8 > index_bytes.len() {
                return Err(Error::corruption("TableIndex", "truncated entry"));
            }
            let key = index_bytes[at..at + key_len].to_vec();
            at += key_len;
            let offset = LittleEndian::read_u64(&index_bytes[at..at + 8]);
            at += 8;
            index.push((key, offset));
        }
        if index.len() as u64 != entry_count {
            return Err(Error::Corruption(
                "TableIndex",
                format!(
                    "footer announces {} entries, index holds {}",
                    entry_count,
                    index.len()
                ),
            ));
        }

        Ok(Self {
            file,
            index: Arc::new(index),
            index_offset,
            data_crc,
            file_size,
        })
    }

    fn read_entry(&self, offset: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut lens = [0u8; ENTRY_HEADER_LENGTH];
        self.file.read_exact_at(&mut lens, offset)?;
        let key_len = LittleEndian::read_u32(&lens[..4]) as usize;
        let value_len = LittleEndian::read_u32(&lens[4..]) as usize;

        let end = offset + (ENTRY_HEADER_LENGTH + key_len + value_len) as u64;
        if end > self.index_offset {
            return Err(Error::corruption("TableEntry", "entry out of bounds"));
        }
        let mut buf = vec![0u8; key_len + value_len];
        self.file
            .read_exact_at(&mut buf, offset + ENTRY_HEADER_LENGTH as u64)?;
        let value = buf.split_off(key_len);
        Ok((buf, value))
    }
}

impl TableReader for BaseTableReader {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Ok(at) = self.index.binary_search_by(|(k, _)| k.as_slice().cmp(key)) else {
            return Ok(None);
        };
        let (entry_key, value) = self.read_entry(self.index[at].1)?;
        if entry_key != key {
            return Err(Error::corruption(
                "TableEntry",
                "entry key disagrees with index",
            ));
        }
        Ok(Some(value))
    }

    fn iter(&self) -> Result<Box<dyn TableIterator>> {
        Ok(Box::new(BaseTableIterator {
            file: self.file.try_clone()?,
            index: Arc::clone(&self.index),
            index_offset: self.index_offset,
            position: None,
            current: None,
        }))
    }

    fn properties(&self) -> TableProperties {
        TableProperties {
            num_entries: self.index.len() as u64,
            data_size: self.index_offset,
            index_size: self.file_size - FOOTER_LENGTH as u64 - self.index_offset,
        }
    }

    fn verify_checksum(&self) -> Result<()> {
        let mut digest = CRC32.digest();
        let mut remaining = self.file_size - FOOTER_LENGTH as u64;
        let mut offset = 0;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let len = remaining.min(chunk.len() as u64) as usize;
            self.file.read_exact_at(&mut chunk[..len], offset)?;
            digest.update(&chunk[..len]);
            offset += len as u64;
            remaining -= len as u64;
        }
        if digest.finalize() != self.data_crc {
            return Err(Error::corruption("Table", "checksum mismatch"));
        }
        Ok(())
    }
}

struct BaseTableIterator {
    file: File,
    index: Arc<Vec<(Vec<u8>, u64)>>,
    index_offset: u64,
    position: Option<usize>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl BaseTableIterator {
    fn load(&mut self, position: usize) -> Result<()> {
        if position >= self.index.len() {
            self.position = None;
            self.current = None;
            return Ok(());
        }
        let offset = self.index[position].1;

        let mut lens = [0u8; ENTRY_HEADER_LENGTH];
        self.file.read_exact_at(&mut lens, offset)?;
        let key_len = LittleEndian::read_u32(&lens[..4]) as usize;
        let value_len = LittleEndian::read_u32(&lens[4..]) as usize;
        let end = offset + (ENTRY_HEADER_LENGTH + key_len + value_len) as u64;
        if end > self.index_offset {
            return Err(Error::corruption("TableEntry", "entry out of bounds"));
        }
        let mut buf = vec![0u8; key_len + value_len];
        self.file
            .read_exact_at(&mut buf, offset + ENTRY_HEADER_LENGTH as u64)?;
        let value = buf.split_off(key_len);

        self.position = Some(position);
        self.current = Some((buf, value));
        Ok(())
    }
}

impl TableIterator for BaseTableIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        self.load(0)
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let position = self
            .index
            .partition_point(|(key, _)| key.as_slice() < target);
        self.load(position)
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        match self.position {
            Some(position) => self.load(position + 1),
            None => Ok(()),
        }
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |(key, _)| key)
    }

    fn value(&self) -> Result<Vec<u8>> {
        match &self.current {
            Some((_, value)) => Ok(value.clone()),
            None => Err(Error::InvalidArgument(
                "value() on an unpositioned iterator".to_string(),
            )),
        }
    }
}
