use crate::error::Result;

use super::format::{BlobDecoder, BlobHandle, BlobRecord, BLOB_HEADER_SIZE};
use super::reader::BlobFileReader;

/// Sequential cursor over every record in a sealed blob file.
///
/// Yields records in append order together with the handle that locates
/// them, which is what a cross-file collector needs in order to rewrite
/// the entries that are still live. The iterator fuses after the first
/// error; a damaged record makes the rest of the file unreachable.
pub struct BlobFileIterator<'a> {
    reader: &'a BlobFileReader,
    offset: u64,
    failed: bool,
}

impl<'a> BlobFileIterator<'a> {
    pub(super) fn new(reader: &'a BlobFileReader) -> Self {
        Self {
            reader,
            offset: 0,
            failed: false,
        }
    }

    fn read_next(&mut self) -> Result<(BlobHandle, BlobRecord)> {
        let mut header = [0u8; BLOB_HEADER_SIZE];
        self.reader.read_at(&mut header, self.offset)?;

        let mut src = header.as_slice();
        let mut decoder = BlobDecoder::default();
        decoder.decode_header(&mut src)?;

        let handle = BlobHandle {
            offset: self.offset + BLOB_HEADER_SIZE as u64,
            size: decoder.record_size() as u64,
        };
        let record = self.reader.get(&handle)?;
        self.offset = handle.offset + handle.size;
        Ok((handle, record))
    }
}

impl Iterator for BlobFileIterator<'_> {
    type Item = Result<(BlobHandle, BlobRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.reader.data_end() {
            return None;
        }
        match self.read_next() {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
