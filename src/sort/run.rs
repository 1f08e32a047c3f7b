//! Spill run files
//!
//! A run is an anonymous temp file of `[len: u32][bincode(item)]` frames.
//! The file is unlinked on creation, so dropping the reader reclaims it.

use crate::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;

pub(crate) struct RunWriter {
    file: BufWriter<File>,
    count: usize,
}

impl RunWriter {
    pub(crate) fn create(dir: Option<&Path>) -> Result<Self> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self { file: BufWriter::new(file), count: 0 })
    }

    pub(crate) fn write<T: Serialize>(&mut self, item: &T) -> Result<()> {
        let bytes = bincode::serialize(item)?;
        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&bytes)?;
        self.count += 1;
        Ok(())
    }

    /// Rewind for reading
    pub(crate) fn finish<T>(self) -> Result<RunReader<T>> {
        let mut file = self.file.into_inner().map_err(|e| StorageError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(RunReader {
            reader: BufReader::new(file),
            remaining: self.count,
            _marker: PhantomData,
        })
    }
}

/// Single-pass reader over one run
pub(crate) struct RunReader<T> {
    reader: BufReader<File>,
    remaining: usize,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> RunReader<T> {
    fn read_next(&mut self) -> Result<T> {
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        let mut buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        self.reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                StorageError::Corruption("sort run file ends mid-record".into())
            }
            _ => StorageError::Io(e),
        })?;
        Ok(bincode::deserialize(&buf)?)
    }
}

impl<T: DeserializeOwned> Iterator for RunReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let item = self.read_next();
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
