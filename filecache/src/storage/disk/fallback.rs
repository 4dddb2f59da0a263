use crate::Error;
use bytes::Bytes;
use std::{
    fs::File,
    io::{self, ErrorKind, Read, Seek, SeekFrom},
    sync::Mutex,
};

/// Files must be seeked prior to any read and are thus not safe to read concurrently.
pub(super) struct Handle {
    file: Mutex<File>,
}

impl Handle {
    pub(super) const fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    pub(super) fn len(&self) -> io::Result<u64> {
        Ok(self.file.lock().unwrap().metadata()?.len())
    }

    pub(super) fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut buf = vec![0; len];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::ReadFailed)?;
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::ShortRead,
            _ => Error::ReadFailed,
        })?;
        Ok(buf.into())
    }
}
