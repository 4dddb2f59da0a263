use crate::Error;
use bytes::Bytes;
use std::{
    fs::File,
    io::{self, ErrorKind},
    os::unix::fs::FileExt,
};

/// Positional reads need no coordination between threads.
pub(super) struct Handle {
    file: File,
}

impl Handle {
    pub(super) const fn new(file: File) -> Self {
        Self { file }
    }

    pub(super) fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub(super) fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut buf = vec![0; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => Error::ShortRead,
                _ => Error::ReadFailed,
            })?;
        Ok(buf.into())
    }
}
