//! Partial file shared by all segment workers of a run

use parking_lot::{Mutex, MutexGuard};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// One physical file, logically partitioned by offset between segments.
///
/// Positions handed to [`SharedFile::write_payload`] are relative to the
/// end of the resume header.
#[derive(Debug)]
pub struct SharedFile {
    file: Mutex<File>,
    payload_offset: AtomicU64,
}

impl SharedFile {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
            payload_offset: AtomicU64::new(0),
        }
    }

    /// Size of the resume header in front of the payload
    pub fn payload_offset(&self) -> u64 {
        self.payload_offset.load(Ordering::Acquire)
    }

    pub fn set_payload_offset(&self, offset: u64) {
        self.payload_offset.store(offset, Ordering::Release);
    }

    /// Write `data` at payload position `position`; seek and write happen under one lock
    pub fn write_payload(&self, position: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.payload_offset() + position))?;
        file.write_all(data)
    }

    /// Exclusive access for header reads and writes
    pub fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock()
    }

    pub fn into_inner(self) -> File {
        self.file.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_write_payload_honours_offset() {
        let mut file = SharedFile::new(tempfile::tempfile().unwrap());
        file.set_payload_offset(4);
        file.write_payload(2, b"cd").unwrap();
        file.write_payload(0, b"ab").unwrap();
        file.lock().seek(SeekFrom::Start(0)).unwrap();
        file.lock().write_all(b"HDR!").unwrap();

        let mut contents = Vec::new();
        let inner = file.file.get_mut();
        inner.seek(SeekFrom::Start(0)).unwrap();
        inner.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"HDR!abcd");
    }
}
