//! Resume header stored at the front of a partial file
//!
//! Layout, in host byte order:
//!
//! ```text
//! signature[20] | segment_count: usize | segment_count x { start, end, committed, session: i64 }
//! ```
//!
//! Payload bytes for a segment live at `header_size + start`. The header is
//! only ever read back on the machine that wrote it.

use crate::error::DownloadError;
use splitfetch_types::SegmentRecord;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use tracing::{debug, info};

/// Magic bytes identifying a splitfetch partial file
pub const SIGNATURE: &[u8; SIGNATURE_LEN] = b"SPLITFETCH-RESUME/01";

pub const SIGNATURE_LEN: usize = 20;

/// Encoded size of one [`SegmentRecord`]
pub const RECORD_SIZE: usize = 4 * size_of::<i64>();

const COUNT_SIZE: usize = size_of::<usize>();

/// Offset of the first record
const RECORDS_OFFSET: u64 = (SIGNATURE_LEN + COUNT_SIZE) as u64;

/// Segment table persisted in a partial file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeHeader {
    pub records: Vec<SegmentRecord>,
}

impl ResumeHeader {
    pub fn new(records: Vec<SegmentRecord>) -> Self {
        Self { records }
    }

    pub fn segment_count(&self) -> usize {
        self.records.len()
    }

    /// Number of bytes the header occupies before the payload
    pub fn size(&self) -> u64 {
        header_size(self.segment_count())
    }

    /// Whether the records describe exactly `[0, file_size - 1]` in order
    pub fn covers(&self, file_size: i64) -> bool {
        let mut next = 0;
        for record in &self.records {
            if record.start != next {
                return false;
            }
            next = record.end + 1;
        }
        next == file_size
    }
}

/// Header size for a table of `segment_count` records
pub fn header_size(segment_count: usize) -> u64 {
    (SIGNATURE_LEN + COUNT_SIZE + segment_count * RECORD_SIZE) as u64
}

/// Reads and writes [`ResumeHeader`]s
pub struct HeaderCodec;

impl HeaderCodec {
    /// Write the whole header at offset 0
    pub fn write<F: Write + Seek>(file: &mut F, header: &ResumeHeader) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(SIGNATURE)?;
        file.write_all(&header.segment_count().to_ne_bytes())?;
        write_records(file, &header.records)?;
        file.flush()?;

        info!(
            "Wrote resume header: {} segments, {} bytes",
            header.segment_count(),
            header.size()
        );
        Ok(())
    }

    /// Read and validate a header from offset 0
    pub fn read<F: Read + Seek>(file: &mut F) -> Result<ResumeHeader, DownloadError> {
        let file_len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let mut signature = [0u8; SIGNATURE_LEN];
        read_field(file, &mut signature, "signature")?;
        if &signature != SIGNATURE {
            return Err(DownloadError::CorruptHeader("signature mismatch".to_string()));
        }

        let mut count = [0u8; COUNT_SIZE];
        read_field(file, &mut count, "segment count")?;
        let segment_count = usize::from_ne_bytes(count);
        if segment_count == 0 {
            return Err(DownloadError::CorruptHeader("segment count is zero".to_string()));
        }

        let room = file_len.saturating_sub(RECORDS_OFFSET) / RECORD_SIZE as u64;
        if segment_count as u64 > room {
            return Err(DownloadError::CorruptHeader(format!(
                "segment count {} exceeds file length {}",
                segment_count, file_len
            )));
        }

        let mut records = Vec::with_capacity(segment_count);
        for index in 0..segment_count {
            let mut raw = [0u8; RECORD_SIZE];
            read_field(file, &mut raw, "segment record")?;
            let record = decode_record(&raw);
            if !record.is_valid() {
                return Err(DownloadError::CorruptHeader(format!(
                    "segment {} is invalid: {:?}",
                    index, record
                )));
            }
            records.push(record);
        }

        debug!("Read resume header with {} segments", segment_count);
        Ok(ResumeHeader { records })
    }

    /// Checkpoint: commit session progress and rewrite only the record list
    pub fn update<F: Write + Seek>(file: &mut F, header: &mut ResumeHeader) -> io::Result<()> {
        for record in header.records.iter_mut() {
            record.committed_downloaded = record.session_downloaded;
        }

        file.seek(SeekFrom::Start(RECORDS_OFFSET))?;
        write_records(file, &header.records)?;
        file.flush()?;

        info!("Checkpoint written:");
        for (index, record) in header.records.iter().enumerate() {
            info!(
                "#{}: {} ~ {}, {} downloaded",
                index, record.start, record.end, record.committed_downloaded
            );
        }
        Ok(())
    }
}

fn write_records<F: Write>(file: &mut F, records: &[SegmentRecord]) -> io::Result<()> {
    for record in records {
        file.write_all(&encode_record(record))?;
    }
    Ok(())
}

fn read_field<F: Read>(file: &mut F, buf: &mut [u8], what: &str) -> Result<(), DownloadError> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DownloadError::CorruptHeader(format!("truncated {}", what)),
        _ => DownloadError::Io(e),
    })
}

fn encode_record(record: &SegmentRecord) -> [u8; RECORD_SIZE] {
    let fields = [
        record.start,
        record.end,
        record.committed_downloaded,
        record.session_downloaded,
    ];
    let mut raw = [0u8; RECORD_SIZE];
    for (slot, value) in raw.chunks_exact_mut(size_of::<i64>()).zip(fields) {
        slot.copy_from_slice(&value.to_ne_bytes());
    }
    raw
}

fn decode_record(raw: &[u8; RECORD_SIZE]) -> SegmentRecord {
    let mut fields = raw.chunks_exact(size_of::<i64>()).map(|chunk| {
        let mut bytes = [0u8; size_of::<i64>()];
        bytes.copy_from_slice(chunk);
        i64::from_ne_bytes(bytes)
    });
    let mut next = || fields.next().unwrap_or_default();

    SegmentRecord {
        start: next(),
        end: next(),
        committed_downloaded: next(),
        session_downloaded: next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> ResumeHeader {
        ResumeHeader::new(vec![
            SegmentRecord {
                committed_downloaded: 10,
                session_downloaded: 10,
                ..SegmentRecord::new(0, 2499)
            },
            SegmentRecord {
                committed_downloaded: 2500,
                session_downloaded: 2500,
                ..SegmentRecord::new(2500, 4999)
            },
            SegmentRecord::new(5000, 7499),
            SegmentRecord {
                committed_downloaded: 1,
                session_downloaded: 7,
                ..SegmentRecord::new(7500, 9999)
            },
        ])
    }

    #[test]
    fn test_header_size() {
        assert_eq!(header_size(4), (20 + size_of::<usize>() + 4 * 32) as u64);
        assert_eq!(sample_header().size(), header_size(4));
    }

    #[test]
    fn test_round_trip() {
        let header = sample_header();
        let mut file = Cursor::new(Vec::new());
        HeaderCodec::write(&mut file, &header).unwrap();

        assert_eq!(file.get_ref().len() as u64, header.size());
        assert_eq!(&file.get_ref()[..SIGNATURE_LEN], SIGNATURE);

        let loaded = HeaderCodec::read(&mut file).unwrap();
        assert_eq!(loaded, header);
    }

    #[test]
    fn test_read_rejects_bad_signature() {
        let mut file = Cursor::new(Vec::new());
        HeaderCodec::write(&mut file, &sample_header()).unwrap();
        file.get_mut()[0] = b'X';

        let err = HeaderCodec::read(&mut file).unwrap_err();
        assert!(matches!(err, DownloadError::CorruptHeader(_)));
    }

    #[test]
    fn test_read_rejects_zero_count() {
        let mut raw = SIGNATURE.to_vec();
        raw.extend_from_slice(&0usize.to_ne_bytes());
        raw.extend_from_slice(&[0u8; 64]);

        let err = HeaderCodec::read(&mut Cursor::new(raw)).unwrap_err();
        assert!(matches!(err, DownloadError::CorruptHeader(_)));
    }

    #[test]
    fn test_read_rejects_invalid_record() {
        let header = ResumeHeader::new(vec![SegmentRecord {
            committed_downloaded: 200,
            ..SegmentRecord::new(0, 99)
        }]);
        let mut file = Cursor::new(Vec::new());
        HeaderCodec::write(&mut file, &header).unwrap();

        let err = HeaderCodec::read(&mut file).unwrap_err();
        assert!(matches!(err, DownloadError::CorruptHeader(_)));
    }

    #[test]
    fn test_read_rejects_truncated_and_empty_files() {
        let mut file = Cursor::new(Vec::new());
        HeaderCodec::write(&mut file, &sample_header()).unwrap();
        let mut truncated = file.into_inner();
        truncated.truncate(truncated.len() - 5);

        let err = HeaderCodec::read(&mut Cursor::new(truncated)).unwrap_err();
        assert!(matches!(err, DownloadError::CorruptHeader(_)));

        let err = HeaderCodec::read(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, DownloadError::CorruptHeader(_)));
    }

    #[test]
    fn test_update_commits_session_and_keeps_payload() {
        let mut header = sample_header();
        let mut file = Cursor::new(Vec::new());
        HeaderCodec::write(&mut file, &header).unwrap();
        file.get_mut().extend_from_slice(b"payload");

        header.records[2].session_downloaded = 1234;
        HeaderCodec::update(&mut file, &mut header).unwrap();

        assert_eq!(header.records[2].committed_downloaded, 1234);
        assert_eq!(header.records[3].committed_downloaded, 7);
        assert!(file.get_ref().ends_with(b"payload"));

        let loaded = HeaderCodec::read(&mut file).unwrap();
        assert_eq!(loaded, header);
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut header = sample_header();
        let mut file = Cursor::new(Vec::new());
        HeaderCodec::write(&mut file, &header).unwrap();

        HeaderCodec::update(&mut file, &mut header).unwrap();
        let first = file.get_ref().clone();
        HeaderCodec::update(&mut file, &mut header).unwrap();

        assert_eq!(file.get_ref(), &first);
    }

    #[test]
    fn test_covers() {
        let header = sample_header();
        assert!(header.covers(10_000));
        assert!(!header.covers(9_999));

        let gap = ResumeHeader::new(vec![SegmentRecord::new(0, 9), SegmentRecord::new(11, 20)]);
        assert!(!gap.covers(21));
    }
}
