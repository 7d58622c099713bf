//! Byte-range planning for fresh and resumed downloads

use splitfetch_types::SegmentRecord;

/// An incomplete segment and the first byte to request for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeSlot {
    /// Index into the segment table
    pub index: usize,
    pub resume_start: i64,
    pub end: i64,
}

/// Split `file_size` bytes into `worker_count` contiguous ranges.
///
/// The last range absorbs the remainder. An unknown or empty size yields a
/// single unbounded record, which is fetched without a range header.
pub fn plan_fresh(file_size: Option<i64>, worker_count: u32) -> Vec<SegmentRecord> {
    let file_size = match file_size {
        Some(size) if size > 0 => size,
        _ => return vec![SegmentRecord::unbounded()],
    };

    // Never plan an empty range
    let workers = i64::from(worker_count.max(1)).min(file_size);
    let per = file_size / workers;

    (0..workers)
        .map(|i| {
            let start = i * per;
            let end = if i == workers - 1 {
                file_size - 1
            } else {
                (i + 1) * per - 1
            };
            SegmentRecord::new(start, end)
        })
        .collect()
}

/// Work out where each segment continues from.
///
/// A segment resumes one byte before its committed progress, re-fetching
/// the last byte already on disk, but never before its own start. Complete
/// segments are left out.
pub fn plan_resume(records: &[SegmentRecord]) -> Vec<ResumeSlot> {
    records
        .iter()
        .enumerate()
        .filter(|(_, record)| !record.is_complete())
        .map(|(index, record)| ResumeSlot {
            index,
            resume_start: (record.start + record.committed_downloaded - 1).max(record.start),
            end: record.end,
        })
        .collect()
}
