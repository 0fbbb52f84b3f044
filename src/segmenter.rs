// src/segmenter.rs

use crate::models::Segment;

/// How many segments a resource of `total_size` bytes should get.
///
/// Never more than requested, never so many that a segment drops below
/// `min_segment_size`, never fewer than one.
pub fn segment_count(total_size: u64, requested: usize, min_segment_size: u64) -> usize {
    let by_size = total_size / min_segment_size.max(1);
    (requested.max(1) as u64).min(by_size.max(1)).min(total_size.max(1)) as usize
}

/// Divides a resource into segments for concurrent downloading.
///
/// Without a known size or range support the whole resource is one open
/// segment. Otherwise segments are equal-width and the last one absorbs the
/// remainder of the integer division.
pub fn allocate(
    total_size: Option<u64>,
    supports_ranges: bool,
    requested: usize,
    min_segment_size: u64,
) -> Vec<Segment> {
    let total_size = match total_size {
        Some(size) if size > 0 => size,
        _ => return vec![Segment::new(0, 0, None)],
    };
    if !supports_ranges {
        return vec![Segment::new(0, 0, Some(total_size - 1))];
    }

    let count = segment_count(total_size, requested, min_segment_size) as u64;
    let width = total_size / count;

    (0..count)
        .map(|i| {
            let start = i * width;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                start + width - 1
            };
            Segment::new(i as usize, start, Some(end))
        })
        .collect()
}
