use std::fmt;

/// Contiguous range `[start_line, end_line)` of zero-based file lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub index: usize,
    pub start_line: u64,
    pub end_line: u64,
}

impl FileChunk {
    pub fn line_count(&self) -> u64 {
        self.end_line - self.start_line
    }

    pub fn is_empty(&self) -> bool {
        self.line_count() == 0
    }
}

impl fmt::Display for FileChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk[{}: lines {}-{}, {} lines]",
            self.index,
            self.start_line,
            self.end_line,
            self.line_count()
        )
    }
}

/// Splits `data_lines` lines that follow a one-line header into `chunks`
/// contiguous ranges. Sizes differ by at most one, larger chunks first.
///
/// Always returns exactly `chunks` ranges; trailing ones are empty when there
/// are fewer lines than chunks.
pub fn partition(data_lines: u64, chunks: usize) -> Vec<FileChunk> {
    if chunks == 0 {
        return Vec::new();
    }
    let k = chunks as u64;
    let base = data_lines / k;
    let remainder = data_lines % k;

    let mut start = 1;
    (0..chunks)
        .map(|index| {
            let size = base + u64::from((index as u64) < remainder);
            let chunk = FileChunk {
                index,
                start_line: start,
                end_line: start + size,
            };
            start += size;
            chunk
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_distributes_remainder_first() {
        let chunks = partition(10, 3);
        let sizes: Vec<u64> = chunks.iter().map(FileChunk::line_count).collect();

        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[2].end_line, 11);
    }

    #[test]
    fn test_partition_is_exact_and_contiguous() {
        for data_lines in [0u64, 1, 2, 7, 100, 1_001] {
            for k in 1..=8 {
                let chunks = partition(data_lines, k);
                assert_eq!(chunks.len(), k);
                assert_eq!(chunks.iter().map(FileChunk::line_count).sum::<u64>(), data_lines);
                assert_eq!(chunks[0].start_line, 1);
                for pair in chunks.windows(2) {
                    assert_eq!(pair[0].end_line, pair[1].start_line);
                }
            }
        }
    }

    #[test]
    fn test_partition_more_chunks_than_lines() {
        let chunks = partition(2, 4);
        assert!(!chunks[0].is_empty());
        assert!(!chunks[1].is_empty());
        assert!(chunks[2].is_empty());
        assert!(chunks[3].is_empty());
    }

    #[test]
    fn test_partition_zero_chunks() {
        assert!(partition(10, 0).is_empty());
    }
}
