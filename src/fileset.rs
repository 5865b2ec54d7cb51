//! File-set metadata: the concatenated view of a sequence of files as a
//! single chunk-indexed stream. Extent-tree / filesystem lookups are out of
//! scope; this only tracks chunk-range bookkeeping.

/// One file's contribution to the concatenated chunk stream.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub file_id: u32,
    /// First logical chunk id (inclusive) this file occupies.
    pub start_chunk: u64,
    /// Number of whole 2 MiB chunks, including a possibly-short last chunk.
    pub num_chunks: u64,
    pub size_bytes: u64,
}

/// Ordered sequence of files forming a `T`-chunk stream, keyed by logical
/// `chunk_id ∈ [0, T)`.
pub struct FileSet {
    files: Vec<FileEntry>,
    total_chunks: u64,
    chunk_bytes: u64,
}

impl FileSet {
    pub fn new(file_sizes: &[(u32, u64)], chunk_bytes: u64) -> Self {
        let mut files = Vec::with_capacity(file_sizes.len());
        let mut cursor = 0u64;
        for &(file_id, size_bytes) in file_sizes {
            let num_chunks = size_bytes.div_ceil(chunk_bytes).max(1);
            files.push(FileEntry {
                file_id,
                start_chunk: cursor,
                num_chunks,
                size_bytes,
            });
            cursor += num_chunks;
        }
        Self {
            files,
            total_chunks: cursor,
            chunk_bytes,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_bytes
    }

    /// Finds the file entry covering `chunk_id`, and the chunk's offset
    /// within that file, along with how many bytes the chunk should hold
    /// (short for the last chunk of a file).
    pub fn locate(&self, chunk_id: u64) -> Option<(&FileEntry, u64, u64)> {
        // Linear scan: file counts are small (the O(1) amortised lookup
        // promised by the consume-indicator's cursor lives in
        // `ChannelLocal`, which remembers the last file index it resolved).
        let entry = self
            .files
            .iter()
            .find(|f| chunk_id >= f.start_chunk && chunk_id < f.start_chunk + f.num_chunks)?;
        let chunk_in_file = chunk_id - entry.start_chunk;
        let byte_offset = chunk_in_file * self.chunk_bytes;
        let remaining = entry.size_bytes.saturating_sub(byte_offset);
        let chunk_size = remaining.min(self.chunk_bytes);
        Some((entry, chunk_in_file, chunk_size))
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_two_full_chunks() {
        let fs = FileSet::new(&[(1, 4 * 1024 * 1024)], 2 * 1024 * 1024);
        assert_eq!(fs.total_chunks(), 2);
        let (entry, idx, size) = fs.locate(0).unwrap();
        assert_eq!(entry.file_id, 1);
        assert_eq!(idx, 0);
        assert_eq!(size, 2 * 1024 * 1024);
        let (_, idx, size) = fs.locate(1).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(size, 2 * 1024 * 1024);
    }

    #[test]
    fn short_last_chunk() {
        let fs = FileSet::new(&[(1, 3 * 1024 * 1024)], 2 * 1024 * 1024);
        assert_eq!(fs.total_chunks(), 2);
        let (_, _, size) = fs.locate(1).unwrap();
        assert_eq!(size, 1024 * 1024);
    }

    #[test]
    fn multiple_files_concatenate() {
        let fs = FileSet::new(&[(1, 2 * 1024 * 1024), (2, 4 * 1024 * 1024)], 2 * 1024 * 1024);
        assert_eq!(fs.total_chunks(), 3);
        let (entry, idx, _) = fs.locate(1).unwrap();
        assert_eq!(entry.file_id, 2);
        assert_eq!(idx, 0);
        let (entry, idx, _) = fs.locate(2).unwrap();
        assert_eq!(entry.file_id, 2);
        assert_eq!(idx, 1);
    }
}
