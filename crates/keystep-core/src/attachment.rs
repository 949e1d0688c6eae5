//! Attachment chunk planning.
//!
//! Attachments are sealed as a single ciphertext and uploaded in chunks. The
//! plan fixes the chunk length up front so both sides agree on boundaries
//! without exchanging a chunk table.

use crate::config::AttachmentConfig;

/// How a sealed attachment is cut into upload chunks.
///
/// Every chunk is `chunk_len` bytes except the last, which holds whatever
/// remains. The chunk lengths always sum to `ciphertext_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentChunkPlan {
    ciphertext_len: u64,
    chunk_len: u64,
    chunk_count: u64,
}

impl AttachmentChunkPlan {
    /// Plan chunks for `cleartext_len` bytes sealed with `overhead` extra bytes.
    ///
    /// A zero-length ciphertext (empty cleartext, no overhead) still yields a
    /// single empty chunk so that there is something to upload.
    ///
    /// Returns `None` if the ciphertext length does not fit in a `u64`.
    pub fn compute(cleartext_len: u64, overhead: u64, config: &AttachmentConfig) -> Option<Self> {
        let ciphertext_len = cleartext_len.checked_add(overhead)?;
        let max_chunk_count = config.max_chunk_count.max(1);
        let min_chunk_len = config.min_chunk_len.max(1);

        let chunk_len = min_chunk_len.max(ciphertext_len.div_ceil(max_chunk_count));
        let chunk_count = ciphertext_len.div_ceil(chunk_len).max(1);

        debug_assert!(chunk_count <= max_chunk_count);
        Some(Self { ciphertext_len, chunk_len, chunk_count })
    }

    /// Total length of the sealed attachment.
    pub fn ciphertext_len(&self) -> u64 {
        self.ciphertext_len
    }

    /// Length of every chunk but the last.
    pub fn chunk_len(&self) -> u64 {
        self.chunk_len
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Length of chunk `index`, `None` past the end.
    pub fn chunk_length(&self, index: u64) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        let start = index * self.chunk_len;
        Some(self.chunk_len.min(self.ciphertext_len - start))
    }

    /// Lengths of all chunks in order.
    pub fn chunk_lengths(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.chunk_count).filter_map(|index| self.chunk_length(index))
    }

    /// Byte range of chunk `index` inside the ciphertext.
    pub fn chunk_range(&self, index: u64) -> Option<std::ops::Range<u64>> {
        let len = self.chunk_length(index)?;
        let start = index * self.chunk_len;
        Some(start..start + len)
    }

    /// Cut `ciphertext` along the plan.
    ///
    /// Returns `None` if `ciphertext` is not exactly `ciphertext_len` long.
    pub fn split_ciphertext<'a>(&self, ciphertext: &'a [u8]) -> Option<Vec<&'a [u8]>> {
        if ciphertext.len() as u64 != self.ciphertext_len {
            return None;
        }
        (0..self.chunk_count)
            .map(|index| {
                let range = self.chunk_range(index)?;
                ciphertext.get(range.start as usize..range.end as usize)
            })
            .collect()
    }
}
