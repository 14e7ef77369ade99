use core::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::backend::Chunk;
use crate::protocol::ProtocolError;

pub const DEFAULT_SHARD_COUNT: NonZeroUsize = match NonZeroUsize::new(4) {
    Some(count) => count,
    None => unreachable!(),
};

const SHARD_PREFIX: &str = "ch";

/// The 1-based index of a shard, which is also the position of the storage
/// node holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardKey(u32);

impl ShardKey {
    pub fn new(key: u32) -> Option<Self> {
        (key >= 1).then_some(Self(key))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn all(shard_count: NonZeroUsize) -> impl Iterator<Item = Self> {
        (1..=shard_count.get() as u32).map(Self)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte ranges of a file split into `shard_count` contiguous shards.
///
/// Every shard but the last holds `total_len / shard_count` bytes and the
/// last one absorbs the remainder, so files smaller than the shard count end
/// up entirely in the last shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    total_len: u64,
    shard_count: NonZeroUsize,
}

impl ShardLayout {
    pub fn new(total_len: u64, shard_count: NonZeroUsize) -> Self {
        Self {
            total_len,
            shard_count,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn shard_count(&self) -> NonZeroUsize {
        self.shard_count
    }

    fn base_len(&self) -> u64 {
        self.total_len / self.shard_count.get() as u64
    }

    pub fn range(&self, shard: ShardKey) -> Range<u64> {
        let base_len = self.base_len();
        let start = shard.index() as u64 * base_len;
        let end = if shard.index() + 1 == self.shard_count.get() {
            self.total_len
        } else {
            start + base_len
        };
        start..end
    }

    pub fn ranges(&self) -> impl Iterator<Item = (ShardKey, Range<u64>)> + '_ {
        ShardKey::all(self.shard_count).map(|shard| (shard, self.range(shard)))
    }
}

/// The name a shard of `file_name` is stored under on its storage node.
pub fn shard_name(shard: ShardKey, file_name: &str) -> String {
    format!("{SHARD_PREFIX}{shard}-{file_name}")
}

/// Inverse of [`shard_name`].
pub fn parse_shard_name(name: &str) -> Option<(ShardKey, &str)> {
    let (digits, file_name) = name.strip_prefix(SHARD_PREFIX)?.split_once('-')?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let shard = ShardKey::new(digits.parse().ok()?)?;
    Some((shard, file_name))
}

/// Splits `data` into one chunk per shard without copying.
pub fn split(file_name: &str, data: Bytes, shard_count: NonZeroUsize) -> Vec<Chunk> {
    let layout = ShardLayout::new(data.len() as u64, shard_count);
    layout
        .ranges()
        .map(|(shard, range)| Chunk {
            file_name: file_name.into(),
            shard,
            data: data.slice(range.start as usize..range.end as usize),
        })
        .collect()
}

/// Concatenates shards given in shard order.
///
/// The sizes have to be the ones a single upload of the combined length
/// produces, which rejects shards left over from different uploads whenever
/// their sizes disagree.
pub fn assemble(parts: Vec<Bytes>) -> Result<Bytes, ProtocolError> {
    let Some(shard_count) = NonZeroUsize::new(parts.len()) else {
        return Ok(Bytes::new());
    };
    let total_len: u64 = parts.iter().map(|part| part.len() as u64).sum();
    let layout = ShardLayout::new(total_len, shard_count);

    let mut contents = BytesMut::with_capacity(total_len as usize);
    for ((shard, range), part) in layout.ranges().zip(&parts) {
        let expected = range.end - range.start;
        let actual = part.len() as u64;
        if actual != expected {
            return Err(ProtocolError::ShardSizeMismatch {
                shard: shard.get(),
                expected,
                actual,
            });
        }
        contents.extend_from_slice(part);
    }
    Ok(contents.freeze())
}
