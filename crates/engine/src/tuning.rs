//! The typed tuning surface of the engine.
//!
//! Every option has a default; a store overrides per space. Parsing from
//! CLI flags or JSON lives outside the engine, which only sees this
//! record.

use basalt_core::{Error, Result};

/// Block and blob compression codecs. `Disable` turns compression off
/// explicitly at a level where a per-level list would otherwise inherit
/// the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Snappy,
    Lz4,
    Lz4hc,
    Zstd,
    Zlib,
    Bzip2,
    Xpress,
    Disable,
}

impl CompressionKind {
    /// Whether this build can encode and decode the codec.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            CompressionKind::None
                | CompressionKind::Snappy
                | CompressionKind::Zstd
                | CompressionKind::Disable
        )
    }

    /// Stable on-disk tag for the codec.
    pub fn tag(self) -> u8 {
        match self {
            CompressionKind::None | CompressionKind::Disable => 0,
            CompressionKind::Snappy => 1,
            CompressionKind::Lz4 => 2,
            CompressionKind::Lz4hc => 3,
            CompressionKind::Zstd => 4,
            CompressionKind::Zlib => 5,
            CompressionKind::Bzip2 => 6,
            CompressionKind::Xpress => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => CompressionKind::None,
            1 => CompressionKind::Snappy,
            2 => CompressionKind::Lz4,
            3 => CompressionKind::Lz4hc,
            4 => CompressionKind::Zstd,
            5 => CompressionKind::Zlib,
            6 => CompressionKind::Bzip2,
            7 => CompressionKind::Xpress,
            _ => return None,
        })
    }
}

/// Statistics granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsLevel {
    ExceptHistograms,
    ExceptTimers,
    ExceptDetailed,
    ExceptMutexTime,
    All,
}

/// Engine tuning. Field names map one-to-one to the recognized
/// configuration options.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Skip the engine-internal journal entirely. The owner then relies
    /// on its own log for crash recovery.
    pub disable_wal: bool,
    /// fsync the journal on every batch.
    pub wal_sync: bool,
    /// Journal directory override; `None` keeps it under the data path.
    pub wal_dir: Option<std::path::PathBuf>,

    /// Byte budget of the shared decompressed-block cache.
    pub block_cache_bytes: usize,
    /// Entry budget of the point-lookup row cache; 0 disables it.
    pub row_cache_entries: usize,
    /// Shards of the row cache.
    pub cache_shards: usize,
    /// Bypass the OS page cache for table reads.
    pub use_direct_reads: bool,

    /// Default block codec.
    pub compression: CompressionKind,
    /// Codec for the bottommost level; `None` inherits `compression`.
    pub bottommost_compression: Option<CompressionKind>,
    /// Per-level codec list; padded with `compression` to the number of
    /// levels.
    pub compression_per_level: Vec<CompressionKind>,

    /// Bloom over the fixed 8-byte partition prefix of every key.
    pub enable_prefix_bloom: bool,
    /// Bloom over whole keys.
    pub whole_key_bloom: bool,
    /// Keep index and filter blocks partitioned and cache-resident.
    pub partitioned_index_filter: bool,

    /// Spill values past the threshold into the blob log.
    pub enable_kv_separation: bool,
    /// Minimum value size that gets separated.
    pub kv_separation_threshold_bytes: usize,
    /// Codec for separated values.
    pub blob_compression: CompressionKind,
    /// Rewrite live blobs on compaction to reclaim dead ones.
    pub enable_blob_gc: bool,

    /// Concurrent compactions; 0 means unlimited.
    pub compaction_thread_limit: usize,
    /// Compaction write throttle; 0 means unlimited.
    pub write_rate_bytes_per_sec: usize,

    /// Memory buffer size that triggers a flush into a table file.
    pub write_buffer_bytes: usize,

    /// Statistics granularity.
    pub stats_level: StatsLevel,
}

impl Default for EngineTuning {
    fn default() -> Self {
        EngineTuning {
            disable_wal: false,
            wal_sync: false,
            wal_dir: None,
            block_cache_bytes: 8 * 1024 * 1024,
            row_cache_entries: 0,
            cache_shards: 8,
            use_direct_reads: false,
            compression: CompressionKind::Snappy,
            bottommost_compression: None,
            compression_per_level: Vec::new(),
            enable_prefix_bloom: true,
            whole_key_bloom: false,
            partitioned_index_filter: false,
            enable_kv_separation: false,
            kv_separation_threshold_bytes: 100,
            blob_compression: CompressionKind::Snappy,
            enable_blob_gc: false,
            compaction_thread_limit: 0,
            write_rate_bytes_per_sec: 0,
            write_buffer_bytes: 64 * 1024 * 1024,
            stats_level: StatsLevel::ExceptHistograms,
        }
    }
}

impl EngineTuning {
    /// Number of levels the engine maintains: fresh flushes and the
    /// compacted bottom.
    pub const NUM_LEVELS: usize = 2;

    /// The codec for `level`, resolved through the per-level list, the
    /// bottommost override, and the default, in that order.
    pub fn compression_for_level(&self, level: usize) -> CompressionKind {
        if let Some(&kind) = self.compression_per_level.get(level) {
            return kind;
        }
        if level + 1 == Self::NUM_LEVELS {
            if let Some(kind) = self.bottommost_compression {
                return kind;
            }
        }
        self.compression
    }

    /// Rejects combinations this build cannot honor. An unsupported codec
    /// fails open, the same way an engine compiled without that codec
    /// library would.
    pub fn validate(&self) -> Result<()> {
        let mut codecs = vec![self.compression, self.blob_compression];
        codecs.extend(self.bottommost_compression);
        codecs.extend(self.compression_per_level.iter().copied());
        for codec in codecs {
            if !codec.is_supported() {
                return Err(Error::InvalidArgument(format!(
                    "compression codec {codec:?} not compiled in"
                )));
            }
        }
        if self.compression_per_level.len() > Self::NUM_LEVELS {
            return Err(Error::InvalidArgument(format!(
                "compression_per_level has {} entries for {} levels",
                self.compression_per_level.len(),
                Self::NUM_LEVELS
            )));
        }
        if self.cache_shards == 0 {
            return Err(Error::InvalidArgument("cache_shards must be > 0".into()));
        }
        if self.enable_kv_separation && self.kv_separation_threshold_bytes == 0 {
            return Err(Error::InvalidArgument(
                "kv_separation_threshold_bytes must be > 0 when separation is on".into(),
            ));
        }
        Ok(())
    }
}
