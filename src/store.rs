//! StoreReader: mmap-backed access to a `.kcs` count store, and the
//! sequential cursor used as a merge input.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::encode::{Kmer, MAX_MER_SIZE, StrandMode, mer_mask};
use crate::io::{
    BucketDir, Compression, DIR_ENTRY_BYTES, FileHeader, HEADER_BYTES, KCS_MAGIC, KCS_VERSION,
    MAX_BUCKET_BITS, bucket_of, read_varu64,
};

#[derive(Debug, Error)]
/// Errors returned while writing or reading a count store.
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid file format.
    #[error("Invalid KCS file: {0}")]
    Format(String),
    /// Bytemuck cast failed.
    #[error("Cast error: {0}")]
    Cast(String),
    /// A record did not come strictly after the previous one.
    #[error("k-mer {next:#x} does not follow {prev:#x}; records must be strictly increasing")]
    OutOfOrder { prev: u64, next: u64 },
    /// A code has bits set above `2k`.
    #[error("k-mer code {code:#x} is wider than {mer_size} bases")]
    KmerTooWide { code: u64, mer_size: usize },
    /// `add_record`/`finish_iteration` before `prepare`.
    #[error("store {0} was not prepared for writing")]
    NotPrepared(PathBuf),
}

/// A delta+varint bucket expanded into plain arrays.
struct DecodedBucket {
    kmers: Vec<u64>,
    counts: Vec<u64>,
}

/// Read-only view of a finished store.
pub struct StoreReader {
    path: PathBuf,
    map: memmap2::Mmap,
    header: FileHeader,
    compression: Compression,
    strand: StrandMode,
    dir: Vec<BucketDir>,
    decoded: Vec<OnceLock<DecodedBucket>>,
}

impl StoreReader {
    /// Open a `.kcs` file via mmap and validate its header and directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let map = unsafe { memmap2::MmapOptions::new().map(&file)? };

        if (map.len() as u64) < HEADER_BYTES {
            return Err(StoreError::Format("file shorter than header".into()));
        }
        let mut rdr = Cursor::new(&map[..]);
        let header = FileHeader::read_from(&mut rdr)?;

        if header.magic != KCS_MAGIC {
            return Err(StoreError::Format("bad magic".into()));
        }
        if header.version != KCS_VERSION {
            return Err(StoreError::Format(format!(
                "unsupported version {}",
                header.version
            )));
        }
        let k = header.mer_size as usize;
        if k == 0 || k > MAX_MER_SIZE {
            return Err(StoreError::Format(format!("mer size {k} outside 1..=32")));
        }
        if header.bucket_bits > MAX_BUCKET_BITS
            || header.bucket_bits as usize > 2 * k
            || 1u32.checked_shl(header.bucket_bits as u32) != Some(header.buckets)
        {
            return Err(StoreError::Format("inconsistent bucket geometry".into()));
        }
        let compression = header
            .compression()
            .ok_or_else(|| StoreError::Format("unknown compression".into()))?;
        let strand = header
            .strand()
            .ok_or_else(|| StoreError::Format("unknown strand mode".into()))?;

        DIR_ENTRY_BYTES
            .checked_mul(header.buckets as u64)
            .and_then(|n| n.checked_add(header.dir_offset))
            .filter(|&end| end <= map.len() as u64)
            .ok_or_else(|| StoreError::Format("directory past end of file".into()))?;
        rdr.set_position(header.dir_offset);
        let mut dir = Vec::with_capacity(header.buckets as usize);
        let mut records = 0u64;
        for _ in 0..header.buckets {
            let d = BucketDir::read_from(&mut rdr)?;
            let payload_end = d.off_kmers.checked_add(d.payload_bytes);
            if d.records > 0 && payload_end.is_none_or(|end| end > map.len() as u64) {
                return Err(StoreError::Format("bucket payload past end of file".into()));
            }
            let min_payload = match compression {
                Compression::None => d.records.checked_mul(16),
                Compression::DeltaVarint => d.records.checked_mul(2),
            };
            if min_payload.is_none_or(|min| min > d.payload_bytes) {
                return Err(StoreError::Format(format!(
                    "bucket of {} records has only {} payload bytes",
                    d.records, d.payload_bytes
                )));
            }
            records = records
                .checked_add(d.records)
                .ok_or_else(|| StoreError::Format("record count overflows".into()))?;
            dir.push(d);
        }
        if records != header.total_records {
            return Err(StoreError::Format(format!(
                "directory holds {records} records, header says {}",
                header.total_records
            )));
        }

        let decoded = (0..header.buckets).map(|_| OnceLock::new()).collect();
        Ok(StoreReader {
            path,
            map,
            header,
            compression,
            strand,
            dir,
            decoded,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn mer_size(&self) -> usize {
        self.header.mer_size as usize
    }

    pub fn strand(&self) -> StrandMode {
        self.strand
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Number of distinct k-mers in the store.
    pub fn total_records(&self) -> u64 {
        self.header.total_records
    }

    pub fn buckets(&self) -> usize {
        self.dir.len()
    }

    #[inline]
    pub(crate) fn bucket_len(&self, b: usize) -> usize {
        self.dir[b].records as usize
    }

    fn decoded(&self, b: usize) -> Result<&DecodedBucket, StoreError> {
        if let Some(d) = self.decoded[b].get() {
            return Ok(d);
        }
        let d = &self.dir[b];
        let bytes = d.payload_bytes(&self.map)?;
        let n = d.records as usize;
        let mut kmers = Vec::with_capacity(n);
        let mut counts = Vec::with_capacity(n);
        let mut at = 0usize;
        let mut prev = 0u64;
        for i in 0..n {
            let truncated = || StoreError::Format(format!("bucket {b} truncated at record {i}"));
            let delta = read_varu64(bytes, &mut at).ok_or_else(truncated)?;
            let count = read_varu64(bytes, &mut at).ok_or_else(truncated)?;
            prev = if i == 0 { delta } else { prev.wrapping_add(delta) };
            kmers.push(prev);
            counts.push(count);
        }
        Ok(self.decoded[b].get_or_init(|| DecodedBucket { kmers, counts }))
    }

    /// Drop the decoded form of bucket `b`, if any.
    pub(crate) fn release(&mut self, b: usize) {
        if let Some(slot) = self.decoded.get_mut(b) {
            slot.take();
        }
    }

    /// Record `i` of bucket `b`.
    pub(crate) fn record(&self, b: usize, i: usize) -> Result<(u64, u64), StoreError> {
        match self.compression {
            Compression::None => {
                let d = &self.dir[b];
                let kmers = d.kmers_slice(&self.map)?;
                let counts = d.counts_slice(&self.map)?;
                Ok((kmers[i], counts[i]))
            }
            Compression::DeltaVarint => {
                let d = self.decoded(b)?;
                Ok((d.kmers[i], d.counts[i]))
            }
        }
    }

    /// Random access: the count stored for `kmer`, if present.
    pub fn lookup(&self, kmer: Kmer) -> Result<Option<u64>, StoreError> {
        let k = self.mer_size();
        let code = kmer.code();
        if code & !mer_mask(k) != 0 {
            return Ok(None);
        }
        let b = bucket_of(code, k, self.header.bucket_bits);
        if self.dir[b].records == 0 {
            return Ok(None);
        }
        let (kmers, counts) = match self.compression {
            Compression::None => {
                let d = &self.dir[b];
                (d.kmers_slice(&self.map)?, d.counts_slice(&self.map)?)
            }
            Compression::DeltaVarint => {
                let d = self.decoded(b)?;
                (&d.kmers[..], &d.counts[..])
            }
        };
        Ok(kmers.binary_search(&code).ok().map(|i| counts[i]))
    }

    /// Wrap into a sequential merge input.
    pub fn into_input(self) -> StoreInput {
        let name = self.path.display().to_string();
        StoreInput {
            reader: self,
            name,
            bucket: 0,
            pos: 0,
            kmer: Kmer::default(),
            count: 0,
            valid: false,
        }
    }
}

/// Sequential cursor over a store: the "raw counted-store reader" input.
pub struct StoreInput {
    reader: StoreReader,
    name: String,
    bucket: usize,
    pos: usize,
    kmer: Kmer,
    count: u64,
    valid: bool,
}

impl StoreInput {
    /// Open `path` as a merge input.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(StoreReader::open(path)?.into_input())
    }

    /// Move to the next record. `false` once every bucket is consumed.
    pub fn advance(&mut self) -> Result<bool, StoreError> {
        while self.bucket < self.reader.buckets() {
            if self.pos < self.reader.bucket_len(self.bucket) {
                let (k, c) = self.reader.record(self.bucket, self.pos)?;
                self.pos += 1;
                self.kmer = Kmer(k);
                self.count = c;
                self.valid = true;
                return Ok(true);
            }
            self.reader.release(self.bucket);
            self.bucket += 1;
            self.pos = 0;
        }
        self.valid = false;
        Ok(false)
    }

    #[inline]
    pub fn kmer(&self) -> Kmer {
        self.kmer
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&self) -> &StoreReader {
        &self.reader
    }
}
