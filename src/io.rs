//! On-disk `.kcs` count store: header + bucket directory + payload.
//! Sections are 8-byte aligned. All integers are little-endian.
//!
//! Buckets are the top `bucket_bits` bits of the `2k`-bit code, so walking
//! buckets in order and records within a bucket in order yields the k-mers in
//! ascending order. The directory is the store's index.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::encode::{Kmer, MAX_MER_SIZE, StrandMode, mer_mask};
use crate::sink::KmerSink;
use crate::store::StoreError;

pub const KCS_MAGIC: u32 = 0x4B_43_53_31; // "KCS1"
pub const KCS_VERSION: u32 = 1;

pub(crate) const HEADER_BYTES: u64 = 40;
pub(crate) const DIR_ENTRY_BYTES: u64 = 32;
pub(crate) const MAX_BUCKET_BITS: u8 = 16;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Two plain `u64` arrays per bucket (k-mers, counts).
    #[default]
    None = 0,
    /// Interleaved LEB128 varints: k-mer delta from the previous record, count.
    DeltaVarint = 1,
}

impl Compression {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Compression::None),
            1 => Some(Compression::DeltaVarint),
            _ => None,
        }
    }
}

/// Layout options for a store being written.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    mer_size: usize,
    strand: StrandMode,
    bucket_bits: u8,
    compression: Compression,
}

impl StoreOptions {
    /// Options for k-mers of length `mer_size` (1..=32).
    pub fn new(mer_size: usize) -> Self {
        Self {
            mer_size,
            strand: StrandMode::Canonical,
            bucket_bits: 12,
            compression: Compression::None,
        }
    }
    /// Strand mode recorded in the header (informational).
    pub fn strand(mut self, s: StrandMode) -> Self {
        self.strand = s;
        self
    }
    /// Number of top bits used for bucketing; clamped to `2k` and 16.
    pub fn with_bucket_bits(mut self, b: u8) -> Self {
        self.bucket_bits = b;
        self
    }
    /// Payload encoding.
    pub fn compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn mer_size(&self) -> usize {
        self.mer_size
    }

    pub(crate) fn effective_bucket_bits(&self) -> u8 {
        let max_b = (2 * self.mer_size).min(MAX_BUCKET_BITS as usize) as u8;
        if self.bucket_bits > max_b {
            tracing::debug!(
                requested = self.bucket_bits,
                adjusted = max_b,
                "bucket bits clamped to the code width"
            );
            max_b
        } else {
            self.bucket_bits
        }
    }
}

/// Bucket id of a code: its top `bucket_bits` bits out of `2k`.
#[inline]
pub(crate) fn bucket_of(code: u64, mer_size: usize, bucket_bits: u8) -> usize {
    if bucket_bits == 0 {
        0
    } else {
        (code >> (2 * mer_size as u32 - bucket_bits as u32)) as usize
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub mer_size: u16,
    pub strand_u8: u8,
    pub bucket_bits: u8,
    pub buckets: u32,
    pub total_records: u64,
    pub dir_offset: u64,
    pub compression_u8: u8,
    pub reserved0: u8,
    pub reserved1: u16,
    pub reserved2: u32,
}

impl FileHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LE>(self.magic)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u16::<LE>(self.mer_size)?;
        w.write_u8(self.strand_u8)?;
        w.write_u8(self.bucket_bits)?;
        w.write_u32::<LE>(self.buckets)?;
        w.write_u64::<LE>(self.total_records)?;
        w.write_u64::<LE>(self.dir_offset)?;
        w.write_u8(self.compression_u8)?;
        w.write_u8(self.reserved0)?;
        w.write_u16::<LE>(self.reserved1)?;
        w.write_u32::<LE>(self.reserved2)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(FileHeader {
            magic: r.read_u32::<LE>()?,
            version: r.read_u32::<LE>()?,
            mer_size: r.read_u16::<LE>()?,
            strand_u8: r.read_u8()?,
            bucket_bits: r.read_u8()?,
            buckets: r.read_u32::<LE>()?,
            total_records: r.read_u64::<LE>()?,
            dir_offset: r.read_u64::<LE>()?,
            compression_u8: r.read_u8()?,
            reserved0: r.read_u8()?,
            reserved1: r.read_u16::<LE>()?,
            reserved2: r.read_u32::<LE>()?,
        })
    }

    pub fn compression(&self) -> Option<Compression> {
        Compression::from_u8(self.compression_u8)
    }

    pub fn strand(&self) -> Option<StrandMode> {
        StrandMode::from_u8(self.strand_u8)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct BucketDir {
    /// Start of the k-mer array, or of the varint stream when compressed.
    pub off_kmers: u64,
    /// Start of the count array (0 when compressed).
    pub off_counts: u64,
    /// Number of records in the bucket.
    pub records: u64,
    /// Payload size in bytes.
    pub payload_bytes: u64,
}

impl BucketDir {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LE>(self.off_kmers)?;
        w.write_u64::<LE>(self.off_counts)?;
        w.write_u64::<LE>(self.records)?;
        w.write_u64::<LE>(self.payload_bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(BucketDir {
            off_kmers: r.read_u64::<LE>()?,
            off_counts: r.read_u64::<LE>()?,
            records: r.read_u64::<LE>()?,
            payload_bytes: r.read_u64::<LE>()?,
        })
    }

    fn u64_slice<'a>(map: &'a [u8], off: u64, len: u64) -> Result<&'a [u64], StoreError> {
        if len == 0 {
            return Ok(&[]);
        }
        let start = off as usize;
        let bytes = (len as usize)
            .checked_mul(std::mem::size_of::<u64>())
            .and_then(|n| start.checked_add(n))
            .and_then(|end| map.get(start..end))
            .ok_or_else(|| StoreError::Format(format!("array of {len} at {start} out of bounds")))?;
        bytemuck::try_cast_slice(bytes).map_err(|e| StoreError::Cast(format!("{e:?}")))
    }

    pub fn kmers_slice<'a>(&self, map: &'a [u8]) -> Result<&'a [u64], StoreError> {
        Self::u64_slice(map, self.off_kmers, self.records)
    }

    pub fn counts_slice<'a>(&self, map: &'a [u8]) -> Result<&'a [u64], StoreError> {
        Self::u64_slice(map, self.off_counts, self.records)
    }

    pub fn payload_bytes<'a>(&self, map: &'a [u8]) -> Result<&'a [u8], StoreError> {
        let start = self.off_kmers as usize;
        let len = self.payload_bytes as usize;
        start
            .checked_add(len)
            .and_then(|end| map.get(start..end))
            .ok_or_else(|| StoreError::Format(format!("payload of {len} at {start} out of bounds")))
    }
}

enum WriterState {
    Created,
    Writing(Box<Pending>),
    Finished,
}

struct Pending {
    out: BufWriter<File>,
    dir: Vec<BucketDir>,
    write_pos: u64,
    cur_bucket: usize,
    kmers: Vec<u64>,
    counts: Vec<u64>,
    last: Option<u64>,
    total: u64,
}

/// Streaming writer for a sorted count store; the crate's persistent
/// [`KmerSink`].
///
/// Records go to `<path>.tmp`; [`KmerSink::finish_iteration`] writes the
/// directory and renames the file into place.
pub struct StoreWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    options: StoreOptions,
    bucket_bits: u8,
    state: WriterState,
}

impl StoreWriter {
    /// Describe a store to be written at `path`. Nothing touches the disk
    /// until [`KmerSink::prepare`].
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let k = options.mer_size;
        if k == 0 || k > MAX_MER_SIZE {
            return Err(StoreError::Format(format!("mer size {k} outside 1..=32")));
        }
        let path = path.as_ref().to_path_buf();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let bucket_bits = options.effective_bucket_bits();
        Ok(Self {
            path,
            tmp_path: PathBuf::from(tmp),
            options,
            bucket_bits,
            state: WriterState::Created,
        })
    }

    /// Final location of the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn buckets(&self) -> usize {
        1usize << self.bucket_bits
    }

    fn header(&self, total_records: u64) -> FileHeader {
        FileHeader {
            magic: KCS_MAGIC,
            version: KCS_VERSION,
            mer_size: self.options.mer_size as u16,
            strand_u8: self.options.strand.to_u8(),
            bucket_bits: self.bucket_bits,
            buckets: self.buckets() as u32,
            total_records,
            dir_offset: HEADER_BYTES,
            compression_u8: self.options.compression as u8,
            reserved0: 0,
            reserved1: 0,
            reserved2: 0,
        }
    }

    fn pending(&mut self) -> Result<&mut Pending, StoreError> {
        match &mut self.state {
            WriterState::Writing(p) => Ok(p),
            _ => Err(StoreError::NotPrepared(self.path.clone())),
        }
    }
}

impl Pending {
    fn pad_to_8(&mut self) -> std::io::Result<()> {
        let aligned = (self.write_pos + 7) & !7;
        let pad = (aligned - self.write_pos) as usize;
        if pad > 0 {
            self.out.write_all(&[0u8; 8][..pad])?;
            self.write_pos = aligned;
        }
        Ok(())
    }

    fn flush_bucket(&mut self, compression: Compression) -> std::io::Result<()> {
        if self.kmers.is_empty() {
            return Ok(());
        }
        self.pad_to_8()?;
        let n = self.kmers.len() as u64;
        let d = &mut self.dir[self.cur_bucket];
        d.records = n;
        d.off_kmers = self.write_pos;

        match compression {
            Compression::None => {
                self.out.write_all(bytemuck::cast_slice::<u64, u8>(&self.kmers))?;
                d.off_counts = self.write_pos + n * 8;
                self.out.write_all(bytemuck::cast_slice::<u64, u8>(&self.counts))?;
                d.payload_bytes = n * 16;
            }
            Compression::DeltaVarint => {
                let mut bytes = 0usize;
                let mut prev = 0u64;
                for (i, (&k, &c)) in self.kmers.iter().zip(&self.counts).enumerate() {
                    let delta = if i == 0 { k } else { k - prev };
                    bytes += write_varu64(delta, &mut self.out)?;
                    bytes += write_varu64(c, &mut self.out)?;
                    prev = k;
                }
                d.off_counts = 0;
                d.payload_bytes = bytes as u64;
            }
        }

        self.write_pos += d.payload_bytes;
        self.kmers.clear();
        self.counts.clear();
        Ok(())
    }
}

impl KmerSink for StoreWriter {
    fn prepare(&mut self) -> Result<(), StoreError> {
        match self.state {
            WriterState::Writing(_) => return Ok(()),
            WriterState::Finished => {
                return Err(StoreError::Format(format!(
                    "store {} already finalized",
                    self.path.display()
                )));
            }
            WriterState::Created => {}
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.tmp_path)?;
        let mut out = BufWriter::new(file);

        self.header(0).write_to(&mut out)?;
        let dir = vec![BucketDir::default(); self.buckets()];
        for d in &dir {
            d.write_to(&mut out)?;
        }

        tracing::debug!(
            path = %self.path.display(),
            k = self.options.mer_size,
            bucket_bits = self.bucket_bits,
            "store writer prepared"
        );

        self.state = WriterState::Writing(Box::new(Pending {
            out,
            dir,
            write_pos: HEADER_BYTES + DIR_ENTRY_BYTES * self.buckets() as u64,
            cur_bucket: 0,
            kmers: Vec::new(),
            counts: Vec::new(),
            last: None,
            total: 0,
        }));
        Ok(())
    }

    fn add_record(&mut self, kmer: Kmer, count: u64) -> Result<(), StoreError> {
        let k = self.options.mer_size;
        let bits = self.bucket_bits;
        let compression = self.options.compression;
        let p = self.pending()?;

        let code = kmer.code();
        if code & !mer_mask(k) != 0 {
            return Err(StoreError::KmerTooWide { code, mer_size: k });
        }
        if let Some(last) = p.last {
            if code <= last {
                return Err(StoreError::OutOfOrder { prev: last, next: code });
            }
        }

        let b = bucket_of(code, k, bits);
        if b != p.cur_bucket {
            p.flush_bucket(compression)?;
            p.cur_bucket = b;
        }
        p.kmers.push(code);
        p.counts.push(count);
        p.last = Some(code);
        p.total += 1;
        Ok(())
    }

    fn finish_iteration(&mut self) -> Result<(), StoreError> {
        let pending = match std::mem::replace(&mut self.state, WriterState::Finished) {
            WriterState::Writing(p) => p,
            WriterState::Finished => return Ok(()),
            WriterState::Created => {
                self.state = WriterState::Created;
                return Err(StoreError::NotPrepared(self.path.clone()));
            }
        };
        let mut p = *pending;
        p.flush_bucket(self.options.compression)?;
        p.pad_to_8()?;

        p.out.seek(SeekFrom::Start(0))?;
        self.header(p.total).write_to(&mut p.out)?;
        for d in &p.dir {
            d.write_to(&mut p.out)?;
        }
        p.out.flush()?;

        let file = p.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp_path, &self.path)?;

        tracing::debug!(
            path = %self.path.display(),
            records = p.total,
            "store finalized"
        );
        Ok(())
    }

    fn store_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn mer_size(&self) -> Option<usize> {
        Some(self.options.mer_size)
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Writing(_)) {
            if let Err(e) = self.finish_iteration() {
                tracing::warn!(path = %self.path.display(), error = %e, "store finalize on drop failed");
            }
        }
    }
}

// ---------------- Varint (LEB128) utils ----------------

#[inline]
pub(crate) fn write_varu64<W: Write>(mut x: u64, w: &mut W) -> std::io::Result<usize> {
    let mut n = 0usize;
    while x >= 0x80 {
        w.write_all(&[(x as u8) | 0x80])?;
        x >>= 7;
        n += 1;
    }
    w.write_all(&[x as u8])?;
    Ok(n + 1)
}

/// Read one varint from `bytes` at `*at`, advancing it. `None` if truncated
/// or longer than 10 bytes.
#[inline]
pub(crate) fn read_varu64(bytes: &[u8], at: &mut usize) -> Option<u64> {
    let mut x: u64 = 0;
    let mut s = 0u32;
    loop {
        let b = *bytes.get(*at)?;
        *at += 1;
        if s >= 64 {
            return None;
        }
        x |= ((b & 0x7F) as u64) << s;
        if (b & 0x80) == 0 {
            return Some(x);
        }
        s += 7;
    }
}
