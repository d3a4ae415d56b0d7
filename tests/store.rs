use kira_kmer_algebra::*;
use tempfile::tempdir;

fn records(k: usize, n: u64, stride: u64) -> Vec<(Kmer, u64)> {
    let mask = if k == 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 };
    (0..n)
        .map(|i| (Kmer((i * stride) & mask), i % 7 + 1))
        .collect()
}

fn write_store(path: &std::path::Path, opts: StoreOptions, recs: &[(Kmer, u64)]) {
    let mut w = StoreWriter::create(path, opts).unwrap();
    w.prepare().unwrap();
    for &(k, c) in recs {
        w.add_record(k, c).unwrap();
    }
    w.finish_iteration().unwrap();
}

fn drain(mut input: StoreInput) -> Vec<(Kmer, u64)> {
    let mut out = Vec::new();
    while input.advance().unwrap() {
        out.push((input.kmer(), input.count()));
    }
    assert!(!input.is_valid());
    out
}

#[test]
fn store_streams_back_in_order_for_both_encodings() {
    let dir = tempdir().unwrap();
    let recs = records(11, 5_000, 797);
    for compression in [Compression::None, Compression::DeltaVarint] {
        let path = dir.path().join(format!("s-{compression:?}.kcs"));
        let opts = StoreOptions::new(11)
            .with_bucket_bits(6)
            .compression(compression);
        write_store(&path, opts, &recs);

        let reader = StoreReader::open(&path).unwrap();
        assert_eq!(reader.mer_size(), 11);
        assert_eq!(reader.total_records(), recs.len() as u64);
        assert_eq!(reader.compression(), compression);
        assert_eq!(reader.buckets(), 64);
        assert_eq!(drain(reader.into_input()), recs);
        assert!(!dir.path().join(format!("s-{compression:?}.kcs.tmp")).exists());
    }
}

#[test]
fn lookup_hits_and_misses() {
    let dir = tempdir().unwrap();
    let recs = records(8, 300, 211);
    for compression in [Compression::None, Compression::DeltaVarint] {
        let path = dir.path().join(format!("l-{compression:?}.kcs"));
        write_store(&path, StoreOptions::new(8).compression(compression), &recs);
        let reader = StoreReader::open(&path).unwrap();
        for &(k, c) in recs.iter().step_by(17) {
            assert_eq!(reader.lookup(k).unwrap(), Some(c));
        }
        assert_eq!(reader.lookup(Kmer(recs[0].0.code() + 1)).unwrap(), None);
        // wider than 2k bits
        assert_eq!(reader.lookup(Kmer(1 << 20)).unwrap(), None);
    }
}

#[test]
fn writer_rejects_out_of_order_and_duplicates() {
    let dir = tempdir().unwrap();
    let mut w = StoreWriter::create(dir.path().join("bad.kcs"), StoreOptions::new(4)).unwrap();
    w.prepare().unwrap();
    w.add_record(Kmer(10), 1).unwrap();
    assert!(matches!(
        w.add_record(Kmer(10), 1),
        Err(StoreError::OutOfOrder { prev: 10, next: 10 })
    ));
    assert!(matches!(
        w.add_record(Kmer(3), 1),
        Err(StoreError::OutOfOrder { .. })
    ));
    assert!(matches!(
        w.add_record(Kmer(1 << 8), 1),
        Err(StoreError::KmerTooWide { .. })
    ));
}

#[test]
fn writer_requires_prepare() {
    let dir = tempdir().unwrap();
    let mut w = StoreWriter::create(dir.path().join("np.kcs"), StoreOptions::new(4)).unwrap();
    assert!(matches!(
        w.add_record(Kmer(1), 1),
        Err(StoreError::NotPrepared(_))
    ));
    assert!(StoreWriter::create(dir.path().join("k0.kcs"), StoreOptions::new(0)).is_err());
    assert!(StoreWriter::create(dir.path().join("k33.kcs"), StoreOptions::new(33)).is_err());
}

#[test]
fn empty_store_and_bucket_clamping() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.kcs");
    write_store(&path, StoreOptions::new(2).with_bucket_bits(12), &[]);
    let reader = StoreReader::open(&path).unwrap();
    assert_eq!(reader.total_records(), 0);
    // 2k = 4 bits available
    assert_eq!(reader.buckets(), 16);
    assert!(drain(reader.into_input()).is_empty());
}

#[test]
fn full_width_kmers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k32.kcs");
    let recs = vec![(Kmer(0), 1), (Kmer(1 << 63), 2), (Kmer(u64::MAX), 3)];
    write_store(&path, StoreOptions::new(32), &recs);
    let input = StoreInput::open(&path).unwrap();
    assert_eq!(drain(input), recs);
}

#[test]
fn open_rejects_garbage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.kcs");
    std::fs::write(&path, vec![0xABu8; 128]).unwrap();
    assert!(matches!(
        StoreReader::open(&path),
        Err(StoreError::Format(_))
    ));

    // damaged headers and directories of an otherwise valid store
    let good = dir.path().join("good.kcs");
    write_store(&good, StoreOptions::new(32).with_bucket_bits(4), &[(Kmer(9), 1)]);
    let bytes = std::fs::read(&good).unwrap();
    let patches: [(usize, &[u8]); 4] = [
        // bucket_bits past the shift width
        (11, &[40]),
        // bucket_bits above the writer's cap, with a matching bucket count
        (11, &[17]),
        // directory offset near u64::MAX
        (24, &[0xF0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
        // first bucket's payload length near u64::MAX
        (40 + 24, &[0xF0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
    ];
    for (i, (at, patch)) in patches.iter().enumerate() {
        let mut damaged = bytes.clone();
        damaged[*at..*at + patch.len()].copy_from_slice(patch);
        if i == 1 {
            damaged[12..16].copy_from_slice(&(1u32 << 17).to_le_bytes());
        }
        let path = dir.path().join(format!("damaged-{i}.kcs"));
        std::fs::write(&path, &damaged).unwrap();
        assert!(
            matches!(StoreReader::open(&path), Err(StoreError::Format(_))),
            "patch {i} was accepted"
        );
    }
}

#[test]
fn failed_advance_ends_the_merge() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("truncated.kcs");
    write_store(
        &path,
        StoreOptions::new(4)
            .with_bucket_bits(0)
            .compression(Compression::DeltaVarint),
        &[(Kmer(1), 1), (Kmer(2), 1)],
    );
    // one bucket: payload starts right after the 40-byte header and the
    // 32-byte directory entry; turn every varint into a continuation byte
    let mut bytes = std::fs::read(&path).unwrap();
    for b in &mut bytes[72..] {
        *b = 0x80;
    }
    std::fs::write(&path, &bytes).unwrap();

    let memory = MemoryInput::new("m", 4, vec![(Kmer(1), 5), (Kmer(3), 5)]);
    let mut node = OperationNode::new(
        Operation::UnionSum,
        vec![memory.into(), StoreInput::open(&path).unwrap().into()],
    )
    .unwrap();
    node.initialize(true).unwrap();
    assert!(matches!(
        node.next_mer(),
        Err(OpError::Store(StoreError::Format(_)))
    ));
    assert_eq!(node.state(), NodeState::Exhausted);
    assert!(!node.next_mer().unwrap());
}

#[test]
fn dropped_writer_still_publishes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.kcs");
    {
        let mut w = StoreWriter::create(&path, StoreOptions::new(4)).unwrap();
        w.prepare().unwrap();
        w.add_record(Kmer(5), 2).unwrap();
    }
    let reader = StoreReader::open(&path).unwrap();
    assert_eq!(reader.lookup(Kmer(5)).unwrap(), Some(2));
}

#[test]
fn stores_feed_the_merge() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.kcs");
    let b = dir.path().join("b.kcs");
    let out = dir.path().join("out.kcs");
    write_store(&a, StoreOptions::new(6), &[(Kmer(1), 3), (Kmer(40), 2)]);
    write_store(
        &b,
        StoreOptions::new(6).compression(Compression::DeltaVarint),
        &[(Kmer(1), 5), (Kmer(41), 1)],
    );

    let mut node = OperationNode::new(
        Operation::UnionMax,
        vec![
            StoreInput::open(&a).unwrap().into(),
            StoreInput::open(&b).unwrap().into(),
        ],
    )
    .unwrap()
    .with_output(Box::new(
        StoreWriter::create(&out, StoreOptions::new(6)).unwrap(),
    ));
    assert_eq!(node.run().unwrap(), 3);

    let merged = drain(StoreInput::open(&out).unwrap());
    assert_eq!(merged, vec![(Kmer(1), 5), (Kmer(40), 2), (Kmer(41), 1)]);
}
