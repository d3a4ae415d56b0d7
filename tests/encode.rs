use kira_kmer_algebra::encode::*;

#[test]
fn test_encode_revcomp_canonical() {
    let s = b"AC";
    let k = 2;
    let code = encode_kmer(s).unwrap();
    assert_eq!(code, 0b0001);

    let rc = revcomp(code, k);
    assert_eq!(rc, 0b1011); // GT

    assert_eq!(canonical(code, k), 0b0001);
    assert_eq!(canonical(rc, k), 0b0001);
}

#[test]
fn test_kmer_display_round_trip() {
    let k = Kmer::from_bases(b"GATTACA").unwrap();
    assert_eq!(k.to_bases(7), "GATTACA");
    assert_eq!(format!("{}", Kmer(0).display(3)), "AAA");
    assert_eq!(Kmer(u64::MAX).to_bases(32), "T".repeat(32));
}

#[test]
fn test_ambiguous_and_oversized_rejected() {
    assert_eq!(encode_kmer(b"ACNT"), None);
    assert_eq!(encode_kmer(b""), None);
    assert_eq!(encode_kmer(&[b'A'; 33]), None);
    assert_eq!(encode_kmer(b"acgu"), encode_kmer(b"ACGT"));
}

#[test]
fn test_rolling_extraction_modes() {
    let seq = b"ACGTT";
    let mut fwd = Vec::new();
    for_each_kmer(seq, 3, StrandMode::Forward, |c| fwd.push(c));
    let expect: Vec<u64> = [&b"ACG"[..], b"CGT", b"GTT"]
        .iter()
        .map(|w| encode_kmer(w).unwrap())
        .collect();
    assert_eq!(fwd, expect);

    let mut rev = Vec::new();
    for_each_kmer(seq, 3, StrandMode::Reverse, |c| rev.push(c));
    assert_eq!(rev, expect.iter().map(|&c| revcomp(c, 3)).collect::<Vec<_>>());

    let mut can = Vec::new();
    for_each_kmer(seq, 3, StrandMode::Canonical, |c| can.push(c));
    assert_eq!(can, expect.iter().map(|&c| canonical(c, 3)).collect::<Vec<_>>());
}

#[test]
fn test_ambiguous_base_resets_window() {
    let mut got = Vec::new();
    for_each_kmer(b"ACGNACG", 3, StrandMode::Forward, |c| got.push(c));
    let acg = encode_kmer(b"ACG").unwrap();
    assert_eq!(got, vec![acg, acg]);

    got.clear();
    for_each_kmer(b"AC", 3, StrandMode::Forward, |c| got.push(c));
    assert!(got.is_empty());
}

#[test]
fn test_full_width_kmer() {
    let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGTA";
    let mut got = Vec::new();
    for_each_kmer(seq, 32, StrandMode::Forward, |c| got.push(c));
    assert_eq!(got.len(), 2);
    assert_eq!(got[0], encode_kmer(&seq[..32]).unwrap());
    assert_eq!(got[1], encode_kmer(&seq[1..]).unwrap());
}
