//! LSD radix sort for `u64` k-mer codes, plus run-length collapse into counts.
//! 8-bit passes; passes over bytes above the code width are skipped.

/// Sort `keys` ascending. Only the lower `bits` bits are considered, so codes
/// for small k need fewer passes. The scratch buffer is allocated once.
pub fn radix_sort_u64(keys: &mut Vec<u64>, bits: u32) {
    let n = keys.len();
    if n <= 1 {
        return;
    }

    let passes = bits.div_ceil(8).clamp(1, 8);
    let mut tmp = vec![0u64; n];

    for pass in 0..passes {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        for &k in keys.iter() {
            counts[((k >> shift) & 0xFF) as usize] += 1;
        }

        // Every key shares this byte; the pass would be the identity.
        if counts.iter().any(|&c| c == n) {
            continue;
        }

        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        for &k in keys.iter() {
            let b = ((k >> shift) & 0xFF) as usize;
            tmp[counts[b]] = k;
            counts[b] += 1;
        }

        std::mem::swap(keys, &mut tmp);
    }
}

/// Collapse a sorted run of codes into `(code, occurrences)` pairs.
pub fn run_length(sorted: &[u64], out: &mut Vec<(u64, u64)>) {
    let mut iter = sorted.iter().copied();
    let Some(mut prev) = iter.next() else {
        return;
    };
    let mut n = 1u64;
    for c in iter {
        if c == prev {
            n = n.saturating_add(1);
        } else {
            out.push((prev, n));
            prev = c;
            n = 1;
        }
    }
    out.push((prev, n));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_and_collapses() {
        let mut keys = vec![0x3F0, 7, 0x3F0, 1, 0xFFFF_0000, 7, 7];
        radix_sort_u64(&mut keys, 32);
        assert_eq!(keys, vec![1, 7, 7, 7, 0x3F0, 0x3F0, 0xFFFF_0000]);

        let mut runs = Vec::new();
        run_length(&keys, &mut runs);
        assert_eq!(runs, vec![(1, 1), (7, 3), (0x3F0, 2), (0xFFFF_0000, 1)]);
    }

    #[test]
    fn empty_input_yields_no_runs() {
        let mut runs = Vec::new();
        run_length(&[], &mut runs);
        assert!(runs.is_empty());
    }
}
