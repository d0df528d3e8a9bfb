//! Bloom filter (C5): a double-hashed probabilistic pre-filter for the
//! watch index. Never produces a false negative; every positive must still
//! be confirmed against the exact watch set.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const DJB2_ZERO_SUBSTITUTE: u32 = 0x27d4eb2d;

fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn djb2_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in data {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

pub struct BloomFilter {
    bits: Vec<u32>,
    m: u64,
    k: u32,
}

impl BloomFilter {
    /// Size the filter for `n` expected items at false-positive rate `p`
    /// (clamped to `[1e-6, 0.5]`), then insert `items`.
    pub fn with_fp_rate<I, S>(items: I, n: usize, p: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let p = p.clamp(1e-6, 0.5);
        let n_f = n as f64;
        let ln2 = std::f64::consts::LN_2;
        let m_raw = if n == 0 {
            0.0
        } else {
            -(n_f * p.ln()) / (ln2 * ln2)
        };
        let m = (m_raw.ceil() as u64).max(64);
        let n_eff = n.max(1) as f64;
        let k = (((m as f64 / n_eff) * ln2).round() as u32).max(1);

        let words = ((m + 31) / 32) as usize;
        let mut filter = BloomFilter {
            bits: vec![0u32; words],
            m,
            k,
        };
        for item in items {
            filter.add(item.as_ref());
        }
        filter
    }

    fn indices(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = fnv1a_32(item) as u64;
        let mut h2 = djb2_32(item) as u64;
        if h2 == 0 {
            h2 = DJB2_ZERO_SUBSTITUTE as u64;
        }
        let m = self.m;
        (0..self.k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2))) % m)
    }

    pub fn add(&mut self, item: &[u8]) {
        let idxs: Vec<u64> = self.indices(item).collect();
        for idx in idxs {
            let word = (idx / 32) as usize;
            let bit = (idx % 32) as u32;
            self.bits[word] |= 1u32 << bit;
        }
    }

    /// Never a false negative: if this returns `false`, the item was never
    /// added.
    pub fn might_contain(&self, item: &[u8]) -> bool {
        self.indices(item).all(|idx| {
            let word = (idx / 32) as usize;
            let bit = (idx % 32) as u32;
            self.bits[word] & (1u32 << bit) != 0
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.m
    }

    pub fn num_hashes(&self) -> u32 {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_for_small_sets_use_the_64_bit_floor() {
        let filter = BloomFilter::with_fp_rate(std::iter::empty::<&str>(), 0, 0.01);
        assert_eq!(filter.num_bits(), 64);
        assert!(filter.num_hashes() >= 1);
    }

    #[test]
    fn never_false_negative_for_inserted_items() {
        let addrs = vec!["addr1", "addr2", "addr3", "addr4", "addr5"];
        let filter = BloomFilter::with_fp_rate(addrs.iter().copied(), addrs.len(), 0.01);
        for a in &addrs {
            assert!(filter.might_contain(a.as_bytes()));
        }
    }

    #[test]
    fn absent_items_are_usually_rejected() {
        let addrs: Vec<String> = (0..200).map(|i| format!("addr-{i}")).collect();
        let filter = BloomFilter::with_fp_rate(addrs.iter(), addrs.len(), 0.01);
        let mut false_positives = 0;
        for i in 0..1000 {
            let probe = format!("not-in-set-{i}");
            if filter.might_contain(probe.as_bytes()) {
                false_positives += 1;
            }
        }
        // Loose bound: fp rate targeted at 1%, allow slack for a small test set.
        assert!(false_positives < 100, "got {false_positives} false positives");
    }
}
