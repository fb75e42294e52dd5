//! Random key/value workload generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// One generated key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Generates `count` pairs of alphanumeric keys and values with the given
/// lengths. Keys are independent draws, so duplicates are possible but
/// vanishingly rare at benchmark sizes.
pub fn generate_pairs(count: usize, key_len: usize, value_len: usize) -> Vec<KvPair> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| KvPair {
            key: random_bytes(&mut rng, key_len),
            value: random_bytes(&mut rng, value_len),
        })
        .collect()
}

fn random_bytes<R: Rng>(rng: &mut R, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.sample(Alphanumeric)).collect()
}
