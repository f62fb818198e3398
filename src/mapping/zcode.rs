//! Z-order curve bit arithmetic shared by the mappings, the distributed
//! nearest-neighbor search and the in-memory index.
//!
//! A Z-address is built by interleaving the bits of every dimension, most
//! significant first: bit `i` of the address is bit `depth - 1 - i / dim` of
//! dimension `i % dim`. Sorting keys by their Z-address linearizes the
//! multi-dimensional space while keeping spatial locality.

use super::Zone;

/// The largest coordinate representable with `depth` bits
pub fn max_coordinate(depth: u32) -> u64 {
    low_mask(depth)
}

/// A mask with the low `width` bits set
pub fn low_mask(width: u32) -> u64 {
    if width == 0 {
        0
    } else if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Computes the Z-address of a key as big-endian bytes. Addresses of equal
/// dimensionality compare like their position on the curve.
pub fn interleave(key: &[u64], depth: u32) -> Vec<u8> {
    let dim = key.len();
    let total_bits = dim * depth as usize;
    let mut address = vec![0u8; total_bits.div_ceil(8)];
    for i in 0..total_bits {
        let coordinate = key[i % dim];
        let significance = depth - 1 - (i / dim) as u32;
        if (coordinate >> significance) & 1 == 1 {
            address[i / 8] |= 0x80 >> (i % 8);
        }
    }
    address
}

/// Returns the i-th bit of the Z-address of a key, without materializing the
/// whole address
pub fn address_bit(key: &[u64], depth: u32, position: usize) -> bool {
    let dim = key.len();
    let significance = depth - 1 - (position / dim) as u32;
    (key[position % dim] >> significance) & 1 == 1
}

/// Expands a partition code (a string of `0`/`1` address bits) into the
/// axis-aligned box it covers: the start key takes the prefix bits zero-filled,
/// the end key one-fills the remainder.
///
/// The box is conservative. It may be a superset of the true Z-order interval
/// of the prefix, never a subset, so callers must intersect geometrically
/// instead of comparing prefixes.
pub fn prefix_zone(prefix: &str, dim: usize, depth: u32) -> Zone {
    let mut start = vec![0u64; dim];
    let mut assigned = vec![0u32; dim];
    for (i, bit) in prefix.chars().enumerate() {
        let d = i % dim;
        let significance = depth - 1 - (i / dim) as u32;
        if bit == '1' {
            start[d] |= 1u64 << significance;
        }
        assigned[d] += 1;
    }

    let end = start
        .iter()
        .zip(assigned.iter())
        .map(|(s, a)| s | low_mask(depth - a))
        .collect();

    Zone::new(start, end)
}

/// The hyper-cube neighborhood of a key after freeing its low `hops` bits on
/// every axis. `hops == depth` covers the entire key space.
pub fn neighborhood(key: &[u64], hops: u32, depth: u32) -> Zone {
    let mask = low_mask(hops.min(depth));
    let start = key.iter().map(|k| k & !mask).collect();
    let end = key.iter().map(|k| k | mask).collect();
    Zone::new(start, end)
}

/// Euclidean distance between two points of the key space
pub fn euclidean_distance(a: &[u64], b: &[u64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x.abs_diff(*y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// The axis-aligned cube of the given radius centered on a key, clamped to
/// the key space bounds
pub fn cube_around(key: &[u64], radius: f64, depth: u32) -> Zone {
    let r = radius.max(0.0).ceil() as u64;
    let max = max_coordinate(depth);
    let start = key.iter().map(|k| k.saturating_sub(r)).collect();
    let end = key.iter().map(|k| k.saturating_add(r).min(max)).collect();
    Zone::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_orders_keys_along_the_curve() {
        // dim 2, depth 2: addresses follow the Z pattern through the 4x4 grid
        let quadrant_order = [
            vec![0u64, 0],
            vec![1, 1],
            vec![2, 2],
            vec![3, 3],
        ];
        let mut addresses: Vec<Vec<u8>> =
            quadrant_order.iter().map(|k| interleave(k, 2)).collect();
        let mut sorted = addresses.clone();
        sorted.sort();
        assert_eq!(addresses, sorted);

        addresses.dedup();
        assert_eq!(addresses.len(), quadrant_order.len());
    }

    #[test]
    fn interleave_pins_known_address() {
        // key (1, 1) at depth 2: high bits 0,0 then low bits 1,1
        assert_eq!(interleave(&[1, 1], 2), vec![0b0011_0000]);
        assert_eq!(interleave(&[2, 3], 2), vec![0b1101_0000]);
    }

    #[test]
    fn address_bit_matches_interleave() {
        let key = vec![0b1010u64, 0b0110];
        let address = interleave(&key, 4);
        for position in 0..8 {
            let from_bytes = (address[position / 8] >> (7 - position % 8)) & 1 == 1;
            assert_eq!(address_bit(&key, 4, position), from_bytes);
        }
    }

    #[test]
    fn prefix_zone_zero_fills_start_and_one_fills_end() {
        // one bit assigned on axis 0, none on axis 1
        let zone = prefix_zone("0", 2, 2);
        assert_eq!(zone, Zone::new(vec![0, 0], vec![1, 3]));

        let zone = prefix_zone("1", 2, 2);
        assert_eq!(zone, Zone::new(vec![2, 0], vec![3, 3]));

        // empty prefix covers the whole space
        let zone = prefix_zone("", 2, 2);
        assert_eq!(zone, Zone::new(vec![0, 0], vec![3, 3]));
    }

    #[test]
    fn prefix_zone_supports_full_depth() {
        let zone = prefix_zone("1", 1, 64);
        assert_eq!(zone.start, vec![1u64 << 63]);
        assert_eq!(zone.end, vec![u64::MAX]);
    }

    #[test]
    fn neighborhood_grows_until_it_covers_the_space() {
        let key = vec![5u64, 9];
        let depth = 4;

        let mut previous = neighborhood(&key, 0, depth);
        assert_eq!(previous, Zone::new(key.clone(), key.clone()));

        for hops in 1..=depth {
            let region = neighborhood(&key, hops, depth);
            assert!(region.contains(&key));
            assert!(region.contains(&previous.start));
            assert!(region.contains(&previous.end));
            previous = region;
        }

        assert_eq!(
            previous,
            Zone::new(vec![0, 0], vec![max_coordinate(depth), max_coordinate(depth)])
        );
    }

    #[test]
    fn cube_around_clamps_to_the_key_space() {
        let zone = cube_around(&[1, 14], 3.0, 4);
        assert_eq!(zone, Zone::new(vec![0, 11], vec![4, 15]));
    }

    #[test]
    fn euclidean_distance_simple() {
        assert_eq!(euclidean_distance(&[0, 0], &[3, 4]), 5.0);
        assert_eq!(euclidean_distance(&[7, 7], &[7, 7]), 0.0);
    }
}
