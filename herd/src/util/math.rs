//! Math utilites.

use num_traits::PrimInt;

/// Rounds up `src` to the power of two `factor`.
pub fn round_up_pot<T: PrimInt>(src: T, factor: T) -> T {
    debug_assert_eq!(factor.count_ones(), 1); // .is_power_of_two()
    let minus1 = factor - T::one();
    (src + minus1) & !minus1
}

/// Performs integer division between a and b rounding up, instead of down
pub fn round_up_div<T: PrimInt>(a: T, b: T) -> T {
    (a + (b - T::one())) / b
}

/// Amount of mips in a full chain for the given size, `1 + floor(log2(max(width, height)))`.
pub fn mip_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Size of a mip, never smaller than one texel.
pub fn mip_size(size: u32, mip: u32) -> u32 {
    (size >> mip).max(1)
}

/// Range of source texels that one destination texel covers when reducing `src` into `dst`.
///
/// Odd source sizes make the last destination texel cover three texels so no
/// source texel is dropped.
pub fn reduction_footprint(dst_texel: u32, src: u32, dst: u32) -> std::ops::Range<u32> {
    let start = (dst_texel as u64 * src as u64 / dst as u64) as u32;
    let end = round_up_div((dst_texel as u64 + 1) * src as u64, dst as u64) as u32;
    start..end.min(src).max(start + 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mip_count_matches_log2() {
        assert_eq!(mip_count(1, 1), 1);
        assert_eq!(mip_count(2, 1), 2);
        assert_eq!(mip_count(1920, 1080), 11);
        assert_eq!(mip_count(1024, 1024), 11);
        assert_eq!(mip_count(1023, 7), 10);
        assert_eq!(mip_count(0, 0), 1);
    }

    #[test]
    fn footprints_cover_source() {
        for (src, dst) in [(7, 3), (8, 4), (5, 2), (1, 1), (3, 1)] {
            let mut covered = vec![false; src as usize];
            for texel in 0..dst {
                for s in reduction_footprint(texel, src, dst) {
                    covered[s as usize] = true;
                }
            }
            assert!(covered.iter().all(|&c| c), "{src} -> {dst}");
        }
        assert_eq!(reduction_footprint(2, 7, 3), 4..7);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up_div(65u32, 64), 2);
        assert_eq!(round_up_div(64u32, 64), 1);
        assert_eq!(round_up_pot(17u64, 16), 32);
    }
}
