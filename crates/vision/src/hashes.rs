//! 64-bit perceptual image hashes: average, difference and DCT-based perception hash.
//!
//! All three reduce the image to a small grayscale grid first, so they are robust to
//! re-encoding, mild resizing and small color shifts. Similarity is the Hamming distance.

use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::OnceLock;

/// Distance at or below which two hashes are considered the same picture.
pub const DEFAULT_MATCH_THRESHOLD: u32 = 18;

const AHASH_SIDE: u32 = 8;
const DHASH_WIDTH: u32 = 9;
const DHASH_HEIGHT: u32 = 8;
const PHASH_SIDE: usize = 64;
const PHASH_LOW: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashTriple {
    pub perceptual: u64,
    pub difference: u64,
    pub average: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDistances {
    pub perceptual: u32,
    pub difference: u32,
    pub average: u32,
}

impl HashTriple {
    /// `None` for degenerate (zero-sized) images.
    #[must_use]
    pub fn of(image: &DynamicImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(Self {
            perceptual: perception_hash(image),
            difference: difference_hash(image),
            average: average_hash(image),
        })
    }

    #[must_use]
    pub const fn distances(&self, other: &Self) -> HashDistances {
        HashDistances {
            perceptual: hamming(self.perceptual, other.perceptual),
            difference: hamming(self.difference, other.difference),
            average: hamming(self.average, other.average),
        }
    }
}

impl HashDistances {
    /// Integer mean of the three distances.
    #[must_use]
    pub const fn mean(&self) -> u32 {
        (self.perceptual + self.difference + self.average) / 3
    }

    /// Structure (perception and difference) agrees, or the three hashes agree on average.
    #[must_use]
    pub const fn is_match(&self, threshold: u32) -> bool {
        (self.perceptual <= threshold && self.difference <= threshold) || self.mean() <= threshold
    }
}

#[must_use]
pub const fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn gray_grid(image: &DynamicImage, width: u32, height: u32) -> Vec<f64> {
    image
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8()
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            0.299f64.mul_add(
                f64::from(r),
                0.587f64.mul_add(f64::from(g), 0.114 * f64::from(b)),
            )
        })
        .collect()
}

fn bits_from<I: IntoIterator<Item = bool>>(bits: I) -> u64 {
    bits.into_iter()
        .enumerate()
        .fold(0u64, |acc, (idx, set)| if set { acc | (1 << idx) } else { acc })
}

/// Bit set where the pixel is brighter than the mean of the 8x8 grid.
#[must_use]
pub fn average_hash(image: &DynamicImage) -> u64 {
    let grid = gray_grid(image, AHASH_SIDE, AHASH_SIDE);
    let mean = grid.iter().sum::<f64>() / grid.len() as f64;
    bits_from(grid.iter().map(|&p| p > mean))
}

/// Bit set where a pixel is darker than its right neighbour on a 9x8 grid.
#[must_use]
pub fn difference_hash(image: &DynamicImage) -> u64 {
    let grid = gray_grid(image, DHASH_WIDTH, DHASH_HEIGHT);
    let width = DHASH_WIDTH as usize;
    bits_from((0..DHASH_HEIGHT as usize).flat_map(|y| {
        let row = &grid[y * width..(y + 1) * width];
        (0..width - 1).map(move |x| row[x] < row[x + 1])
    }))
}

fn dct_table() -> &'static [[f64; PHASH_SIDE]; PHASH_LOW] {
    static TABLE: OnceLock<[[f64; PHASH_SIDE]; PHASH_LOW]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0.0; PHASH_SIDE]; PHASH_LOW];
        for (k, row) in table.iter_mut().enumerate() {
            for (n, cell) in row.iter_mut().enumerate() {
                *cell = (PI * k as f64 * (n as f64 + 0.5) / PHASH_SIDE as f64).cos();
            }
        }
        table
    })
}

/// Low-frequency 8x8 block of the 64x64 DCT-II, thresholded at its median.
#[must_use]
pub fn perception_hash(image: &DynamicImage) -> u64 {
    let grid = gray_grid(image, PHASH_SIDE as u32, PHASH_SIDE as u32);
    let table = dct_table();

    // Rows first: rows[y][u] = sum_x grid[y][x] * cos_u(x)
    let mut rows = vec![[0.0f64; PHASH_LOW]; PHASH_SIDE];
    for (y, out) in rows.iter_mut().enumerate() {
        let line = &grid[y * PHASH_SIDE..(y + 1) * PHASH_SIDE];
        for (u, coef) in out.iter_mut().enumerate() {
            *coef = line.iter().zip(table[u].iter()).map(|(p, c)| p * c).sum();
        }
    }

    let mut low = Vec::with_capacity(PHASH_LOW * PHASH_LOW);
    for cos_v in table.iter() {
        for u in 0..PHASH_LOW {
            low.push(rows.iter().zip(cos_v.iter()).map(|(r, c)| r[u] * c).sum::<f64>());
        }
    }

    let median = median(&low);
    bits_from(low.iter().map(|&c| c > median))
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;

    pub(crate) fn gradient(width: u32, height: u32, reversed: bool) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, _| {
            let step = if reversed { width - 1 - x } else { x };
            let v = (step * 255 / (width - 1)) as u8;
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let img = gradient(64, 64, false);
        let a = HashTriple::of(&img).unwrap();
        let b = HashTriple::of(&img.clone()).unwrap();
        let d = a.distances(&b);
        assert_eq!(
            d,
            HashDistances {
                perceptual: 0,
                difference: 0,
                average: 0
            }
        );
        assert!(d.is_match(DEFAULT_MATCH_THRESHOLD));
    }

    #[test]
    fn mirrored_gradients_do_not_match() {
        let a = HashTriple::of(&gradient(64, 64, false)).unwrap();
        let b = HashTriple::of(&gradient(64, 64, true)).unwrap();
        let d = a.distances(&b);
        assert_eq!(d.difference, 64);
        assert_eq!(d.average, 64);
        assert!(d.mean() > DEFAULT_MATCH_THRESHOLD);
        assert!(!d.is_match(DEFAULT_MATCH_THRESHOLD));
    }

    #[test]
    fn match_rule_accepts_structure_or_average() {
        let structural = HashDistances {
            perceptual: 10,
            difference: 18,
            average: 60,
        };
        assert!(structural.is_match(18));

        let on_average = HashDistances {
            perceptual: 25,
            difference: 5,
            average: 20,
        };
        assert_eq!(on_average.mean(), 16);
        assert!(on_average.is_match(18));

        let neither = HashDistances {
            perceptual: 19,
            difference: 19,
            average: 19,
        };
        assert!(!neither.is_match(18));
    }

    #[test]
    fn empty_image_has_no_hash() {
        assert!(HashTriple::of(&DynamicImage::new_rgb8(0, 0)).is_none());
    }
}
