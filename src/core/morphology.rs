use crate::types::ClassResult;
use ndarray::Array2;
use std::cmp::Ordering;

/// Morphological clean-up parameters for hard-label output
#[derive(Debug, Clone)]
pub struct MorphologyParams {
    /// Dilation radius of the first (coarse) closing pass; the second
    /// pass always runs with radius 1
    pub radius: usize,
    /// Pixel connectivity of the reconstruction step (1 = cross,
    /// 2 = full 3x3 neighborhood)
    pub connectivity: usize,
    /// Class codes restored to their pre-morphology pixels afterward
    pub exempt_classes: Vec<u8>,
}

impl Default for MorphologyParams {
    fn default() -> Self {
        Self {
            radius: 3,
            connectivity: 2,
            exempt_classes: Vec::new(),
        }
    }
}

impl MorphologyParams {
    /// Padding the prediction pipeline must add around each tile so the
    /// structuring element has full context at the crop boundary
    pub fn required_pad(&self) -> usize {
        self.radius.max(1)
    }
}

/// Disk structuring-element offsets for a given radius
fn disk_offsets(radius: usize) -> Vec<(isize, isize)> {
    let r = radius as isize;
    let r2 = r * r;
    let mut offsets = Vec::new();
    for dr in -r..=r {
        for dc in -r..=r {
            if dr * dr + dc * dc <= r2 {
                offsets.push((dr, dc));
            }
        }
    }
    offsets
}

/// Connectivity neighborhood offsets (center excluded)
fn connectivity_offsets(connectivity: usize) -> Vec<(isize, isize)> {
    let mut offsets = Vec::new();
    for dr in -1isize..=1 {
        for dc in -1isize..=1 {
            if dr == 0 && dc == 0 {
                continue;
            }
            if connectivity < 2 && dr != 0 && dc != 0 {
                continue;
            }
            offsets.push((dr, dc));
        }
    }
    offsets
}

fn dilate(image: &Array2<u8>, offsets: &[(isize, isize)]) -> Array2<u8> {
    let (rows, cols) = image.dim();
    let mut out = image.clone();
    for r in 0..rows {
        for c in 0..cols {
            let mut max = image[[r, c]];
            for &(dr, dc) in offsets {
                let nr = r as isize + dr;
                let nc = c as isize + dc;
                if nr >= 0 && nc >= 0 && (nr as usize) < rows && (nc as usize) < cols {
                    max = max.max(image[[nr as usize, nc as usize]]);
                }
            }
            out[[r, c]] = max;
        }
    }
    out
}

/// One geodesic erosion step: erode the marker, then clamp it from below
/// by the mask. Returns true when the marker changed.
fn erode_geodesic(
    marker: &mut Array2<u8>,
    mask: &Array2<u8>,
    offsets: &[(isize, isize)],
) -> bool {
    let (rows, cols) = marker.dim();
    let previous = marker.clone();
    let mut changed = false;
    for r in 0..rows {
        for c in 0..cols {
            let mut min = previous[[r, c]];
            for &(dr, dc) in offsets {
                let nr = r as isize + dr;
                let nc = c as isize + dc;
                if nr >= 0 && nc >= 0 && (nr as usize) < rows && (nc as usize) < cols {
                    min = min.min(previous[[nr as usize, nc as usize]]);
                }
            }
            let value = min.max(mask[[r, c]]);
            if value != marker[[r, c]] {
                marker[[r, c]] = value;
                changed = true;
            }
        }
    }
    changed
}

/// Closing-by-reconstruction: dilate with a disk of the given radius,
/// then erode the result geodesically until it settles back onto the
/// original image. Removes speckle while keeping boundaries that a plain
/// closing would shift.
pub fn closing_by_reconstruction(
    image: &Array2<u8>,
    radius: usize,
    connectivity: usize,
) -> Array2<u8> {
    if radius == 0 {
        return image.clone();
    }
    let mut marker = dilate(image, &disk_offsets(radius));
    let offsets = connectivity_offsets(connectivity);
    // The marker can only descend toward the mask, so the loop terminates
    while erode_geodesic(&mut marker, image, &offsets) {}
    marker
}

/// Two-stage closing-by-reconstruction of a hard-label image with class
/// exemptions. Applies to label output only; probability planes are never
/// morphed.
pub fn clean_labels(image: &Array2<u8>, params: &MorphologyParams) -> ClassResult<Array2<u8>> {
    log::debug!(
        "Morphological clean-up: radius {} then 1, connectivity {}",
        params.radius,
        params.connectivity
    );
    let coarse = closing_by_reconstruction(image, params.radius, params.connectivity);
    let mut cleaned = closing_by_reconstruction(&coarse, 1, params.connectivity);

    // Exempt classes keep every pixel they held before morphology
    for &class in &params.exempt_classes {
        ndarray::Zip::from(&mut cleaned)
            .and(image)
            .for_each(|out, &before| {
                if before == class {
                    *out = class;
                }
            });
    }
    Ok(cleaned)
}

/// Windowed median filter over a label image, used as an optional final
/// speckle clean-up on finished maps. Only needs an ordering on the
/// label values, so it works on any numeric label representation.
pub fn median_filter<T: Copy + PartialOrd>(image: &Array2<T>, window_size: usize) -> Array2<T> {
    if window_size <= 1 {
        return image.clone();
    }
    let (rows, cols) = image.dim();
    let half = window_size / 2;
    let mut out = image.clone();
    let mut values = Vec::with_capacity(window_size * window_size);
    for r in 0..rows {
        for c in 0..cols {
            values.clear();
            for nr in r.saturating_sub(half)..(r + half + 1).min(rows) {
                for nc in c.saturating_sub(half)..(c + half + 1).min(cols) {
                    values.push(image[[nr, nc]]);
                }
            }
            values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            out[[r, c]] = values[values.len() / 2];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_closing_fills_isolated_hole() {
        let mut image = Array2::from_elem((7, 7), 5u8);
        image[[3, 3]] = 0;
        let closed = closing_by_reconstruction(&image, 2, 2);
        assert_eq!(closed[[3, 3]], 5);
        // The surrounding field is untouched
        assert!(closed.iter().all(|&v| v == 5));
    }

    #[test]
    fn test_closing_is_identity_on_constant_image() {
        let image = Array2::from_elem((5, 5), 3u8);
        assert_eq!(closing_by_reconstruction(&image, 3, 2), image);
    }

    #[test]
    fn test_zero_radius_is_identity() {
        let image = arr2(&[[1u8, 2], [3, 4]]);
        assert_eq!(closing_by_reconstruction(&image, 0, 2), image);
    }

    #[test]
    fn test_exempt_class_pixels_are_restored() {
        // Class 1 speckle inside a class-9 field would normally be closed over
        let mut image = Array2::from_elem((9, 9), 9u8);
        image[[4, 4]] = 1;
        image[[2, 6]] = 1;

        let morphed = clean_labels(&image, &MorphologyParams::default()).unwrap();
        assert_ne!(morphed[[4, 4]], 1, "unexempted speckle should be removed");

        let params = MorphologyParams {
            exempt_classes: vec![1],
            ..MorphologyParams::default()
        };
        let exempted = clean_labels(&image, &params).unwrap();
        for ((r, c), &before) in image.indexed_iter() {
            if before == 1 {
                assert_eq!(exempted[[r, c]], 1);
            }
        }
    }

    #[test]
    fn test_median_filter_removes_salt_noise() {
        let mut image = Array2::from_elem((5, 5), 2u8);
        image[[2, 2]] = 7;
        let filtered = median_filter(&image, 3);
        assert_eq!(filtered[[2, 2]], 2);
    }

    #[test]
    fn test_median_filter_keeps_wide_label_codes() {
        let mut image = Array2::from_elem((5, 5), 300.0f32);
        image[[2, 2]] = 7.0;
        let filtered = median_filter(&image, 3);
        assert!(filtered.iter().all(|&v| v == 300.0));
    }

    #[test]
    fn test_median_filter_window_one_is_identity() {
        let image = arr2(&[[1u8, 9], [4, 6]]);
        assert_eq!(median_filter(&image, 1), image);
    }
}
