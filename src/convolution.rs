// convolution.rs: The 3×3 filter, output-shape validation, and the trusted
// host implementation of the batch convolution.
//
// DEFINITION
// ──────────
// Cross-correlation with zero padding (no kernel flip):
//
//   out[n][r][c] = Σ_{i,j ∈ 0..3} w[i][j] · in[n][r + i − pr][c + j − pc]
//
// with `in` read as 0 outside the sample. The padding (pr, pc) is not a
// free parameter: it is implied by the caller-declared output shape, and
// only three shapes per axis are reachable with a 3-tap filter:
//
//   rows_out = rows − 2   pr = 0   ("valid")
//   rows_out = rows       pr = 1   ("same")
//   rows_out = rows + 2   pr = 2   ("full")
//
// Any other declared shape would make the device kernel index outside its
// buffers, so `ConvDims::new` rejects it before device work begins.
//
// The WGSL kernel in shaders/conv2d.wgsl computes exactly the same sum with
// the same wrapping i32 arithmetic; `convolve_pitched` is what every GPU
// result is checked against.

use crate::error::ConvError;
use crate::image::Image;
use crate::layout::{BatchShape, FlatBatch};

/// Filter side length.
pub const FILTER_SIZE: usize = 3;

/// A 3×3 integer filter, weights in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Filter3x3 {
    weights: [i32; 9],
}

impl Filter3x3 {
    /// Sum of the pixel and its vertical neighbours.
    pub const VERTICAL_SUM: Filter3x3 = Filter3x3::new([0, 1, 0, 0, 1, 0, 0, 1, 0]);

    /// Passes the centre pixel through.
    pub const IDENTITY: Filter3x3 = Filter3x3::new([0, 0, 0, 0, 1, 0, 0, 0, 0]);

    pub const fn new(weights: [i32; 9]) -> Self {
        Filter3x3 { weights }
    }

    #[inline]
    pub fn weights(&self) -> &[i32; 9] {
        &self.weights
    }

    /// Weight at filter row `i`, column `j`.
    #[inline]
    pub fn at(&self, i: usize, j: usize) -> i32 {
        self.weights[i * FILTER_SIZE + j]
    }
}

impl Default for Filter3x3 {
    fn default() -> Self {
        Filter3x3::VERTICAL_SUM
    }
}

// ---------------------------------------------------------------------------
// ConvDims
// ---------------------------------------------------------------------------

/// Validated input/output dimensions of one convolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDims {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
    pub rows_out: usize,
    pub cols_out: usize,
    /// Implicit zero rows above the input.
    pub pad_rows: usize,
    /// Implicit zero columns left of the input.
    pub pad_cols: usize,
}

/// Padding that maps `len` onto `len_out`, if any.
fn padding_for(len: usize, len_out: usize) -> Option<usize> {
    if len_out == 0 {
        return None;
    }
    // len_out = len + 2·pad − (K − 1)
    let twice = len_out.checked_add(FILTER_SIZE - 1)?.checked_sub(len)?;
    if twice % 2 != 0 || twice / 2 > FILTER_SIZE - 1 {
        return None;
    }
    Some(twice / 2)
}

impl ConvDims {
    /// Validate a caller-declared output shape against the input batch.
    ///
    /// Fails with `InvalidBatch` if the input is empty and with
    /// `OutputShape` if `rows_out`/`cols_out` is not one of the three shapes
    /// a 3×3 filter can produce.
    pub fn new(input: BatchShape, rows_out: usize, cols_out: usize) -> Result<Self, ConvError> {
        if input.is_empty() {
            return Err(ConvError::InvalidBatch(format!(
                "batch {}×{}×{} has no pixels",
                input.count, input.rows, input.cols
            )));
        }
        let shape_err = || ConvError::OutputShape {
            rows: input.rows,
            cols: input.cols,
            rows_out,
            cols_out,
        };
        let pad_rows = padding_for(input.rows, rows_out).ok_or_else(shape_err)?;
        let pad_cols = padding_for(input.cols, cols_out).ok_or_else(shape_err)?;
        Ok(ConvDims {
            count: input.count,
            rows: input.rows,
            cols: input.cols,
            rows_out,
            cols_out,
            pad_rows,
            pad_cols,
        })
    }

    /// Output the same size as the input.
    pub fn same(input: BatchShape) -> Result<Self, ConvError> {
        Self::new(input, input.rows, input.cols)
    }

    /// Output only where the filter fits entirely inside the input.
    pub fn valid(input: BatchShape) -> Result<Self, ConvError> {
        Self::new(
            input,
            input.rows.saturating_sub(FILTER_SIZE - 1),
            input.cols.saturating_sub(FILTER_SIZE - 1),
        )
    }

    #[inline]
    pub fn input_shape(&self) -> BatchShape {
        BatchShape::new(self.count, self.rows, self.cols)
    }

    #[inline]
    pub fn output_shape(&self) -> BatchShape {
        BatchShape::new(self.count, self.rows_out, self.cols_out)
    }
}

// ---------------------------------------------------------------------------
// Host implementation
// ---------------------------------------------------------------------------

/// Convolve a pitched batch on the host.
///
/// `src_pitch` and `dst_pitch` are row strides in *elements*. Sample `n`
/// starts at `n * rows * src_pitch` in `src` and `n * rows_out * dst_pitch`
/// in `dst`. Padding elements of `dst` are left untouched.
///
/// Accumulation wraps on i32 overflow, as on the device.
///
/// # Panics
/// Panics if either slice is too short for its pitch and dimensions.
pub fn convolve_pitched(
    src: &[i32],
    src_pitch: usize,
    dst: &mut [i32],
    dst_pitch: usize,
    dims: &ConvDims,
    filter: &Filter3x3,
) {
    assert!(src_pitch >= dims.cols && dst_pitch >= dims.cols_out, "pitch narrower than a row");
    assert!(
        src.len() >= dims.count * dims.rows * src_pitch,
        "source holds {} elements, needs {}",
        src.len(),
        dims.count * dims.rows * src_pitch
    );
    assert!(
        dst.len() >= dims.count * dims.rows_out * dst_pitch,
        "destination holds {} elements, needs {}",
        dst.len(),
        dims.count * dims.rows_out * dst_pitch
    );

    let rows = dims.rows as isize;
    let cols = dims.cols as isize;

    for n in 0..dims.count {
        let src_sample = &src[n * dims.rows * src_pitch..];
        let dst_sample = &mut dst[n * dims.rows_out * dst_pitch..];
        for r in 0..dims.rows_out {
            for c in 0..dims.cols_out {
                let mut acc = 0i32;
                for i in 0..FILTER_SIZE {
                    let sr = (r + i) as isize - dims.pad_rows as isize;
                    if sr < 0 || sr >= rows {
                        continue;
                    }
                    let src_row = sr as usize * src_pitch;
                    for j in 0..FILTER_SIZE {
                        let sc = (c + j) as isize - dims.pad_cols as isize;
                        if sc < 0 || sc >= cols {
                            continue;
                        }
                        let px = src_sample[src_row + sc as usize];
                        acc = acc.wrapping_add(filter.at(i, j).wrapping_mul(px));
                    }
                }
                dst_sample[r * dst_pitch + c] = acc;
            }
        }
    }
}

/// Convolve a compact flat batch on the host.
pub fn convolve_flat(
    input: &FlatBatch<i32>,
    filter: &Filter3x3,
    rows_out: usize,
    cols_out: usize,
) -> Result<FlatBatch<i32>, ConvError> {
    let dims = ConvDims::new(input.shape(), rows_out, cols_out)?;
    let mut out = vec![0i32; dims.output_shape().len()];
    convolve_pitched(input.as_slice(), dims.cols, &mut out, dims.cols_out, &dims, filter);
    FlatBatch::from_vec(dims.output_shape(), out)
        .map_err(|e| ConvError::InvalidBatch(e.to_string()))
}

/// Convolve a single image on the host. Honours the image's stride.
pub fn convolve_image(
    img: &Image<i32>,
    filter: &Filter3x3,
    rows_out: usize,
    cols_out: usize,
) -> Result<Image<i32>, ConvError> {
    let dims = ConvDims::new(BatchShape::new(1, img.height(), img.width()), rows_out, cols_out)?;
    let mut out = Image::new(cols_out, rows_out);
    let mut buf = vec![0i32; rows_out * cols_out];
    convolve_pitched(img.as_slice(), img.stride(), &mut buf, cols_out, &dims, filter);
    for r in 0..rows_out {
        out.row_mut(r).copy_from_slice(&buf[r * cols_out..(r + 1) * cols_out]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_4x4() -> Image<i32> {
        Image::from_vec(4, 4, (0..16).collect())
    }

    #[test]
    fn test_padding_rules() {
        assert_eq!(padding_for(4, 2), Some(0));
        assert_eq!(padding_for(4, 4), Some(1));
        assert_eq!(padding_for(4, 6), Some(2));
        assert_eq!(padding_for(4, 3), None);
        assert_eq!(padding_for(4, 5), None);
        assert_eq!(padding_for(4, 8), None);
        assert_eq!(padding_for(4, 1), None);
        assert_eq!(padding_for(4, 0), None);
        assert_eq!(padding_for(1, 1), Some(1));
        assert_eq!(padding_for(4, usize::MAX), None);
    }

    #[test]
    fn test_dims_reject_huge_output() {
        let shape = BatchShape::new(1, 4, 4);
        let err = ConvDims::new(shape, usize::MAX, 4).unwrap_err();
        assert_eq!(
            err,
            ConvError::OutputShape { rows: 4, cols: 4, rows_out: usize::MAX, cols_out: 4 }
        );
        assert!(ConvDims::new(shape, 4, usize::MAX - 1).is_err());
    }

    #[test]
    fn test_dims_reject_mismatched_output() {
        let shape = BatchShape::new(2, 4, 4);
        let err = ConvDims::new(shape, 3, 4).unwrap_err();
        assert_eq!(err, ConvError::OutputShape { rows: 4, cols: 4, rows_out: 3, cols_out: 4 });
        assert!(ConvDims::new(shape, 4, 7).is_err());
        assert!(ConvDims::new(shape, 2, 6).is_ok());
    }

    #[test]
    fn test_dims_reject_empty_batch() {
        let err = ConvDims::same(BatchShape::new(0, 4, 4)).unwrap_err();
        assert!(matches!(err, ConvError::InvalidBatch(_)));
    }

    #[test]
    fn test_valid_of_tiny_input_fails() {
        assert!(ConvDims::valid(BatchShape::new(1, 2, 5)).is_err());
    }

    #[test]
    fn test_vertical_sum_same() {
        let out = convolve_image(&ramp_4x4(), &Filter3x3::VERTICAL_SUM, 4, 4).unwrap();
        assert_eq!(out.row(0), &[4, 6, 8, 10]);
        assert_eq!(out.row(1), &[12, 15, 18, 21]);
        assert_eq!(out.row(2), &[24, 27, 30, 33]);
        assert_eq!(out.row(3), &[20, 22, 24, 26]);
    }

    #[test]
    fn test_vertical_sum_valid() {
        let out = convolve_image(&ramp_4x4(), &Filter3x3::VERTICAL_SUM, 2, 2).unwrap();
        assert_eq!(out.row(0), &[15, 18]);
        assert_eq!(out.row(1), &[27, 30]);
    }

    #[test]
    fn test_vertical_sum_full() {
        let out = convolve_image(&ramp_4x4(), &Filter3x3::VERTICAL_SUM, 6, 6).unwrap();
        // Column 0 of the output only sees the zero border.
        for r in 0..6 {
            assert_eq!(out.get(0, r), 0);
        }
        assert_eq!(out.get(1, 2), 0 + 4 + 8);
        assert_eq!(out.get(4, 5), 15);
    }

    #[test]
    fn test_identity_filter() {
        let img = ramp_4x4();
        let out = convolve_image(&img, &Filter3x3::IDENTITY, 4, 4).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_pitched_matches_compact() {
        // Same 2-sample batch, once compact, once with 3 padding elements
        // per row on both sides.
        let dims = ConvDims::same(BatchShape::new(2, 3, 3)).unwrap();
        let compact: Vec<i32> = (1..=18).collect();
        let mut padded = vec![-1i32; 2 * 3 * 6];
        for row in 0..6 {
            padded[row * 6..row * 6 + 3].copy_from_slice(&compact[row * 3..row * 3 + 3]);
        }
        let filter = Filter3x3::new([1, 2, 1, 0, 0, 0, -1, -2, -1]);

        let mut out_compact = vec![0i32; 18];
        convolve_pitched(&compact, 3, &mut out_compact, 3, &dims, &filter);

        let mut out_padded = vec![7i32; 2 * 3 * 6];
        convolve_pitched(&padded, 6, &mut out_padded, 6, &dims, &filter);

        for row in 0..6 {
            assert_eq!(&out_padded[row * 6..row * 6 + 3], &out_compact[row * 3..row * 3 + 3]);
            // Destination padding is never written.
            assert_eq!(&out_padded[row * 6 + 3..row * 6 + 6], &[7, 7, 7]);
        }
    }

    #[test]
    fn test_samples_are_independent() {
        let input = FlatBatch::from_vec(
            BatchShape::new(2, 2, 2),
            vec![1, 1, 1, 1, 100, 100, 100, 100],
        )
        .unwrap();
        let out = convolve_flat(&input, &Filter3x3::VERTICAL_SUM, 2, 2).unwrap();
        assert_eq!(out.sample(0), &[2, 2, 2, 2]);
        assert_eq!(out.sample(1), &[200, 200, 200, 200]);
    }

    #[test]
    fn test_overflow_wraps() {
        let img = Image::from_vec(1, 3, vec![i32::MAX, i32::MAX, 0]);
        let out = convolve_image(&img, &Filter3x3::VERTICAL_SUM, 3, 1).unwrap();
        assert_eq!(out.get(0, 0), i32::MAX.wrapping_add(i32::MAX));
    }
}
