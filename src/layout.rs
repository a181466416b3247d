// layout.rs: Host-side batch layouts and the conversions between them.
//
// Three shapes of the same pixels:
//
//   &[Image<P>]     one image per sample, each with its own stride
//   Volume<T>       [sample][row][col] in ONE owned block, explicit strides
//   FlatBatch<T>    compact 1D block, index = n*rows*cols + r*cols + c
//
// `Volume` replaces a pointer-to-pointer-to-pointer array: there is a single
// allocation, and (n, r, c) is turned into an offset with
//
//   offset = n * sample_stride + r * row_stride + c
//   sample_stride = rows * row_stride
//
// `row_stride >= cols` lets a volume mirror a pitched device layout on the
// host. `flatten` drops that padding; `unflatten` always builds a compact
// volume (row_stride == cols).
//
// UNIFORMITY
// ──────────
// The converters do not check that every image has the same size. They read
// the top-left `rows × cols` window of each sample, so a larger image is
// silently cropped. A sample SMALLER than the window cannot be read safely
// and is reported as `LayoutError::SampleTooSmall`.

use thiserror::Error;

use crate::image::{Image, Pixel};

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// Dimensions of a batch: `count` samples of `rows × cols` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchShape {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
}

impl BatchShape {
    pub const fn new(count: usize, rows: usize, cols: usize) -> Self {
        BatchShape { count, rows, cols }
    }

    /// Pixels per sample.
    #[inline]
    pub const fn sample_len(&self) -> usize {
        self.rows * self.cols
    }

    /// Pixels in the whole batch.
    #[inline]
    pub const fn len(&self) -> usize {
        self.count * self.rows * self.cols
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of (n, r, c) in the compact 1D layout.
    #[inline]
    pub const fn index(&self, n: usize, r: usize, c: usize) -> usize {
        n * self.sample_len() + r * self.cols + c
    }

    #[inline]
    fn bounds_check(&self, n: usize, r: usize, c: usize) {
        assert!(
            n < self.count && r < self.rows && c < self.cols,
            "element ({n},{r},{c}) out of bounds for batch {}×{}×{}",
            self.count,
            self.rows,
            self.cols,
        );
    }
}

/// Errors from the layout converters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("image collection is empty")]
    Empty,

    #[error(
        "sample {index} is {width}×{height}, smaller than the {cols}×{rows} batch window"
    )]
    SampleTooSmall {
        index: usize,
        width: usize,
        height: usize,
        rows: usize,
        cols: usize,
    },

    #[error("buffer holds {actual} elements but the shape needs {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

// ---------------------------------------------------------------------------
// FlatBatch<T>
// ---------------------------------------------------------------------------

/// A batch flattened into one compact block.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatBatch<T: Pixel> {
    data: Vec<T>,
    shape: BatchShape,
}

impl<T: Pixel> FlatBatch<T> {
    /// A zero-filled batch of the given shape.
    pub fn zeros(shape: BatchShape) -> Self {
        FlatBatch { data: vec![T::default(); shape.len()], shape }
    }

    /// Wrap an existing buffer. Its length must equal `shape.len()`.
    pub fn from_vec(shape: BatchShape, data: Vec<T>) -> Result<Self, LayoutError> {
        if data.len() != shape.len() {
            return Err(LayoutError::LengthMismatch {
                expected: shape.len(),
                actual: data.len(),
            });
        }
        Ok(FlatBatch { data, shape })
    }

    #[inline]
    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    #[inline]
    pub fn get(&self, n: usize, r: usize, c: usize) -> T {
        self.shape.bounds_check(n, r, c);
        self.data[self.shape.index(n, r, c)]
    }

    /// The pixels of sample `n`, row-major.
    pub fn sample(&self, n: usize) -> &[T] {
        assert!(n < self.shape.count, "sample {n} out of bounds (count {})", self.shape.count);
        let len = self.shape.sample_len();
        &self.data[n * len..(n + 1) * len]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

// ---------------------------------------------------------------------------
// Volume<T>
// ---------------------------------------------------------------------------

/// A batch addressed as `[sample][row][col]`, stored in a single block.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T: Pixel> {
    data: Vec<T>,
    shape: BatchShape,
    /// Elements between the starts of consecutive rows. >= cols.
    row_stride: usize,
}

impl<T: Pixel> Volume<T> {
    /// Zero-initialized compact volume (row_stride == cols).
    pub fn new(shape: BatchShape) -> Self {
        Self::new_with_stride(shape, shape.cols)
    }

    /// Zero-initialized volume with padded rows.
    ///
    /// # Panics
    /// Panics if `row_stride < shape.cols`.
    pub fn new_with_stride(shape: BatchShape, row_stride: usize) -> Self {
        assert!(
            row_stride >= shape.cols,
            "row stride ({row_stride}) must be >= cols ({})",
            shape.cols
        );
        Volume {
            data: vec![T::default(); shape.count * shape.rows * row_stride],
            shape,
            row_stride,
        }
    }

    #[inline]
    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    #[inline]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    #[inline]
    pub fn sample_stride(&self) -> usize {
        self.shape.rows * self.row_stride
    }

    /// True when there is no row padding, so the storage is already the
    /// compact 1D layout.
    #[inline]
    pub fn is_compact(&self) -> bool {
        self.row_stride == self.shape.cols
    }

    #[inline]
    fn offset(&self, n: usize, r: usize, c: usize) -> usize {
        n * self.sample_stride() + r * self.row_stride + c
    }

    #[inline]
    pub fn get(&self, n: usize, r: usize, c: usize) -> T {
        self.shape.bounds_check(n, r, c);
        self.data[self.offset(n, r, c)]
    }

    #[inline]
    pub fn set(&mut self, n: usize, r: usize, c: usize, value: T) {
        self.shape.bounds_check(n, r, c);
        let idx = self.offset(n, r, c);
        self.data[idx] = value;
    }

    /// Active elements of row `r` in sample `n` (padding excluded).
    pub fn row(&self, n: usize, r: usize) -> &[T] {
        self.shape.bounds_check(n, r, 0);
        let start = self.offset(n, r, 0);
        &self.data[start..start + self.shape.cols]
    }

    pub fn row_mut(&mut self, n: usize, r: usize) -> &mut [T] {
        self.shape.bounds_check(n, r, 0);
        let start = self.offset(n, r, 0);
        let cols = self.shape.cols;
        &mut self.data[start..start + cols]
    }

    /// Storage including row padding.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Copy into a new volume with a different row stride.
    pub fn restride(&self, row_stride: usize) -> Volume<T> {
        let mut out = Volume::new_with_stride(self.shape, row_stride);
        for n in 0..self.shape.count {
            for r in 0..self.shape.rows {
                out.row_mut(n, r).copy_from_slice(self.row(n, r));
            }
        }
        out
    }

    /// Copy sample `n` out as a standalone image.
    pub fn sample_image(&self, n: usize) -> Image<T> {
        let mut img = Image::new(self.shape.cols, self.shape.rows);
        for r in 0..self.shape.rows {
            img.row_mut(r).copy_from_slice(self.row(n, r));
        }
        img
    }
}

// ---------------------------------------------------------------------------
// Converters
// ---------------------------------------------------------------------------

fn check_window<P: Pixel>(images: &[Image<P>], rows: usize, cols: usize) -> Result<(), LayoutError> {
    if images.is_empty() {
        return Err(LayoutError::Empty);
    }
    match images.iter().position(|img| !img.covers(rows, cols)) {
        Some(index) => Err(LayoutError::SampleTooSmall {
            index,
            width: images[index].width(),
            height: images[index].height(),
            rows,
            cols,
        }),
        None => Ok(()),
    }
}

/// Flatten `images` into a compact 1D batch of `rows × cols` samples.
///
/// Element `n*rows*cols + r*cols + c` is pixel (r, c) of image n.
pub fn to_flat_1d<P: Pixel>(
    images: &[Image<P>],
    rows: usize,
    cols: usize,
) -> Result<FlatBatch<i32>, LayoutError> {
    check_window(images, rows, cols)?;
    let shape = BatchShape::new(images.len(), rows, cols);
    let mut data = Vec::with_capacity(shape.len());
    for img in images {
        for r in 0..rows {
            data.extend(img.row(r)[..cols].iter().map(|&p| p.to_i32()));
        }
    }
    Ok(FlatBatch { data, shape })
}

/// Gather `images` into a compact 3D volume.
pub fn to_nested_3d<P: Pixel>(
    images: &[Image<P>],
    rows: usize,
    cols: usize,
) -> Result<Volume<i32>, LayoutError> {
    check_window(images, rows, cols)?;
    let mut vol = Volume::new(BatchShape::new(images.len(), rows, cols));
    for (n, img) in images.iter().enumerate() {
        for r in 0..rows {
            for (dst, &src) in vol.row_mut(n, r).iter_mut().zip(&img.row(r)[..cols]) {
                *dst = src.to_i32();
            }
        }
    }
    Ok(vol)
}

/// 3D → 1D. Row padding is dropped.
pub fn flatten<T: Pixel>(vol: &Volume<T>) -> FlatBatch<T> {
    let shape = vol.shape();
    if vol.is_compact() {
        return FlatBatch { data: vol.as_slice().to_vec(), shape };
    }
    let mut data = Vec::with_capacity(shape.len());
    for n in 0..shape.count {
        for r in 0..shape.rows {
            data.extend_from_slice(vol.row(n, r));
        }
    }
    FlatBatch { data, shape }
}

/// 1D → 3D. The result is compact.
pub fn unflatten<T: Pixel>(flat: &FlatBatch<T>) -> Volume<T> {
    Volume {
        data: flat.as_slice().to_vec(),
        shape: flat.shape(),
        row_stride: flat.shape().cols,
    }
}

/// Split a flat batch back into one image per sample.
pub fn split_samples<T: Pixel>(flat: &FlatBatch<T>) -> Vec<Image<T>> {
    let shape = flat.shape();
    (0..shape.count)
        .map(|n| Image::from_vec(shape.cols, shape.rows, flat.sample(n).to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: usize, height: usize, base: u8) -> Image<u8> {
        let data = (0..width * height).map(|i| base.wrapping_add(i as u8)).collect();
        Image::from_vec(width, height, data)
    }

    #[test]
    fn test_flat_index_formula() {
        let images = vec![ramp(3, 2, 0), ramp(3, 2, 100)];
        let flat = to_flat_1d(&images, 2, 3).unwrap();
        assert_eq!(flat.shape(), BatchShape::new(2, 2, 3));
        assert_eq!(flat.as_slice().len(), 12);
        for n in 0..2 {
            for r in 0..2 {
                for c in 0..3 {
                    assert_eq!(
                        flat.as_slice()[n * 6 + r * 3 + c],
                        images[n].get(c, r) as i32,
                        "mismatch at ({n},{r},{c})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_empty_collection_fails() {
        let images: Vec<Image<u8>> = Vec::new();
        assert_eq!(to_flat_1d(&images, 4, 4), Err(LayoutError::Empty));
        assert_eq!(to_nested_3d(&images, 4, 4), Err(LayoutError::Empty));
    }

    #[test]
    fn test_larger_sample_is_cropped() {
        let images = vec![ramp(2, 2, 0), ramp(4, 3, 50)];
        let flat = to_flat_1d(&images, 2, 2).unwrap();
        assert_eq!(flat.sample(1), &[50, 51, 54, 55]);
    }

    #[test]
    fn test_smaller_sample_is_reported() {
        let images = vec![ramp(4, 4, 0), ramp(3, 4, 0)];
        let err = to_nested_3d(&images, 4, 4).unwrap_err();
        assert_eq!(
            err,
            LayoutError::SampleTooSmall { index: 1, width: 3, height: 4, rows: 4, cols: 4 }
        );
    }

    #[test]
    fn test_source_stride_is_ignored() {
        let strided = Image::<u8>::from_vec_with_stride(
            2, 2, 4,
            vec![1, 2, 99, 99,
                 3, 4, 99, 99],
        );
        let flat = to_flat_1d(&[strided], 2, 2).unwrap();
        assert_eq!(flat.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_flatten_drops_row_padding() {
        let images = vec![ramp(3, 3, 7), ramp(3, 3, 70)];
        let vol = to_nested_3d(&images, 3, 3).unwrap();
        let padded = vol.restride(8);
        assert_eq!(padded.row_stride(), 8);
        assert_eq!(padded.as_slice().len(), 2 * 3 * 8);
        assert_eq!(flatten(&padded), flatten(&vol));
        assert_eq!(flatten(&vol), to_flat_1d(&images, 3, 3).unwrap());
    }

    #[test]
    fn test_unflatten_is_compact() {
        let flat = FlatBatch::from_vec(BatchShape::new(2, 2, 2), (0..8).collect()).unwrap();
        let vol = unflatten(&flat);
        assert!(vol.is_compact());
        assert_eq!(vol.get(1, 0, 1), 5);
        assert_eq!(vol.row(1, 1), &[6, 7]);
    }

    #[test]
    fn test_from_vec_length_mismatch() {
        let err = FlatBatch::<i32>::from_vec(BatchShape::new(1, 2, 2), vec![0; 3]).unwrap_err();
        assert_eq!(err, LayoutError::LengthMismatch { expected: 4, actual: 3 });
    }

    #[test]
    fn test_split_samples() {
        let flat = FlatBatch::from_vec(BatchShape::new(2, 1, 3), vec![1, 2, 3, 4, 5, 6]).unwrap();
        let samples = split_samples(&flat);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].row(0), &[4, 5, 6]);
    }

    #[test]
    fn test_sample_image_matches_rows() {
        let vol = to_nested_3d(&[ramp(2, 2, 10), ramp(2, 2, 20)], 2, 2).unwrap();
        let img = vol.restride(5).sample_image(1);
        assert_eq!(img.row(0), &[20, 21]);
        assert_eq!(img.row(1), &[22, 23]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_volume_get_out_of_bounds() {
        let vol: Volume<i32> = Volume::new(BatchShape::new(1, 2, 2));
        vol.get(0, 2, 0);
    }
}
