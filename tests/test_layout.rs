// tests/test_layout.rs: Round-trip laws of the layout converters.
//
// These run with `cargo test --test test_layout`.
// Property tests generate random batches (count, rows, cols, pixels) and
// check that every conversion keeps every pixel exactly once.

use batchconv::image::Image;
use batchconv::layout::{
    flatten, split_samples, to_flat_1d, to_nested_3d, unflatten, BatchShape, FlatBatch,
    LayoutError,
};
use proptest::prelude::*;

/// A batch of `count` random `rows × cols` u8 images.
fn batch_strategy() -> impl Strategy<Value = (usize, usize, Vec<Image<u8>>)> {
    (1usize..5, 1usize..9, 1usize..9).prop_flat_map(|(count, rows, cols)| {
        prop::collection::vec(prop::collection::vec(any::<u8>(), rows * cols), count).prop_map(
            move |samples| {
                let images = samples
                    .into_iter()
                    .map(|px| Image::from_vec(cols, rows, px))
                    .collect();
                (rows, cols, images)
            },
        )
    })
}

proptest! {
    #[test]
    fn flat_then_split_reproduces_images((rows, cols, images) in batch_strategy()) {
        let flat = to_flat_1d(&images, rows, cols).unwrap();
        prop_assert_eq!(flat.as_slice().len(), images.len() * rows * cols);
        let samples = split_samples(&flat);
        prop_assert_eq!(samples.len(), images.len());
        for (img, sample) in images.iter().zip(&samples) {
            prop_assert_eq!(&img.map_pixels::<i32>(), sample);
        }
    }

    #[test]
    fn flatten_of_nested_equals_flat((rows, cols, images) in batch_strategy()) {
        let nested = to_nested_3d(&images, rows, cols).unwrap();
        prop_assert_eq!(flatten(&nested), to_flat_1d(&images, rows, cols).unwrap());
    }

    #[test]
    fn unflatten_inverts_flatten((rows, cols, images) in batch_strategy(), pad in 0usize..5) {
        let nested = to_nested_3d(&images, rows, cols).unwrap();
        prop_assert_eq!(&unflatten(&flatten(&nested)), &nested);
        // Row padding is dropped, never leaked into the pixels.
        let padded = nested.restride(cols + pad);
        prop_assert_eq!(unflatten(&flatten(&padded)), nested);
    }

    #[test]
    fn flat_index_formula((rows, cols, images) in batch_strategy()) {
        let flat = to_flat_1d(&images, rows, cols).unwrap();
        let shape = flat.shape();
        for (n, img) in images.iter().enumerate() {
            for r in 0..rows {
                for c in 0..cols {
                    prop_assert_eq!(flat.as_slice()[shape.index(n, r, c)], img.get(c, r) as i32);
                }
            }
        }
    }
}

#[test]
fn empty_collection_is_a_layout_error() {
    let none: Vec<Image<u8>> = Vec::new();
    assert_eq!(to_flat_1d(&none, 2, 2).unwrap_err(), LayoutError::Empty);
    assert_eq!(to_nested_3d(&none, 2, 2).unwrap_err(), LayoutError::Empty);
}

#[test]
fn window_larger_than_sample_is_reported_not_read() {
    let images = vec![Image::<u8>::new(4, 4), Image::<u8>::new(4, 2)];
    let err = to_flat_1d(&images, 4, 4).unwrap_err();
    assert!(matches!(err, LayoutError::SampleTooSmall { index: 1, .. }), "{err}");
}

#[test]
fn flat_batch_shape_must_match_length() {
    let err = FlatBatch::from_vec(BatchShape::new(2, 3, 3), vec![0i32; 17]).unwrap_err();
    assert_eq!(err, LayoutError::LengthMismatch { expected: 18, actual: 17 });
}
