// tests/test_image.rs: Integration tests for Image<T> and pixel conversion.
//
// These run with `cargo test --test test_image`.
// Only the public surface is used here, as a check that it is enough to
// feed the layout converters.

use batchconv::image::{Image, Pixel};

// ===== Construction & access =====

#[test]
fn image_new_zero_initialized() {
    let img: Image<u8> = Image::new(100, 50);
    assert_eq!(img.width(), 100);
    assert_eq!(img.height(), 50);
    assert_eq!(img.get(0, 0), 0);
    assert_eq!(img.get(99, 49), 0);
}

#[test]
fn image_from_vec_layout() {
    //  [10, 20, 30]
    //  [40, 50, 60]
    let img = Image::from_vec(3, 2, vec![10u8, 20, 30, 40, 50, 60]);
    assert_eq!(img.get(2, 0), 30);
    assert_eq!(img.get(0, 1), 40);
    assert_eq!(img[(2, 1)], 60);
    assert_eq!(img.row(1), &[40, 50, 60]);
}

#[test]
fn index_mut_writes_through() {
    let mut img: Image<i32> = Image::new(2, 2);
    img[(1, 0)] = -7;
    assert_eq!(img.get(1, 0), -7);
    assert_eq!(img.as_slice(), &[0, -7, 0, 0]);
}

// ===== Stride =====

#[test]
fn stride_padding_is_invisible() {
    let mut img: Image<u8> = Image::new_with_stride(2, 2, 4);
    img.set(0, 0, 1);
    img.set(1, 0, 2);
    img.set(0, 1, 3);
    img.set(1, 1, 4);

    assert_eq!(img.stride(), 4);
    assert_eq!(img.as_slice().len(), 8);
    assert_eq!(img.row(1), &[3, 4]);

    let pixels: Vec<_> = img.pixels().collect();
    assert_eq!(pixels, vec![(0, 0, 1), (1, 0, 2), (0, 1, 3), (1, 1, 4)]);
}

#[test]
fn from_vec_with_stride_reads_active_pixels() {
    let img = Image::from_vec_with_stride(2, 2, 3, vec![1i32, 2, 99, 3, 4, 99]);
    assert_eq!(img.row(0), &[1, 2]);
    assert_eq!(img.row(1), &[3, 4]);
}

#[test]
#[should_panic(expected = "stride")]
fn stride_narrower_than_width_panics() {
    let _ = Image::from_vec_with_stride(4, 1, 3, vec![0u8; 3]);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn get_out_of_bounds_panics() {
    let img: Image<u8> = Image::new(3, 3);
    img.get(3, 0);
}

// ===== Windows =====

#[test]
fn covers_checks_both_axes() {
    let img: Image<u8> = Image::new(5, 3);
    assert!(img.covers(3, 5));
    assert!(img.covers(1, 1));
    assert!(!img.covers(4, 5));
    assert!(!img.covers(3, 6));
}

// ===== Pixel conversion =====

#[test]
fn widening_then_narrowing_is_lossless_for_u8() {
    let img = Image::from_vec(4, 1, vec![0u8, 1, 128, 255]);
    let wide: Image<i32> = img.map_pixels();
    assert_eq!(wide.row(0), &[0, 1, 128, 255]);
    assert_eq!(wide.map_pixels::<u8>(), img);
}

#[test]
fn narrowing_saturates() {
    let img = Image::from_vec(4, 1, vec![-5i32, 0, 300, 765]);
    assert_eq!(img.map_pixels::<u8>().row(0), &[0, 0, 255, 255]);
    assert_eq!(u8::from_i32(i32::MIN), 0);
    assert_eq!(u8::from_i32(i32::MAX), 255);
}

#[test]
fn map_pixels_drops_stride() {
    let img = Image::from_vec_with_stride(2, 1, 4, vec![7u8, 8, 0, 0]);
    let wide: Image<i32> = img.map_pixels();
    assert_eq!(wide.stride(), 2);
    assert_eq!(wide.as_slice(), &[7, 8]);
}
