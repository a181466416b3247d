// batchconv: batch 3×3 convolution of grayscale images on a GPU
//
// Pipeline of one call:
//
//   images ─▶ layout (Volume / FlatBatch) ─▶ device buffers ─▶ conv2d
//          ◀─ layout ◀──────────────────── download ◀─────────┘
//
// The host implementation in `convolution` is the reference every device
// result is checked against.

pub mod accel;
pub mod buffer;
pub mod convolution;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod host;
pub mod image;
pub mod layout;
pub mod lifecycle;
pub mod loader;

pub use accel::{Accelerator, Extent};
pub use convolution::{ConvDims, Filter3x3};
pub use engine::{ConvRun, ConvolutionEngine};
pub use error::{ConvError, Status};
pub use host::{HostAccelerator, HostConfig};
pub use layout::{BatchShape, FlatBatch, Volume};
