//! Image-stitching collaborator.

use cncsort_types::Frame;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StitchFailure {
    #[error("need at least 2 images to stitch, got {0}")]
    NotEnoughImages(usize),

    #[error("frame {index} is {got}px high, expected {expected}px")]
    HeightMismatch { index: usize, expected: u32, got: u32 },

    #[error("frame {0} has a pixel buffer that does not match its size")]
    CorruptFrame(usize),

    #[error("stitching failed: {0}")]
    Failed(String),
}

/// Combines the frames of a bed map into one composite image.
pub trait Stitcher: Send {
    fn stitch(&mut self, frames: &[Frame]) -> Result<Frame, StitchFailure>;
}

/// Places frames side by side, left to right, in capture order.
///
/// All frames must share the same height and bytes-per-pixel.
#[derive(Debug, Default)]
pub struct MosaicStitcher;

impl Stitcher for MosaicStitcher {
    fn stitch(&mut self, frames: &[Frame]) -> Result<Frame, StitchFailure> {
        if frames.len() < 2 {
            return Err(StitchFailure::NotEnoughImages(frames.len()));
        }
        let height = frames[0].height;
        let mut channels = None;
        for (index, f) in frames.iter().enumerate() {
            if f.height != height {
                return Err(StitchFailure::HeightMismatch {
                    index,
                    expected: height,
                    got: f.height,
                });
            }
            let pixels = f.width as usize * f.height as usize;
            if pixels == 0 || f.data.len() % pixels != 0 {
                return Err(StitchFailure::CorruptFrame(index));
            }
            let c = f.data.len() / pixels;
            if *channels.get_or_insert(c) != c {
                return Err(StitchFailure::CorruptFrame(index));
            }
        }
        let channels = channels.unwrap_or(1);

        let width: u32 = frames.iter().map(|f| f.width).sum();
        let mut data = Vec::with_capacity(width as usize * height as usize * channels);
        for row in 0..height as usize {
            for f in frames {
                let stride = f.width as usize * channels;
                data.extend_from_slice(&f.data[row * stride..(row + 1) * stride]);
            }
        }
        Ok(Frame::new(width, height, data))
    }
}
