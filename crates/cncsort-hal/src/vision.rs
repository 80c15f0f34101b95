//! Pixel-detection collaborator.
//!
//! A [`VisionSource`] grabs frames and finds candidate objects in them.
//! Candidates come back in pixel space; mapping to machine coordinates
//! happens in the runtime.

use std::collections::VecDeque;

use cncsort_types::{BoundingBox, DetectedObject, Frame, PixelPoint, SorterError};

pub trait VisionSource: Send {
    fn capture_frame(&mut self) -> Result<Frame, SorterError>;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedObject>, SorterError>;
}

/// One scripted detection, in pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptedBlob {
    pub center: PixelPoint,
    /// Side of the square blob, in pixels.
    pub size: i32,
}

impl ScriptedBlob {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            center: PixelPoint::new(x, y),
            size: 30,
        }
    }
}

/// Deterministic vision source that replays a script of detections.
///
/// Each `detect` call consumes the next step; an exhausted script yields no
/// detections unless the source was built with [`ScriptedVision::cycling`].
pub struct ScriptedVision {
    width: u32,
    height: u32,
    script: VecDeque<Vec<ScriptedBlob>>,
    cycle: bool,
    captures: usize,
    fail_on_capture: Option<usize>,
    fail_next_detect: bool,
}

impl ScriptedVision {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            script: VecDeque::new(),
            cycle: false,
            captures: 0,
            fail_on_capture: None,
            fail_next_detect: false,
        }
    }

    /// Append one step to the script.
    pub fn then_detect(mut self, blobs: Vec<ScriptedBlob>) -> Self {
        self.script.push_back(blobs);
        self
    }

    /// Replay the script from the start once exhausted.
    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    /// Make the `n`-th capture (1-based) fail.
    pub fn fail_on_capture(mut self, n: usize) -> Self {
        self.fail_on_capture = Some(n);
        self
    }

    pub fn fail_next_detect(&mut self) {
        self.fail_next_detect = true;
    }

    pub fn captures(&self) -> usize {
        self.captures
    }
}

impl VisionSource for ScriptedVision {
    fn capture_frame(&mut self) -> Result<Frame, SorterError> {
        self.captures += 1;
        if self.fail_on_capture == Some(self.captures) {
            return Err(SorterError::collaborator("vision", "camera returned no frame"));
        }
        Ok(Frame::blank(self.width, self.height))
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedObject>, SorterError> {
        if std::mem::take(&mut self.fail_next_detect) {
            return Err(SorterError::collaborator("vision", "detector crashed"));
        }
        let Some(step) = self.script.pop_front() else {
            return Ok(Vec::new());
        };
        if self.cycle {
            self.script.push_back(step.clone());
        }
        Ok(step
            .iter()
            .enumerate()
            .map(|(label, blob)| {
                let half = blob.size / 2;
                let (cx, cy) = (blob.center.x as i32, blob.center.y as i32);
                let bbox = BoundingBox {
                    x: cx - half,
                    y: cy - half,
                    width: blob.size,
                    height: blob.size,
                };
                let contour = vec![
                    (bbox.x, bbox.y),
                    (bbox.x + bbox.width, bbox.y),
                    (bbox.x + bbox.width, bbox.y + bbox.height),
                    (bbox.x, bbox.y + bbox.height),
                ];
                let area = f64::from(blob.size) * f64::from(blob.size);
                let mut obj = DetectedObject::candidate(label as u32, contour, bbox, area, blob.center);
                obj.confidence = 1.0;
                obj
            })
            .collect())
    }
}
