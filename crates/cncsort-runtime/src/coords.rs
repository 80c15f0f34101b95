//! Pixel to machine coordinate mapping for a downward-looking camera.
//!
//! The camera sits at a fixed offset from the tool head and sees a known
//! rectangle of the bed.  A pixel's distance from the image centre, scaled
//! by the field of view, is added to the camera's position on the bed.
//! Image Y grows downward while machine Y grows away from the operator, so
//! the Y offset is inverted.  Objects lie on the bed, so mapped Z is 0.

use cncsort_types::{DetectedObject, MachinePosition, PixelPoint};
use serde::{Deserialize, Serialize};

/// Camera placement relative to the tool head, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraMount {
    pub camera_id: u32,
    pub offset_x: f64,
    pub offset_y: f64,
    /// Width of the bed area in view at Z = 0.
    pub visible_width: f64,
    pub visible_height: f64,
}

impl Default for CameraMount {
    fn default() -> Self {
        Self {
            camera_id: 0,
            offset_x: 0.0,
            offset_y: 0.0,
            visible_width: 400.0,
            visible_height: 300.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelMapper {
    mount: CameraMount,
}

impl PixelMapper {
    pub fn new(mount: CameraMount) -> Self {
        Self { mount }
    }

    pub fn mount(&self) -> &CameraMount {
        &self.mount
    }

    /// Machine coordinate of pixel `center` in a `width`×`height` frame
    /// captured with the tool head at `head`.  `None` for a zero-sized frame
    /// or a degenerate field of view.
    pub fn to_machine(
        &self,
        center: PixelPoint,
        width: u32,
        height: u32,
        head: &MachinePosition,
    ) -> Option<MachinePosition> {
        let m = &self.mount;
        if width == 0 || height == 0 || !(m.visible_width > 0.0 && m.visible_height > 0.0) {
            return None;
        }
        let px_per_mm_x = f64::from(width) / m.visible_width;
        let px_per_mm_y = f64::from(height) / m.visible_height;

        let dx_mm = (center.x - f64::from(width) / 2.0) / px_per_mm_x;
        let dy_mm = -(center.y - f64::from(height) / 2.0) / px_per_mm_y;

        Some(MachinePosition::new(
            head.x + m.offset_x + dx_mm,
            head.y + m.offset_y + dy_mm,
            0.0,
        ))
    }

    /// Fill in `machine_coordinate` and `source_camera` on `object`.
    pub fn locate(&self, object: &mut DetectedObject, width: u32, height: u32, head: &MachinePosition) {
        object.machine_coordinate = self.to_machine(object.center, width, height, head);
        object.source_camera = Some(self.mount.camera_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PixelMapper {
        PixelMapper::new(CameraMount {
            camera_id: 2,
            offset_x: 10.0,
            offset_y: -5.0,
            visible_width: 400.0,
            visible_height: 300.0,
        })
    }

    #[test]
    fn image_centre_maps_to_camera_position() {
        let head = MachinePosition::new(100.0, 50.0, 60.0);
        let p = mapper().to_machine(PixelPoint::new(320.0, 240.0), 640, 480, &head).unwrap();
        assert_eq!(p, MachinePosition::new(110.0, 45.0, 0.0));
    }

    #[test]
    fn y_axis_is_inverted() {
        let head = MachinePosition::origin();
        // 640px over 400mm is 1.6 px/mm; 480px over 300mm is 1.6 px/mm.
        let top_right = mapper().to_machine(PixelPoint::new(640.0, 0.0), 640, 480, &head).unwrap();
        assert!((top_right.x - 210.0).abs() < 1e-9);
        assert!((top_right.y - 145.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs_map_to_none() {
        let head = MachinePosition::origin();
        assert!(mapper().to_machine(PixelPoint::default(), 0, 480, &head).is_none());
        let flat = PixelMapper::new(CameraMount {
            visible_height: 0.0,
            ..CameraMount::default()
        });
        assert!(flat.to_machine(PixelPoint::default(), 640, 480, &head).is_none());
    }

    #[test]
    fn locate_tags_camera() {
        let mut obj = DetectedObject::candidate(
            0,
            vec![],
            Default::default(),
            100.0,
            PixelPoint::new(320.0, 240.0),
        );
        mapper().locate(&mut obj, 640, 480, &MachinePosition::origin());
        assert_eq!(obj.source_camera, Some(2));
        assert_eq!(obj.machine_coordinate, Some(MachinePosition::new(10.0, -5.0, 0.0)));
    }
}
