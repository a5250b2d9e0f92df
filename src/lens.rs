//! Lens distortion model and per-device lens geometry.
//!
//! The barrel distortion of an HMD lens is modeled as a radial polynomial in
//! the squared distance from the optical center. All values here are constant
//! for the lifetime of the process once a device model is selected.

use crate::error::VrError;

/// Supported handset models. Selects the lens geometry at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    GalaxyS4,
    GalaxyS5,
}

impl DeviceModel {
    pub fn lens_parameters(self) -> LensParameters {
        match self {
            DeviceModel::GalaxyS4 => LensParameters {
                h_screen_size: 0.1111,
                lens_separation: 0.05,
                k: [1.0, 0.06, 0.07, 0.0],
            },
            DeviceModel::GalaxyS5 => LensParameters {
                h_screen_size: 0.1133,
                lens_separation: 0.05,
                k: [1.0, 0.06, 0.07, 0.0],
            },
        }
    }
}

/// Physical lens geometry for one device model.
///
/// `h_screen_size` is the horizontal extent of the panel in meters,
/// `lens_separation` the distance between the two lens centers, and `k` the
/// four radial distortion polynomial coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LensParameters {
    pub h_screen_size: f32,
    pub lens_separation: f32,
    pub k: [f32; 4],
}

impl LensParameters {
    /// Radial distortion scale at a squared radius:
    /// `k0 + k1*r^2 + k2*r^4 + k3*r^6`.
    pub fn distortion_scale_factor(&self, r_sq: f32) -> f32 {
        self.k[0] + self.k[1] * r_sq + self.k[2] * r_sq * r_sq + self.k[3] * r_sq * r_sq * r_sq
    }

    /// Normalized horizontal displacement of a lens's optical center from the
    /// center of its screen half.
    pub fn lens_center_offset(&self) -> f32 {
        1.0 - 2.0 * self.lens_separation / self.h_screen_size
    }

    /// Distortion scale at the edge of the pre-warp unit circle, used to
    /// normalize the warp so the visible frustum matches the lens FOV.
    pub fn distortion_scale_at_edge(&self) -> f32 {
        self.distortion_scale_factor(1.0)
    }

    /// Horizontal shift of the projection center so the frustum apex sits on
    /// the lens axis instead of the center of the half-screen, in NDC units.
    pub fn projection_offset(&self) -> f32 {
        let view_center = self.h_screen_size * 0.25;
        let eye_projection_shift = view_center - self.lens_separation * 0.5;
        4.0 * eye_projection_shift / self.h_screen_size
    }

    /// A zero-sized screen or lens separation makes the mesh math divide by
    /// zero; reject it before any grid is built.
    pub fn validate(&self) -> Result<(), VrError> {
        if self.h_screen_size <= 0.0 {
            return Err(VrError::InvalidLensGeometry("h_screen_size must be positive"));
        }
        if self.lens_separation <= 0.0 {
            return Err(VrError::InvalidLensGeometry("lens_separation must be positive"));
        }
        Ok(())
    }
}
