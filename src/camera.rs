//! Per-eye camera: look-at view and perspective projection with lazy
//! recomputation. Matrices are rebuilt only when their parameters change.

use glam::{Mat4, Vec3};

/// Camera state shared by both eyes; the compositor applies the interocular
/// and projection-center offsets per eye on top of these matrices.
#[derive(Debug, Clone)]
pub struct StereoCamera {
    eye: Vec3,
    look_at: Vec3,
    up: Vec3,

    fov_y: f32,
    aspect: f32,
    near: f32,
    far: f32,

    view: Mat4,
    proj: Mat4,
    view_dirty: bool,
    proj_dirty: bool,
}

impl Default for StereoCamera {
    fn default() -> Self {
        let mut cam = Self {
            eye: Vec3::ZERO,
            look_at: Vec3::new(0.0, 0.0, -10.0),
            up: Vec3::Y,
            fov_y: 95.0_f32.to_radians(),
            aspect: 1080.0 / (1920.0 * 0.5),
            near: 0.1,
            far: 1000.0,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            view_dirty: true,
            proj_dirty: true,
        };
        cam.view = cam.compute_view();
        cam.proj = cam.compute_proj();
        cam.view_dirty = false;
        cam.proj_dirty = false;
        cam
    }
}

impl StereoCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_view_params(&mut self, eye: Vec3, look_at: Vec3, up: Vec3) {
        self.eye = eye;
        self.look_at = look_at;
        self.up = up;
        self.view_dirty = true;
    }

    pub fn set_proj_params(&mut self, fov_y_deg: f32, aspect: f32, near: f32, far: f32) {
        self.fov_y = fov_y_deg.to_radians();
        self.aspect = aspect;
        self.near = near;
        self.far = far;
        self.proj_dirty = true;
    }

    /// Overwrite the view translation directly, bypassing the look-at
    /// parameters. The cached matrix stays authoritative until the next
    /// `set_view_params`.
    pub fn translate(&mut self, x: f32, y: f32, z: f32) {
        let mut view = self.view_matrix();
        view.w_axis.x = x;
        view.w_axis.y = y;
        view.w_axis.z = z;
        self.view = view;
        self.view_dirty = false;
    }

    /// Shift the view translation in place, on top of whatever the view
    /// currently is. Used for the per-eye interocular displacement.
    pub fn offset_view_translation(&mut self, offset: Vec3) {
        let mut view = self.view_matrix();
        view.w_axis.x += offset.x;
        view.w_axis.y += offset.y;
        view.w_axis.z += offset.z;
        self.view = view;
        self.view_dirty = false;
    }

    /// Shift the projection center horizontally in place. Used for the
    /// per-eye lens-axis alignment.
    pub fn offset_projection_center(&mut self, offset_x: f32) {
        let mut proj = self.projection_matrix();
        proj.w_axis.x += offset_x;
        self.proj = proj;
        self.proj_dirty = false;
    }

    /// Replace the view with an externally supplied rotation composed with a
    /// translation (orientation-driven camera placement).
    pub fn set_transformation(&mut self, rotation: Mat4, translation: Mat4) {
        self.view = translation * rotation;
        self.view_dirty = false;
    }

    pub fn view_matrix(&mut self) -> Mat4 {
        if self.view_dirty {
            self.view = self.compute_view();
            self.view_dirty = false;
        }
        self.view
    }

    pub fn projection_matrix(&mut self) -> Mat4 {
        if self.proj_dirty {
            self.proj = self.compute_proj();
            self.proj_dirty = false;
        }
        self.proj
    }

    fn compute_view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.look_at, self.up)
    }

    fn compute_proj(&self) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y, self.aspect, self.near, self.far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrices_cached_until_params_change() {
        let mut cam = StereoCamera::new();
        let v1 = cam.view_matrix();
        let v2 = cam.view_matrix();
        assert_eq!(v1, v2);

        cam.set_view_params(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, Vec3::Y);
        let v3 = cam.view_matrix();
        assert_ne!(v1, v3);
    }

    #[test]
    fn projection_follows_fov() {
        let mut cam = StereoCamera::new();
        let p1 = cam.projection_matrix();
        cam.set_proj_params(60.0, 1.5, 0.1, 100.0);
        let p2 = cam.projection_matrix();
        assert_ne!(p1, p2);
    }

    #[test]
    fn translate_overwrites_view_translation() {
        let mut cam = StereoCamera::new();
        cam.translate(1.0, 2.0, 3.0);
        let v = cam.view_matrix();
        assert_eq!(v.w_axis.x, 1.0);
        assert_eq!(v.w_axis.y, 2.0);
        assert_eq!(v.w_axis.z, 3.0);
    }

    #[test]
    fn offsets_accumulate_on_current_matrices() {
        let mut cam = StereoCamera::new();
        let v0 = cam.view_matrix();
        cam.offset_view_translation(Vec3::new(0.03, 0.0, 2.0));
        let v1 = cam.view_matrix();
        assert!((v1.w_axis.x - (v0.w_axis.x + 0.03)).abs() < 1e-6);
        assert!((v1.w_axis.z - (v0.w_axis.z + 2.0)).abs() < 1e-6);

        let p0 = cam.projection_matrix();
        cam.offset_projection_center(-0.1);
        let p1 = cam.projection_matrix();
        assert!((p1.w_axis.x - (p0.w_axis.x - 0.1)).abs() < 1e-6);
    }

    #[test]
    fn set_transformation_composes_rotation_and_translation() {
        let mut cam = StereoCamera::new();
        let rot = Mat4::from_rotation_y(0.5);
        let trans = Mat4::from_translation(Vec3::new(0.0, -5.0, 10.0));
        cam.set_transformation(rot, trans);
        let v = cam.view_matrix();
        assert_eq!(v, trans * rot);
    }
}
