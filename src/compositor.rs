//! Stereo composition pipeline.
//!
//! The compositor owns the graphics backend, the orientation service, the
//! distortion pass and the scene layer, and drives a frame in two shapes:
//!
//! * compose mode: the host renders its flat UI into an off-screen target
//!   between `begin`/`end`, and `end` pushes it through the scene and the
//!   stereo distortion passes;
//! * frame mode: the host renders 3D content itself per eye between
//!   `begin_left_frame`/`end_left` and `begin_right_frame`/`end_right`,
//!   using the eye matrices the begin calls hand back.

use glam::{Mat4, Quat, Vec3};
use log::{info, warn};

use crate::camera::StereoCamera;
use crate::distorter::{Distorter, DistortionTechnique};
use crate::error::{GraphicsError, VrError};
use crate::fusion::{OrientationSource, SensorType};
use crate::graphics::{FramebufferId, GraphicsApi, RenderTarget, RenderTargetDesc, TextureId};
use crate::lens::{DeviceModel, LensParameters};
use crate::mesh::{Eye, SurfaceOrientation};
use crate::scene::{SceneRenderer, SceneType, ScreenQuad};
use crate::service::OrientationService;

const DEFAULT_ASSETS_PATH: &str = "/system/media/vr_model/";
const EYE_FOV_DEG: f32 = 95.0;

/// Builds a fusion engine for the selected sensor. Lets the host wire in
/// its platform sensor stream and tracker transport.
pub type EngineFactory = Box<dyn Fn(SensorType) -> Box<dyn OrientationSource>>;

/// Tunable stereo parameters. Lens-derived fields start from the device
/// model and may be overridden by the host for calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VrParams {
    /// Interpupillary distance in meters.
    pub ipd: f32,
    /// Eye-to-screen distance in meters.
    pub eye_screen_distance: f32,
    /// Lens center separation in meters.
    pub lens_separation: f32,
    /// Radial distortion polynomial coefficients.
    pub distortion: [f32; 4],
}

impl VrParams {
    fn from_lens(lens: &LensParameters) -> Self {
        Self {
            lens_separation: lens.lens_separation,
            distortion: lens.k,
            ..Self::default()
        }
    }
}

impl Default for VrParams {
    fn default() -> Self {
        Self {
            ipd: 0.063,
            eye_screen_distance: 0.0,
            lens_separation: 0.0,
            distortion: [0.0; 4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderMode {
    Cinema,
    Vr,
}

struct SizedTarget {
    target: RenderTarget,
    width: u32,
    height: u32,
}

pub struct StereoCompositor<G: GraphicsApi> {
    gfx: G,
    service: OrientationService,
    engine_factory: EngineFactory,
    scene_renderer: Box<dyn SceneRenderer>,
    distorter: Distorter,
    screen_quad: ScreenQuad,
    camera: StereoCamera,

    lens: LensParameters,
    params: VrParams,
    surface: SurfaceOrientation,
    width: u32,
    height: u32,

    mode: RenderMode,
    scene_type: SceneType,
    notification_z: i32,
    pass: Eye,
    assets_path: String,

    compose_mode: bool,
    compose_target: Option<SizedTarget>,
    eye_target: Option<SizedTarget>,
}

impl<G: GraphicsApi> StereoCompositor<G> {
    pub fn new(
        mut gfx: G,
        width: u32,
        height: u32,
        device: DeviceModel,
        engine_factory: EngineFactory,
        scene_renderer: Box<dyn SceneRenderer>,
    ) -> Result<Self, VrError> {
        let lens = device.lens_parameters();
        lens.validate()?;

        let surface = if width > height {
            SurfaceOrientation::Landscape
        } else {
            SurfaceOrientation::Portrait
        };

        let distorter = Distorter::new(&mut gfx, width, height, surface, &lens)?;
        let screen_quad = ScreenQuad::new(&mut gfx)?;
        let service = OrientationService::new(engine_factory(SensorType::Internal));

        info!(
            "compositor up: {width}x{height} {surface:?}, device {device:?}"
        );

        Ok(Self {
            gfx,
            service,
            engine_factory,
            scene_renderer,
            distorter,
            screen_quad,
            camera: StereoCamera::new(),
            lens,
            params: VrParams::from_lens(&lens),
            surface,
            width,
            height,
            mode: RenderMode::Cinema,
            scene_type: SceneType::CinemaHall,
            notification_z: 0,
            pass: Eye::Left,
            assets_path: DEFAULT_ASSETS_PATH.to_string(),
            compose_mode: false,
            compose_target: None,
            eye_target: None,
        })
    }

    pub fn vr_params(&self) -> VrParams {
        self.params
    }

    pub fn set_vr_params(&mut self, params: VrParams) {
        self.params = params;
    }

    pub fn surface_orientation(&self) -> SurfaceOrientation {
        self.surface
    }

    pub fn assets_path(&self) -> &str {
        &self.assets_path
    }

    /// Depth offset for flat notification rendering, as set by `set_vr_mode`.
    pub fn notification_depth(&self) -> i32 {
        self.notification_z
    }

    /// Off-screen target the host composes into, once `begin` has run.
    pub fn target_fbo(&self) -> Option<FramebufferId> {
        self.compose_target.as_ref().map(|t| t.target.framebuffer)
    }

    /// Enter compose mode. A second `begin` without an `end` is a no-op.
    /// The compose target is reallocated only when the dimensions change.
    pub fn begin(&mut self, width: u32, height: u32) -> Result<(), GraphicsError> {
        if self.compose_mode {
            return Ok(());
        }
        self.compose_mode = true;

        let needs_realloc = !matches!(
            &self.compose_target,
            Some(t) if t.width == width && t.height == height
        );
        if needs_realloc {
            if let Some(old) = self.compose_target.take() {
                self.gfx.delete_render_target(old.target);
            }
            let target = self.gfx.create_render_target(RenderTargetDesc {
                width,
                height,
                with_depth: false,
            })?;
            self.compose_target = Some(SizedTarget {
                target,
                width,
                height,
            });
        }
        // compose_target is Some after the block above.
        if let Some(t) = &self.compose_target {
            self.gfx.bind_framebuffer(Some(t.target.framebuffer));
        }
        self.gfx.clear(0.0, 0.0, 0.0, 1.0);
        // Inset so the host's outermost UI pixels never land under the lens
        // bezel.
        self.gfx
            .viewport(4, 4, width as i32 - 20, height as i32 - 8);
        Ok(())
    }

    /// Leave compose mode and push the composed content through the stereo
    /// pipeline. A stray `end` without a `begin` is a no-op.
    pub fn end(&mut self) -> Result<(), GraphicsError> {
        if !self.compose_mode {
            return Ok(());
        }
        self.compose_mode = false;

        self.gfx.bind_framebuffer(None);
        let Some(texture) = self.compose_target.as_ref().map(|t| t.target.color) else {
            return Ok(());
        };
        match self.mode {
            RenderMode::Cinema => {
                self.render_scene(texture, 0.0)?;
            }
            RenderMode::Vr => {
                self.pass = Eye::Single;
                self.render_in_stereo(texture);
            }
        }
        Ok(())
    }

    /// Begin the left-eye pass of a host-rendered frame. Returns the
    /// column-major view and projection matrices for that eye.
    pub fn begin_left_frame(&mut self) -> Result<([f32; 16], [f32; 16]), GraphicsError> {
        self.service.start();
        let (view, proj) = self.eye_matrices(Eye::Left);
        self.bind_eye_target(Eye::Left)?;
        self.service.stop();
        Ok((view, proj))
    }

    pub fn end_left(&mut self) {
        self.flush_framebuffer();
    }

    pub fn begin_right_frame(&mut self) -> Result<([f32; 16], [f32; 16]), GraphicsError> {
        self.service.start();
        let (view, proj) = self.eye_matrices(Eye::Right);
        self.bind_eye_target(Eye::Right)?;
        self.service.stop();
        Ok((view, proj))
    }

    pub fn end_right(&mut self) {
        self.flush_framebuffer();
    }

    /// Select the cinema environment. An unknown selector leaves the current
    /// scene in place and reports failure; the mode still switches to cinema.
    pub fn set_cinema_mode(&mut self, raw_scene: i32) -> bool {
        self.mode = RenderMode::Cinema;
        let Some(scene) = SceneType::from_raw(raw_scene) else {
            warn!("unknown scene selector {raw_scene}");
            return false;
        };
        if self.scene_renderer.init(scene) {
            self.scene_type = scene;
            info!("cinema mode, scene {scene:?}");
            true
        } else {
            warn!("scene {scene:?} failed to load, keeping {:?}", self.scene_type);
            false
        }
    }

    /// Switch to flat notification rendering at the given depth offset.
    pub fn set_vr_mode(&mut self, z_offset: i32) -> bool {
        self.mode = RenderMode::Vr;
        self.notification_z = z_offset;
        true
    }

    /// Switch the orientation source. Stops sampling before the swap.
    pub fn set_sensor_type(&mut self, raw: i32) -> bool {
        let Some(sensor) = SensorType::from_raw(raw) else {
            warn!("unknown sensor selector {raw}");
            return false;
        };
        self.service.stop();
        self.service.set_engine((self.engine_factory)(sensor));
        info!("sensor source set to {sensor:?}");
        true
    }

    pub fn set_distortion(&mut self, enabled: bool) -> bool {
        self.distorter.set_enabled(enabled);
        true
    }

    pub fn set_distortion_technique(&mut self, technique: DistortionTechnique) {
        self.distorter.set_technique(technique);
    }

    /// Point scene loading at a different asset tree. `None` restores the
    /// default path and reports failure, matching the host contract.
    pub fn set_assets_path(&mut self, path: Option<&str>) -> bool {
        match path {
            Some(p) => {
                self.assets_path = p.to_string();
                true
            }
            None => {
                warn!("invalid assets path, using default {DEFAULT_ASSETS_PATH}");
                self.assets_path = DEFAULT_ASSETS_PATH.to_string();
                false
            }
        }
    }

    /// Render the scene around `texture` for both eyes and distort each
    /// half onto the screen. `end` calls this in cinema mode; a host
    /// driving playback directly can call it per frame.
    pub fn render_scene(&mut self, texture: TextureId, elapsed: f32) -> Result<(), GraphicsError> {
        self.service.start();

        let aspect = self.eye_aspect();
        let orientation = orientation_matrix(self.service.orientation());
        let preset = self.scene_type.preset();
        let translation = Mat4::from_translation(preset.camera_position);
        let screen_transform = preset.screen_transform();
        let projection_offset = self.lens.projection_offset();
        let half_ipd = self.params.ipd * 0.5;

        for (eye, proj_shift, view_shift) in [
            (Eye::Left, -projection_offset, half_ipd),
            (Eye::Right, projection_offset, -half_ipd),
        ] {
            self.bind_eye_target(eye)?;

            self.camera.set_proj_params(EYE_FOV_DEG, aspect, 0.1, 10000.0);
            self.camera.set_transformation(orientation, translation);
            self.camera.offset_projection_center(proj_shift);
            // The fixed z pushback keeps the screen quad out of the near
            // plane in every scene.
            self.camera
                .offset_view_translation(Vec3::new(view_shift, 0.0, 2.0));

            self.scene_renderer.render_scene(elapsed, &mut self.camera);
            self.screen_quad
                .draw(&mut self.gfx, &mut self.camera, screen_transform, texture);
            self.flush_framebuffer();
        }

        self.service.stop();
        Ok(())
    }

    /// Eye matrices for host-rendered frames: the inverse head orientation
    /// as the view with the interocular shift, and the lens-shifted
    /// projection.
    fn eye_matrices(&mut self, eye: Eye) -> ([f32; 16], [f32; 16]) {
        let sign = match eye {
            Eye::Left => 1.0,
            Eye::Right | Eye::Single => -1.0,
        };

        let mut view = orientation_matrix(self.service.orientation());
        view.w_axis.x += sign * self.params.ipd * 0.5;

        let mut cam = StereoCamera::new();
        cam.set_proj_params(EYE_FOV_DEG, self.eye_aspect(), 0.1, 1000.0);
        let mut proj = cam.projection_matrix();
        proj.w_axis.x -= sign * self.lens.projection_offset();

        (view.to_cols_array(), proj.to_cols_array())
    }

    /// Bind the shared per-eye render target, reallocating it only when the
    /// eye dimensions change, and mark which half of the screen the next
    /// stereo blit goes to.
    fn bind_eye_target(&mut self, pass: Eye) -> Result<(), GraphicsError> {
        let (w, h) = self.eye_dimensions();

        let needs_realloc = !matches!(
            &self.eye_target,
            Some(t) if t.width == w && t.height == h
        );
        if needs_realloc {
            if let Some(old) = self.eye_target.take() {
                self.gfx.delete_render_target(old.target);
            }
            let target = self.gfx.create_render_target(RenderTargetDesc {
                width: w,
                height: h,
                with_depth: true,
            })?;
            self.eye_target = Some(SizedTarget {
                target,
                width: w,
                height: h,
            });
        }
        if let Some(t) = &self.eye_target {
            self.gfx.bind_framebuffer(Some(t.target.framebuffer));
        }
        self.gfx.viewport(0, 0, w as i32, h as i32);
        self.gfx.clear(0.0, 0.0, 0.0, 1.0);
        self.pass = pass;
        Ok(())
    }

    /// Unbind the eye target and distort its contents onto the screen half
    /// of the current pass.
    fn flush_framebuffer(&mut self) {
        self.gfx.bind_framebuffer(None);
        self.gfx.flush();
        if let Some(texture) = self.eye_target.as_ref().map(|t| t.target.color) {
            self.render_in_stereo(texture);
        }
    }

    fn render_in_stereo(&mut self, texture: TextureId) {
        match self.pass {
            Eye::Left => self.blit_half(Eye::Left, texture),
            Eye::Right => self.blit_half(Eye::Right, texture),
            Eye::Single => {
                self.blit_half(Eye::Right, texture);
                self.blit_half(Eye::Left, texture);
            }
        }
    }

    /// Distort `texture` into the screen half belonging to `eye`.
    fn blit_half(&mut self, eye: Eye, texture: TextureId) {
        let w = self.width as i32;
        let h = self.height as i32;
        let (x, y, vw, vh) = match (self.surface, eye) {
            (SurfaceOrientation::Portrait, Eye::Left) => (0, h / 2, w, h / 2),
            (SurfaceOrientation::Portrait, _) => (0, 0, w, h / 2),
            (SurfaceOrientation::Landscape, Eye::Left) => (0, 0, w / 2, h),
            (SurfaceOrientation::Landscape, _) => (w / 2, 0, w / 2, h),
        };
        self.gfx.viewport(x, y, vw, vh);
        self.gfx.scissor(x, y, vw, vh);
        self.distorter.render(&mut self.gfx, eye, texture);
    }

    /// Pixel dimensions of one eye's render target.
    fn eye_dimensions(&self) -> (u32, u32) {
        match self.surface {
            SurfaceOrientation::Landscape => (self.width / 2, self.height),
            SurfaceOrientation::Portrait => (self.height / 2, self.width),
        }
    }

    fn eye_aspect(&self) -> f32 {
        let (w, h) = self.eye_dimensions();
        w as f32 / h as f32
    }
}

impl<G: GraphicsApi> Drop for StereoCompositor<G> {
    fn drop(&mut self) {
        self.service.stop();
        self.distorter.destroy(&mut self.gfx);
        self.screen_quad.destroy(&mut self.gfx);
        if let Some(t) = self.compose_target.take() {
            self.gfx.delete_render_target(t.target);
        }
        if let Some(t) = self.eye_target.take() {
            self.gfx.delete_render_target(t.target);
        }
    }
}

/// Inverse of the head orientation, applied as the camera rotation. The
/// rotation part of a unit quaternion matrix is orthonormal, so the affine
/// inverse is exact.
fn orientation_matrix(q: Quat) -> Mat4 {
    Mat4::from_quat(q).inverse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::testing::RecordingGraphics;
    use crate::scene::EmptySceneRenderer;

    struct IdentitySource;

    impl OrientationSource for IdentitySource {
        fn sample(&mut self) -> Quat {
            std::thread::sleep(std::time::Duration::from_millis(1));
            Quat::IDENTITY
        }
    }

    fn compositor(width: u32, height: u32) -> StereoCompositor<RecordingGraphics> {
        StereoCompositor::new(
            RecordingGraphics::new(),
            width,
            height,
            DeviceModel::GalaxyS4,
            Box::new(|_| Box::new(IdentitySource)),
            Box::new(EmptySceneRenderer),
        )
        .unwrap()
    }

    #[test]
    fn wide_surface_is_landscape() {
        let c = compositor(1920, 1080);
        assert_eq!(c.surface_orientation(), SurfaceOrientation::Landscape);
        let c = compositor(1080, 1920);
        assert_eq!(c.surface_orientation(), SurfaceOrientation::Portrait);
    }

    #[test]
    fn eye_matrices_differ_only_by_stereo_offsets() {
        let mut c = compositor(1920, 1080);
        let (left_view, left_proj) = c.begin_left_frame().unwrap();
        c.end_left();
        let (right_view, right_proj) = c.begin_right_frame().unwrap();
        c.end_right();

        let ipd = c.vr_params().ipd;
        for i in 0..16 {
            if i == 12 {
                assert!((left_view[12] - ipd * 0.5).abs() < 1e-6);
                assert!((right_view[12] + ipd * 0.5).abs() < 1e-6);
            } else {
                assert_eq!(left_view[i], right_view[i], "view element {i}");
            }
        }

        let offset = DeviceModel::GalaxyS4.lens_parameters().projection_offset();
        for i in 0..16 {
            if i == 12 {
                assert!((left_proj[12] + offset).abs() < 1e-6);
                assert!((right_proj[12] - offset).abs() < 1e-6);
            } else {
                assert_eq!(left_proj[i], right_proj[i], "proj element {i}");
            }
        }
    }

    #[test]
    fn begin_is_idempotent_until_end() {
        let mut c = compositor(1920, 1080);
        c.begin(1280, 720).unwrap();
        let creations = c.gfx.op_count("create_render_target");
        let binds = c.gfx.op_count("bind_framebuffer");

        // Second begin without an end changes nothing.
        c.begin(1280, 720).unwrap();
        assert_eq!(c.gfx.op_count("create_render_target"), creations);
        assert_eq!(c.gfx.op_count("bind_framebuffer"), binds);
    }

    #[test]
    fn compose_target_reused_across_frames() {
        let mut c = compositor(1920, 1080);
        c.begin(1280, 720).unwrap();
        c.end().unwrap();
        let creations = c.gfx.op_count("create_render_target");

        c.begin(1280, 720).unwrap();
        c.end().unwrap();
        assert_eq!(c.gfx.op_count("create_render_target"), creations);

        // A size change drops the old target and allocates a new one.
        c.begin(640, 480).unwrap();
        c.end().unwrap();
        assert_eq!(c.gfx.op_count("create_render_target"), creations + 1);
        assert!(c.gfx.op_count("delete_render_target") >= 1);
    }

    #[test]
    fn vr_mode_end_distorts_both_halves() {
        let mut c = compositor(1920, 1080);
        assert!(c.set_vr_mode(3));
        c.begin(1280, 720).unwrap();
        c.gfx.ops.clear();
        c.end().unwrap();

        // Right half first, then left, each with its own scissored viewport.
        assert!(c.gfx.ops.contains(&"viewport 960 0 960 1080".to_string()));
        assert!(c.gfx.ops.contains(&"viewport 0 0 960 1080".to_string()));
        assert_eq!(c.gfx.op_count("draw_indexed"), 2);
    }

    #[test]
    fn cinema_end_renders_scene_per_eye() {
        let mut c = compositor(1920, 1080);
        assert!(c.set_cinema_mode(0));
        c.begin(1280, 720).unwrap();
        c.gfx.ops.clear();
        c.end().unwrap();

        // Each eye draws the screen quad once and blits through the
        // distorter once.
        assert_eq!(c.gfx.op_count("draw_indexed"), 4);
        assert!(c.gfx.op_count("scissor") >= 2);
    }

    #[test]
    fn invalid_selectors_are_rejected() {
        let mut c = compositor(1920, 1080);
        assert!(!c.set_cinema_mode(9));
        assert!(!c.set_sensor_type(7));
        assert!(c.set_sensor_type(1));
    }

    #[test]
    fn assets_path_falls_back_to_default() {
        let mut c = compositor(1920, 1080);
        assert!(c.set_assets_path(Some("/data/vr_assets/")));
        assert_eq!(c.assets_path(), "/data/vr_assets/");
        assert!(!c.set_assets_path(None));
        assert_eq!(c.assets_path(), DEFAULT_ASSETS_PATH);
    }

    #[test]
    fn stray_end_is_harmless() {
        let mut c = compositor(1920, 1080);
        c.gfx.ops.clear();
        c.end().unwrap();
        assert!(c.gfx.ops.is_empty());
    }

    #[test]
    fn explicit_targets_released_on_realloc() {
        let mut c = compositor(1920, 1080);
        c.begin(1280, 720).unwrap();
        c.end().unwrap();
        assert_eq!(c.gfx.live_targets, 2);

        // Resizing the compose surface swaps one target, never leaks it.
        c.begin(640, 480).unwrap();
        c.end().unwrap();
        assert_eq!(c.gfx.live_targets, 2);
    }
}
