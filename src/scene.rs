//! Virtual environments the flat host content is composited into.
//!
//! Each scene places the viewer and a screen quad at fixed world positions.
//! The environment geometry itself (hall, cockpit, sphere dome) is loaded
//! from the assets path by the host-provided [`SceneRenderer`]; this module
//! only owns the placement presets and the screen quad draw.

use bytemuck::cast_slice;
use glam::{Mat4, Vec3};

use crate::camera::StereoCamera;
use crate::error::GraphicsError;
use crate::graphics::{BufferId, GraphicsApi, IndexedPrimitive, ProgramId, TextureId};

/// Virtual environment selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneType {
    CinemaHall,
    Spaceship,
    Sphere,
}

impl SceneType {
    /// Decode the host-facing integer selector.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(SceneType::CinemaHall),
            1 => Some(SceneType::Spaceship),
            2 => Some(SceneType::Sphere),
            _ => None,
        }
    }

    /// Viewer and screen placement for this environment.
    pub fn preset(self) -> ScenePreset {
        match self {
            SceneType::CinemaHall => ScenePreset {
                camera_position: Vec3::new(0.0, -5.0, 10.0),
                screen_translation: Vec3::new(0.0, 5.0, -20.0),
                screen_scale: Vec3::new(7.1, 4.0, 1.0),
            },
            SceneType::Spaceship => ScenePreset {
                camera_position: Vec3::new(0.0, -6.5, -3.5),
                screen_translation: Vec3::new(0.0, 5.75, -3.0),
                screen_scale: Vec3::new(4.0, 3.0, 1.0),
            },
            SceneType::Sphere => ScenePreset {
                camera_position: Vec3::ZERO,
                screen_translation: Vec3::new(0.0, 0.0, -7.0),
                screen_scale: Vec3::new(4.0, 3.0, 1.0),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenePreset {
    pub camera_position: Vec3,
    pub screen_translation: Vec3,
    pub screen_scale: Vec3,
}

impl ScenePreset {
    /// World transform of the screen quad.
    pub fn screen_transform(&self) -> Mat4 {
        Mat4::from_scale(self.screen_scale) * Mat4::from_translation(self.screen_translation)
    }
}

/// Renders the environment geometry around the screen. Implemented by the
/// host; a no-op implementation gives plain floating-screen playback.
pub trait SceneRenderer {
    /// Load the geometry for `scene`. Returns false when the assets are
    /// missing or broken; the compositor then keeps the previous scene.
    fn init(&mut self, scene: SceneType) -> bool;

    fn render_scene(&mut self, elapsed: f32, camera: &mut StereoCamera);
}

/// A [`SceneRenderer`] that draws nothing.
#[derive(Debug, Default)]
pub struct EmptySceneRenderer;

impl SceneRenderer for EmptySceneRenderer {
    fn init(&mut self, _scene: SceneType) -> bool {
        true
    }

    fn render_scene(&mut self, _elapsed: f32, _camera: &mut StereoCamera) {}
}

const SCREEN_VERTEX_SHADER: &str = "\
attribute vec4 a_position;
attribute vec2 a_uv;
uniform mat4 u_mvp;
varying vec2 v_uv;
void main() {
  v_uv = a_uv;
  gl_Position = u_mvp * a_position;
}
";

const SCREEN_FRAGMENT_SHADER: &str = "\
precision mediump float;
uniform sampler2D u_texture;
varying vec2 v_uv;
void main() {
  gl_FragColor = texture2D(u_texture, v_uv);
}
";

/// The quad the flat host content is textured onto inside the scene.
pub struct ScreenQuad {
    program: ProgramId,
    vertices: BufferId,
    uvs: BufferId,
    indices: BufferId,
}

impl ScreenQuad {
    pub fn new(gfx: &mut dyn GraphicsApi) -> Result<Self, GraphicsError> {
        let program = gfx.create_program(SCREEN_VERTEX_SHADER, SCREEN_FRAGMENT_SHADER)?;
        let vertices: [Vec3; 4] = [
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ];
        let uvs: [f32; 8] = [0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let indices: [u16; 4] = [0, 1, 3, 2];
        Ok(Self {
            program,
            vertices: gfx.create_vertex_buffer(cast_slice(&vertices))?,
            uvs: gfx.create_vertex_buffer(cast_slice(&uvs))?,
            indices: gfx.create_index_buffer(&indices)?,
        })
    }

    /// Draw the host texture at `screen_transform` as seen by `camera`.
    pub fn draw(
        &self,
        gfx: &mut dyn GraphicsApi,
        camera: &mut StereoCamera,
        screen_transform: Mat4,
        texture: TextureId,
    ) {
        let mvp = camera.projection_matrix() * camera.view_matrix() * screen_transform;
        gfx.use_program(self.program);
        gfx.set_uniform_mat4(self.program, "u_mvp", &mvp.to_cols_array());
        gfx.bind_attribute_buffer(self.program, "a_position", self.vertices, 3);
        gfx.bind_attribute_buffer(self.program, "a_uv", self.uvs, 2);
        gfx.bind_texture(0, texture);
        gfx.draw_indexed(IndexedPrimitive::TriangleStrip, self.indices, 4);
    }

    pub fn destroy(&self, gfx: &mut dyn GraphicsApi) {
        gfx.delete_program(self.program);
        gfx.delete_buffer(self.vertices);
        gfx.delete_buffer(self.uvs);
        gfx.delete_buffer(self.indices);
    }
}
