//! Lens distortion pass.
//!
//! Two techniques produce the same barrel warp. The vertex technique draws
//! the pre-warped [`DistortionGrid`] with a pass-through fragment shader, so
//! the warp costs nothing per pixel. The fragment technique draws a flat
//! quad and evaluates the warp polynomial per fragment, which is exact
//! between grid cells but considerably more expensive on mobile GPUs.

use bytemuck::cast_slice;

use crate::error::GraphicsError;
use crate::graphics::{BufferId, GraphicsApi, IndexedPrimitive, ProgramId, TextureId};
use crate::lens::LensParameters;
use crate::mesh::{DistortionGrid, Eye, SurfaceOrientation, GRID_RESOLUTION};

/// Where the warp polynomial is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionTechnique {
    Vertex,
    Fragment,
}

const VERTEX_SHADER: &str = "\
attribute vec4 a_position;
attribute vec4 a_uv;
varying vec2 v_uv;
void main() {
  v_uv = a_uv.xy;
  gl_Position = a_position;
}
";

const PASSTHROUGH_FRAGMENT_SHADER: &str = "\
precision mediump float;
uniform sampler2D u_texture;
varying vec2 v_uv;
void main() {
  if (v_uv.x < 0.0 || v_uv.x > 1.0 || v_uv.y < 0.0 || v_uv.y > 1.0) {
    gl_FragColor = vec4(0.0, 0.0, 0.0, 0.0);
  } else {
    gl_FragColor = texture2D(u_texture, v_uv);
  }
}
";

const WARP_FRAGMENT_SHADER: &str = "\
precision mediump float;
uniform sampler2D u_texture;
uniform vec2 u_lens_center;
uniform vec4 u_warp_param;
varying vec2 v_uv;
void main() {
  vec2 theta = (v_uv * 2.0 - 1.0) - u_lens_center;
  float r_sq = theta.x * theta.x + theta.y * theta.y;
  vec2 rvector = theta * (u_warp_param.x + u_warp_param.y * r_sq
      + u_warp_param.z * r_sq * r_sq + u_warp_param.w * r_sq * r_sq * r_sq);
  vec2 pos = ((rvector + u_lens_center) + vec2(1.0)) * 0.5;
  if (pos.x < 0.0 || pos.x > 1.0 || pos.y < 0.0 || pos.y > 1.0) {
    gl_FragColor = vec4(0.0);
  } else {
    gl_FragColor = texture2D(u_texture, pos);
  }
}
";

struct MeshBuffers {
    vertices: BufferId,
    uvs: BufferId,
    indices: BufferId,
    index_count: u32,
}

impl MeshBuffers {
    fn upload(
        gfx: &mut dyn GraphicsApi,
        vertices: &[glam::Vec3],
        uvs: &[glam::Vec2],
        indices: &[u16],
    ) -> Result<Self, GraphicsError> {
        Ok(Self {
            vertices: gfx.create_vertex_buffer(cast_slice(vertices))?,
            uvs: gfx.create_vertex_buffer(cast_slice(uvs))?,
            indices: gfx.create_index_buffer(indices)?,
            index_count: indices.len() as u32,
        })
    }

    fn destroy(&self, gfx: &mut dyn GraphicsApi) {
        gfx.delete_buffer(self.vertices);
        gfx.delete_buffer(self.uvs);
        gfx.delete_buffer(self.indices);
    }
}

/// Owns the distortion programs and the per-eye mesh buffers. Grids are
/// built once at construction; a screen geometry change needs a rebuild.
pub struct Distorter {
    passthrough_program: ProgramId,
    warp_program: ProgramId,
    left: MeshBuffers,
    right: MeshBuffers,
    quad: MeshBuffers,
    technique: DistortionTechnique,
    enabled: bool,
    lens_center_offset: f32,
    warp_param: [f32; 4],
}

impl Distorter {
    pub fn new(
        gfx: &mut dyn GraphicsApi,
        screen_w: u32,
        screen_h: u32,
        orientation: SurfaceOrientation,
        lens: &LensParameters,
    ) -> Result<Self, GraphicsError> {
        let passthrough_program = gfx.create_program(VERTEX_SHADER, PASSTHROUGH_FRAGMENT_SHADER)?;
        let warp_program = gfx.create_program(VERTEX_SHADER, WARP_FRAGMENT_SHADER)?;

        let left_grid = DistortionGrid::new(
            GRID_RESOLUTION,
            GRID_RESOLUTION,
            screen_w,
            screen_h,
            orientation,
            Eye::Left,
            lens,
        );
        let right_grid = DistortionGrid::new(
            GRID_RESOLUTION,
            GRID_RESOLUTION,
            screen_w,
            screen_h,
            orientation,
            Eye::Right,
            lens,
        );

        let left = MeshBuffers::upload(gfx, left_grid.vertices(), left_grid.uvs(), left_grid.indices())?;
        let right =
            MeshBuffers::upload(gfx, right_grid.vertices(), right_grid.uvs(), right_grid.indices())?;
        let quad = MeshBuffers::upload(
            gfx,
            left_grid.quad_vertices(),
            left_grid.quad_uvs(),
            left_grid.quad_indices(),
        )?;

        Ok(Self {
            passthrough_program,
            warp_program,
            left,
            right,
            quad,
            technique: DistortionTechnique::Vertex,
            enabled: true,
            lens_center_offset: lens.lens_center_offset(),
            warp_param: lens.k,
        })
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_technique(&mut self, technique: DistortionTechnique) {
        self.technique = technique;
    }

    pub fn technique(&self) -> DistortionTechnique {
        self.technique
    }

    /// Draw the distortion pass for one eye, sampling `texture`. The caller
    /// has already bound the output framebuffer and viewport.
    pub fn render(&self, gfx: &mut dyn GraphicsApi, eye: Eye, texture: TextureId) {
        if !self.enabled {
            self.draw(gfx, self.passthrough_program, &self.quad, IndexedPrimitive::TriangleStrip, texture);
            return;
        }

        match self.technique {
            DistortionTechnique::Vertex => {
                let mesh = match eye {
                    Eye::Left => &self.left,
                    Eye::Right | Eye::Single => &self.right,
                };
                self.draw(gfx, self.passthrough_program, mesh, IndexedPrimitive::Triangles, texture);
            }
            DistortionTechnique::Fragment => {
                let lens_center = match eye {
                    Eye::Left => [self.lens_center_offset, 0.0],
                    Eye::Right | Eye::Single => [-self.lens_center_offset, 0.0],
                };
                gfx.set_uniform_vec2(self.warp_program, "u_lens_center", lens_center);
                gfx.set_uniform_vec4(self.warp_program, "u_warp_param", self.warp_param);
                self.draw(gfx, self.warp_program, &self.quad, IndexedPrimitive::TriangleStrip, texture);
            }
        }
    }

    fn draw(
        &self,
        gfx: &mut dyn GraphicsApi,
        program: ProgramId,
        mesh: &MeshBuffers,
        primitive: IndexedPrimitive,
        texture: TextureId,
    ) {
        gfx.use_program(program);
        gfx.bind_attribute_buffer(program, "a_position", mesh.vertices, 3);
        gfx.bind_attribute_buffer(program, "a_uv", mesh.uvs, 2);
        gfx.bind_texture(0, texture);
        gfx.draw_indexed(primitive, mesh.indices, mesh.index_count);
    }

    pub fn destroy(&self, gfx: &mut dyn GraphicsApi) {
        gfx.delete_program(self.passthrough_program);
        gfx.delete_program(self.warp_program);
        self.left.destroy(gfx);
        self.right.destroy(gfx);
        self.quad.destroy(gfx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::testing::RecordingGraphics;
    use crate::lens::DeviceModel;

    fn distorter(gfx: &mut RecordingGraphics) -> Distorter {
        let lens = DeviceModel::GalaxyS4.lens_parameters();
        Distorter::new(gfx, 2560, 1440, SurfaceOrientation::Landscape, &lens).unwrap()
    }

    #[test]
    fn uploads_buffers_once_per_eye_plus_quad() {
        let mut gfx = RecordingGraphics::new();
        let d = distorter(&mut gfx);
        assert_eq!(gfx.live_programs, 2);
        // Two grids and the shared quad, two vertex streams plus indices each.
        assert_eq!(gfx.live_buffers, 9);

        d.destroy(&mut gfx);
        assert_eq!(gfx.live_programs, 0);
        assert_eq!(gfx.live_buffers, 0);
    }

    #[test]
    fn vertex_technique_draws_the_grid() {
        let mut gfx = RecordingGraphics::new();
        let d = distorter(&mut gfx);
        gfx.ops.clear();

        d.render(&mut gfx, Eye::Left, TextureId(99));
        let cells = (GRID_RESOLUTION - 1) * (GRID_RESOLUTION - 1);
        let expected = format!("count {}", cells * 6);
        assert!(gfx.ops.iter().any(|op| op.starts_with("draw_indexed triangles") && op.ends_with(&expected)));
    }

    #[test]
    fn eyes_use_distinct_buffers() {
        let mut gfx = RecordingGraphics::new();
        let d = distorter(&mut gfx);

        gfx.ops.clear();
        d.render(&mut gfx, Eye::Left, TextureId(1));
        let left_ops = gfx.ops.clone();

        gfx.ops.clear();
        d.render(&mut gfx, Eye::Right, TextureId(1));
        assert_ne!(left_ops, gfx.ops);
    }

    #[test]
    fn bypass_draws_the_quad_strip() {
        let mut gfx = RecordingGraphics::new();
        let mut d = distorter(&mut gfx);
        d.set_enabled(false);
        gfx.ops.clear();

        d.render(&mut gfx, Eye::Left, TextureId(1));
        assert!(gfx.ops.iter().any(|op| op.starts_with("draw_indexed strip") && op.ends_with("count 4")));
    }

    #[test]
    fn fragment_technique_sets_warp_uniforms() {
        let mut gfx = RecordingGraphics::new();
        let mut d = distorter(&mut gfx);
        d.set_technique(DistortionTechnique::Fragment);
        gfx.ops.clear();

        d.render(&mut gfx, Eye::Left, TextureId(1));
        assert!(gfx.ops.iter().any(|op| op.contains("u_lens_center")));
        assert!(gfx.ops.iter().any(|op| op.contains("u_warp_param")));
        assert!(gfx.ops.iter().any(|op| op.starts_with("draw_indexed strip")));
    }

    #[test]
    fn failed_program_creation_propagates() {
        let mut gfx = RecordingGraphics::new();
        gfx.fail_next_creation = true;
        let lens = DeviceModel::GalaxyS4.lens_parameters();
        assert!(Distorter::new(&mut gfx, 2560, 1440, SurfaceOrientation::Landscape, &lens).is_err());
    }
}
