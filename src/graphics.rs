//! Graphics capability used by the distortion and compositing passes.
//!
//! The compositor never talks to a concrete API; everything it needs is
//! behind [`GraphicsApi`]. Resource creation returns `Result` so a failed
//! shader compile or allocation surfaces as an error instead of a silent
//! zero handle.

use crate::error::GraphicsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

/// Index layout of a draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedPrimitive {
    Triangles,
    TriangleStrip,
}

/// Render target description for an off-screen eye or compose buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub with_depth: bool,
}

/// An allocated off-screen target: the framebuffer plus the color texture
/// the distortion pass samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub framebuffer: FramebufferId,
    pub color: TextureId,
}

pub trait GraphicsApi {
    fn create_program(&mut self, vertex_src: &str, fragment_src: &str)
        -> Result<ProgramId, GraphicsError>;
    fn delete_program(&mut self, program: ProgramId);

    /// Upload an immutable vertex buffer from raw bytes.
    fn create_vertex_buffer(&mut self, data: &[u8]) -> Result<BufferId, GraphicsError>;
    fn create_index_buffer(&mut self, data: &[u16]) -> Result<BufferId, GraphicsError>;
    fn delete_buffer(&mut self, buffer: BufferId);

    fn create_render_target(&mut self, desc: RenderTargetDesc)
        -> Result<RenderTarget, GraphicsError>;
    fn delete_render_target(&mut self, target: RenderTarget);

    /// Bind an off-screen target, or the window surface when `None`.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);
    fn viewport(&mut self, x: i32, y: i32, w: i32, h: i32);
    fn scissor(&mut self, x: i32, y: i32, w: i32, h: i32);
    fn clear(&mut self, r: f32, g: f32, b: f32, a: f32);

    fn use_program(&mut self, program: ProgramId);
    fn bind_texture(&mut self, unit: u32, texture: TextureId);
    fn set_uniform_mat4(&mut self, program: ProgramId, name: &str, value: &[f32; 16]);
    fn set_uniform_vec2(&mut self, program: ProgramId, name: &str, value: [f32; 2]);
    fn set_uniform_vec4(&mut self, program: ProgramId, name: &str, value: [f32; 4]);

    /// Bind `buffer` to the named vertex attribute with `components` floats
    /// per vertex.
    fn bind_attribute_buffer(
        &mut self,
        program: ProgramId,
        name: &str,
        buffer: BufferId,
        components: u32,
    );

    fn draw_indexed(&mut self, primitive: IndexedPrimitive, indices: BufferId, count: u32);

    /// Finish all submitted work for the current target.
    fn flush(&mut self);
}
