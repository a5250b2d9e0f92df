//! Pre-warped distortion mesh generation.
//!
//! A `DistortionGrid` is a regular grid of vertices covering the NDC quad
//! [-1,1]^2 whose UVs are pushed through the inverse lens warp, so that
//! sampling the flat eye texture at those UVs yields a barrel-distorted image
//! that looks correct through the physical lens. Grids are built once per eye
//! at engine init and regenerated only when the screen geometry or device
//! model changes.

use glam::{Vec2, Vec3};

use crate::lens::LensParameters;

/// Which half of the display / which camera offset a draw sequence targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
    /// Same content distorted into both halves (flat-content passthrough).
    Single,
}

/// Physical orientation of the output surface. Decides the split axis and the
/// axis swap in the warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceOrientation {
    Portrait,
    Landscape,
}

/// Grid resolution used by the distortion pass. Fixed, no dynamic LOD.
pub const GRID_RESOLUTION: usize = 40;

/// Pre-warped mesh for one eye, plus a flat fallback quad for bypass
/// rendering. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionGrid {
    vertices: Vec<Vec3>,
    uvs: Vec<Vec2>,
    indices: Vec<u16>,
    quad_vertices: Vec<Vec3>,
    quad_uvs: Vec<Vec2>,
    quad_indices: Vec<u16>,
}

impl DistortionGrid {
    /// Build the warped grid for `eye` on a `screen_w` x `screen_h` surface.
    ///
    /// `cols`/`rows` must be at least 2; the lens parameters must have been
    /// validated (zero screen size divides by zero here).
    pub fn new(
        cols: usize,
        rows: usize,
        screen_w: u32,
        screen_h: u32,
        orientation: SurfaceOrientation,
        eye: Eye,
        lens: &LensParameters,
    ) -> Self {
        let m = cols;
        let n = rows;

        let mut vertices = Vec::with_capacity(m * n);
        for j in 0..n {
            let y = -1.0 + 2.0 * j as f32 / (n - 1) as f32;
            for i in 0..m {
                let x = -1.0 + 2.0 * i as f32 / (m - 1) as f32;
                vertices.push(Vec3::new(x, y, 0.0));
            }
        }

        // Each lens covers half the panel; the UV warp happens in a space
        // where that half is square.
        let aspect_ratio = screen_h as f32 / (screen_w as f32 / 2.0);
        let scale_in = Vec2::new(1.0, aspect_ratio);
        let scale = Vec2::new(0.5, 0.5 / aspect_ratio);

        let lens_center_offset = match eye {
            Eye::Left => lens.lens_center_offset(),
            Eye::Right | Eye::Single => -lens.lens_center_offset(),
        };
        let lens_center = Vec2::new(lens_center_offset, 0.0);
        let edge_scale = lens.distortion_scale_at_edge();

        let mut uvs = Vec::with_capacity(m * n);
        for v in &vertices {
            let vertex = match orientation {
                SurfaceOrientation::Portrait => Vec2::new(-v.y, v.x),
                SurfaceOrientation::Landscape => Vec2::new(v.x, v.y),
            };
            let theta = (vertex - lens_center) * scale_in;
            let r_sq = theta.x * theta.x + theta.y * theta.y;
            let rvector = theta * lens.distortion_scale_factor(r_sq) / edge_scale;
            uvs.push((rvector + lens_center) * scale + Vec2::new(0.5, 0.5));
        }

        let mut indices = Vec::with_capacity((m - 1) * (n - 1) * 6);
        for j in 0..n - 1 {
            for i in 0..m - 1 {
                indices.push((i + j * m) as u16);
                indices.push((i + 1 + j * m) as u16);
                indices.push((i + (j + 1) * m) as u16);
                indices.push((i + 1 + j * m) as u16);
                indices.push((i + 1 + (j + 1) * m) as u16);
                indices.push((i + (j + 1) * m) as u16);
            }
        }

        let quad_vertices = vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ];
        let quad_uvs = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];
        // Triangle-strip order.
        let quad_indices = vec![0, 1, 3, 2];

        Self {
            vertices,
            uvs,
            indices,
            quad_vertices,
            quad_uvs,
            quad_indices,
        }
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn uvs(&self) -> &[Vec2] {
        &self.uvs
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn quad_vertices(&self) -> &[Vec3] {
        &self.quad_vertices
    }

    pub fn quad_uvs(&self) -> &[Vec2] {
        &self.quad_uvs
    }

    /// Triangle-strip indices for the bypass quad.
    pub fn quad_indices(&self) -> &[u16] {
        &self.quad_indices
    }
}
