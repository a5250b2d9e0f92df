//! Error types for the stereo pipeline.

use thiserror::Error;

/// Failures surfaced to the host render loop.
#[derive(Debug, Error)]
pub enum VrError {
    #[error("invalid lens geometry: {0}")]
    InvalidLensGeometry(&'static str),
    #[error("graphics resource failure: {0}")]
    Graphics(#[from] GraphicsError),
}

/// Failures from the graphics collaborator. Resource creation reports these
/// explicitly instead of leaving a dead handle behind.
#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("shader compile/link failed: {log}")]
    ShaderCompile { log: String },
    #[error("failed to allocate {resource}")]
    Allocation { resource: &'static str },
}

/// Failures decoding a tracker wire packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },
}
