//! Stereo lens-distortion pipeline and head-tracking fusion for mobile HMD
//! rendering.
//!
//! The crate splits one screen into a left/right eye pair, counter-distorts
//! each half for the headset lenses, and tracks head orientation from either
//! the handset's own sensors or an external tracker device. The host render
//! loop talks to [`compositor::StereoCompositor`]; everything below it
//! (lens model, distortion meshes, fusion engines, the sampling service) is
//! usable on its own.

pub mod camera;
pub mod compositor;
pub mod distorter;
pub mod error;
pub mod fusion;
pub mod graphics;
pub mod lens;
pub mod mesh;
#[cfg(target_os = "android")]
pub mod ndk_sensors;
pub mod scene;
pub mod service;

pub use camera::StereoCamera;
pub use compositor::{StereoCompositor, VrParams};
pub use distorter::{Distorter, DistortionTechnique};
pub use error::{GraphicsError, PacketError, VrError};
pub use fusion::{OrientationSource, SensorType};
pub use graphics::GraphicsApi;
pub use lens::{DeviceModel, LensParameters};
pub use mesh::{DistortionGrid, Eye, SurfaceOrientation};
pub use scene::{SceneRenderer, SceneType};
pub use service::OrientationService;
