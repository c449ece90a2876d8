//! GPU driven instancing: per camera culling, LOD selection and indirect draw
//! arguments for large numbers of instances.
//!
//! Callers register [`InstancingProfile`](types::InstancingProfile)s and
//! [`LodGroupDescriptor`](types::LodGroupDescriptor)s, add render sources
//! holding instance transforms, then call [`Herd::update_camera_data`] once
//! per camera per frame. The resulting command buffer of every camera feeds
//! the host's `draw_indexed_indirect` calls, see [`CameraData::indirect_draws`].
//!
//! Everything runs either on the GPU through wgpu compute shaders or, when the
//! adapter can't run them, as reference kernels on the CPU. See [`RendererMode`].

pub mod buffer;
mod camera;
pub mod culling;
mod error;
mod herd;
mod mode;
pub mod occlusion;
mod options;
pub mod parameter;
mod setup;
mod shader;
pub mod source;
pub mod transform;

/// Utilities shared by the kernels.
pub mod util {
    pub mod bind_merge;
    pub mod frustum;
    pub mod math;
    pub mod typedefs;
}

pub use camera::*;
pub use error::*;
pub use herd::Herd;
pub use mode::*;
pub use options::*;
pub use setup::*;
pub use shader::ShaderPreProcessor;

/// Reexport of [`herd_types`] with glam and wgpu's handles.
pub mod types {
    pub use glam;
    pub use herd_types::*;
    pub use wgpu::{Buffer, BufferAddress, TextureView};
}
