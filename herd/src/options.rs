use herd_types::{BufferMode, DepthConvention, Handedness, HostPipeline, OcclusionCullingMode, StereoMode};
use serde::{Deserialize, Serialize};

use crate::RendererMode;

/// Engine wide configuration, fixed for the lifetime of a [`Herd`](crate::Herd).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HerdOptions {
    pub buffer_mode: BufferMode,
    /// `Auto` is resolved once at start-up, see [`resolve_occlusion_mode`](Self::resolve_occlusion_mode).
    pub occlusion_mode: OcclusionCullingMode,
    pub host_pipeline: HostPipeline,
    pub stereo: StereoMode,
    pub depth_convention: DepthConvention,
    /// The host renders motion vectors and needs last frame's transforms.
    pub motion_vectors: bool,
    pub handedness: Handedness,
}

impl Default for HerdOptions {
    fn default() -> Self {
        Self {
            buffer_mode: BufferMode::Default,
            occlusion_mode: OcclusionCullingMode::Auto,
            host_pipeline: HostPipeline::Forward,
            stereo: StereoMode::None,
            depth_convention: DepthConvention::Reversed,
            motion_vectors: false,
            handedness: Handedness::Left,
        }
    }
}

impl HerdOptions {
    /// The concrete occlusion strategy for `mode`.
    pub fn resolve_occlusion_mode(&self, mode: RendererMode) -> OcclusionCullingMode {
        if self.occlusion_mode != OcclusionCullingMode::Auto {
            return self.occlusion_mode;
        }
        if self.host_pipeline == HostPipeline::RenderGraph {
            OcclusionCullingMode::RenderGraphPass
        } else if self.stereo == StereoMode::SinglePassInstanced {
            OcclusionCullingMode::CommandBufferExecutedOnEndRendering
        } else if mode == RendererMode::CpuPowered {
            OcclusionCullingMode::DirectTextureAccess
        } else {
            OcclusionCullingMode::CommandBufferAddedToCamera
        }
    }
}
