use herd_types::{CameraId, DescriptorError, LodGroupId, OwnerId, ProfileId};
use thiserror::Error;
use wgpu::BufferAsyncError;

use crate::{source::RenderSourceKey, util::typedefs::SsoString};

/// Enum mapping to each of the device limits herd checks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LimitType {
    StorageBuffersPerShaderStages,
    StorageTexturesPerShaderStages,
    UniformBuffersPerShaderStages,
    MaxStorageBufferBindingSize,
    MaxComputeInvocationsPerWorkgroup,
    MaxComputeWorkgroupSizeX,
    MaxComputeWorkgroupsPerDimension,
}

/// Reason why herd failed to initialize.
#[derive(Error, Debug)]
pub enum HerdInitializationError {
    #[error("No supported adapter found")]
    MissingAdapter,
    #[error("Adapter {name} does not support compute shaders")]
    MissingComputeSupport { name: String },
    #[error("Adapter {name} uses the {backend:?} backend, which can't run herd's kernels")]
    UnsupportedBackend { name: String, backend: wgpu::Backend },
    #[error("The device limit of {:?} is {} but herd requires at least {}", ty, device_limit, required_limit)]
    LowDeviceLimit {
        ty: LimitType,
        device_limit: u64,
        required_limit: u64,
    },
    #[error("Requesting a device failed")]
    RequestDeviceFailed(#[source] wgpu::RequestDeviceError),
    #[error("Failed to preprocess shader {name}")]
    ShaderPreprocessing {
        name: SsoString,
        #[source]
        source: handlebars::RenderError,
    },
}

/// Failures of caller facing operations.
///
/// Nothing on the per-frame path returns these for configuration problems,
/// those are logged and the offending group is skipped.
#[derive(Error, Debug)]
pub enum HerdError {
    #[error("Profile {0:?} is not registered")]
    UnknownProfile(ProfileId),
    #[error("LOD group {0:?} is not registered")]
    UnknownLodGroup(LodGroupId),
    #[error("Render source {0:?} does not exist")]
    UnknownRenderSource(RenderSourceKey),
    #[error("Owner {owner:?} already registered a render source for this group")]
    DuplicateRenderSource { owner: OwnerId },
    #[error("Camera {0:?} does not exist")]
    UnknownCamera(CameraId),
    #[error("Camera {0:?} already exists")]
    DuplicateCamera(CameraId),
    #[error("Instance count {count} is larger than the render source's buffer size {buffer_size}")]
    InstanceCountTooLarge { count: u32, buffer_size: u32 },
    #[error("Source range {start}..{end} is out of bounds of the {len} given transforms")]
    SourceRangeOutOfBounds { start: usize, end: usize, len: usize },
    #[error("Writing {count} transforms at offset {offset} runs past the largest possible buffer")]
    DestinationRangeTooLarge { offset: u32, count: usize },
    #[error("Invalid LOD group descriptor")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("Failed to encode uniform data")]
    UniformEncoding(#[from] encase::internal::Error),
}

/// Reasons a readback delivered no data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadbackError {
    #[error("Buffer was released while the readback was in flight")]
    Invalidated,
    #[error("Mapping the staging buffer failed")]
    MapFailed(#[from] BufferAsyncError),
    #[error("Readback returned {actual} elements but the mirror holds {expected}, write back skipped")]
    SizeMismatch { expected: usize, actual: usize },
}
