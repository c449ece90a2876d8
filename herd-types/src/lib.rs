//! Type declarations for the herd instanced visibility crate.
//!
//! This is reexported in the herd crate proper and includes all the "surface"
//! api arguments: identities, descriptors handed in by the authoring side, and
//! the records the GPU reads and writes.

use bytemuck::{Pod, Zeroable};
/// Reexport of the glam version herd is using.
pub use glam;
use glam::{Mat4, Vec3, Vec3A};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest amount of LOD levels a single LOD group may carry.
pub const MAX_LOD: usize = 8;

macro_rules! declare_id {
    ($($(#[$outer:meta])* $name:ident),* $(,)?) => {$(
        $(#[$outer])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);
    )*};
}

declare_id!(
    /// Identity of whoever registers instances: a spawner, a terrain patch, a scene object.
    OwnerId,
    /// Identity of the prototype (mesh + material set) being instanced.
    PrototypeId,
    /// Identity of an [`InstancingProfile`].
    ProfileId,
    /// Identity of a [`LodGroupDescriptor`].
    LodGroupId,
    /// Identity of a camera rendering instances.
    CameraId,
);

macro_rules! changeable_struct {
    ($(#[$outer:meta])* pub struct $name:ident <- $name_change:ident { $($(#[$inner:meta])* $field_vis:vis $field_name:ident : $field_type:ty),* $(,)? } ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $(
                $(#[$inner])* $field_vis $field_name : $field_type
            ),*
        }
        impl $name {
            pub fn update_from_changes(&mut self, change: $name_change) {
                $(
                    if let Some(inner) = change.$field_name {
                        self.$field_name = inner;
                    }
                );*
            }
        }
        #[doc = concat!("Describes a modification to a ", stringify!($name), ".")]
        #[derive(Debug, Default, Clone)]
        pub struct $name_change {
            $(
                $field_vis $field_name : Option<$field_type>
            ),*
        }
    };
}

/// The handedness of the coordinate system in use.
///
/// For example
/// +X right, +Y up, +Z _into_ the screen is left handed.
/// +X right, +Y up, +Z _out of_ the screen is right handed.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handedness {
    #[default]
    Left,
    Right,
}

/// Describes how the camera should look at the scene.
#[derive(Debug, Default, Copy, Clone)]
pub struct Camera {
    pub projection: CameraProjection,
    /// View matrix
    pub view: Mat4,
}

/// Describes how the world should be projected into the camera.
#[derive(Debug, Copy, Clone)]
pub enum CameraProjection {
    Orthographic {
        /// Size assumes the location is at the center of the camera area.
        size: Vec3A,
    },
    Perspective {
        /// Vertical field of view in degrees.
        vfov: f32,
        /// Near plane distance. All projection uses a infinite far plane.
        near: f32,
    },
    Raw(Mat4),
}

impl Default for CameraProjection {
    fn default() -> Self {
        Self::Perspective { vfov: 60.0, near: 0.1 }
    }
}

/// How the host renders multiple eyes.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StereoMode {
    #[default]
    None,
    /// Each eye is its own camera.
    MultiPass,
    /// Both eyes are drawn by a single instanced draw, doubling instance counts.
    SinglePassInstanced,
}

impl StereoMode {
    pub fn eye_count(self) -> u32 {
        match self {
            Self::SinglePassInstanced => 2,
            Self::None | Self::MultiPass => 1,
        }
    }

    /// Factor applied to every visible count when writing indirect arguments.
    pub fn instance_count_multiplier(self) -> u32 {
        self.eye_count()
    }
}

/// Where transform data lives.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferMode {
    /// One transform buffer per render source group, shared by every camera.
    #[default]
    Default,
    /// Every camera gets a camera-relative copy of the transforms.
    CameraBased,
}

/// Strategy used to get the camera's depth into the Hi-Z pyramid.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcclusionCullingMode {
    /// Picked at initialization from the host pipeline and stereo layout.
    #[default]
    Auto,
    /// Dispatch against the live depth texture during the camera update.
    DirectTextureAccess,
    /// Record once, replayed by the host at a fixed point of the camera's pipeline.
    CommandBufferAddedToCamera,
    /// Rebuilt and executed at the end of every frame.
    CommandBufferExecutedOnEndRendering,
    /// Handed to the host's render graph as a compute pass.
    RenderGraphPass,
}

/// The kind of pipeline hosting herd.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostPipeline {
    #[default]
    Forward,
    /// Pipelines that only allow work through their render graph.
    RenderGraph,
}

/// Depth value convention of the host's depth buffer.
///
/// The Hi-Z pyramid always keeps the farthest depth of each 2x2 block so an
/// occluder can never hide something it only partially covers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthConvention {
    /// 0.0 at the near plane, 1.0 at the far plane. Farthest is the max.
    Standard,
    /// 1.0 at the near plane, 0.0 at the far plane. Farthest is the min.
    #[default]
    Reversed,
}

impl DepthConvention {
    /// Depth of an empty (cleared) depth buffer.
    pub fn far_value(self) -> f32 {
        match self {
            Self::Standard => 1.0,
            Self::Reversed => 0.0,
        }
    }

    pub fn farthest(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Standard => a.max(b),
            Self::Reversed => a.min(b),
        }
    }

    pub fn nearest(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Standard => a.min(b),
            Self::Reversed => a.max(b),
        }
    }

    /// True if `a` lies strictly behind `b`.
    pub fn is_farther(self, a: f32, b: f32) -> bool {
        match self {
            Self::Standard => a > b,
            Self::Reversed => a < b,
        }
    }
}

/// Which set of draws an entry belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DrawPass {
    Main = 0,
    Shadow = 1,
}

changeable_struct! {
    /// Culling and LOD settings shared by every group referencing the profile.
    pub struct InstancingProfile <- InstancingProfileChange {
        pub frustum_culling: bool,
        pub occlusion_culling: bool,
        /// Extra radius added to bounds when testing against the frustum.
        pub frustum_offset: f32,
        /// Depth bias applied to the occlusion test.
        pub occlusion_offset: f32,
        /// Amount of mip levels the occlusion test samples below the ideal one.
        pub occlusion_accuracy: u32,
        /// Instances closer than this are never frustum or occlusion culled.
        pub min_culling_distance: f32,
        pub max_distance: f32,
        pub lod_bias: f32,
        pub shadow_casting: bool,
        pub shadow_distance: f32,
        /// Apply frustum and occlusion culling to the shadow pass too.
        pub cull_shadows: bool,
        pub lod_crossfade: bool,
        pub animate_crossfade: bool,
        /// Fraction of a LOD threshold over which two levels blend.
        pub crossfade_width: f32,
        /// Seconds an animated cross-fade takes.
        pub crossfade_duration: f32,
    }
}

impl Default for InstancingProfile {
    fn default() -> Self {
        Self {
            frustum_culling: true,
            occlusion_culling: true,
            frustum_offset: 0.2,
            occlusion_offset: 0.0,
            occlusion_accuracy: 1,
            min_culling_distance: 0.0,
            max_distance: 500.0,
            lod_bias: 1.0,
            shadow_casting: true,
            shadow_distance: 150.0,
            cull_shadows: false,
            lod_crossfade: false,
            animate_crossfade: false,
            crossfade_width: 0.1,
            crossfade_duration: 0.5,
        }
    }
}

/// Axis aligned bounds in the prototype's local space.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub center: Vec3,
    pub extents: Vec3,
}

impl Bounds {
    pub fn sphere_radius(&self) -> f32 {
        self.extents.length()
    }
}

/// One indexed draw within a LOD level.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMeshDraw {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodLevel {
    /// Screen relative height above which this level is used.
    pub screen_relative_height: f32,
    pub submeshes: Vec<SubMeshDraw>,
}

/// Geometry layout of an instanced prototype as seen by visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodGroupDescriptor {
    pub id: LodGroupId,
    pub bounds: Bounds,
    /// Ordered from most to least detailed.
    pub lods: Vec<LodLevel>,
    /// LOD used for the shadow pass, indexed by the selected LOD.
    /// Empty means identity.
    pub shadow_lod_map: Vec<u32>,
    pub has_object_motion: bool,
    pub casts_shadows: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("LOD group {0:?} has no LOD levels")]
    NoLods(LodGroupId),
    #[error("LOD group {id:?} has {count} LOD levels, at most {MAX_LOD} are supported")]
    TooManyLods { id: LodGroupId, count: usize },
    #[error("LOD group {id:?} level {lod} has no submeshes")]
    EmptyLod { id: LodGroupId, lod: usize },
    #[error("LOD group {id:?} thresholds must be strictly decreasing, level {lod} is not")]
    UnorderedThresholds { id: LodGroupId, lod: usize },
    #[error("LOD group {id:?} shadow LOD map points at level {target} of {count}")]
    ShadowLodOutOfRange { id: LodGroupId, target: u32, count: usize },
}

impl LodGroupDescriptor {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let count = self.lods.len();
        if count == 0 {
            return Err(DescriptorError::NoLods(self.id));
        }
        if count > MAX_LOD {
            return Err(DescriptorError::TooManyLods { id: self.id, count });
        }
        for (lod, level) in self.lods.iter().enumerate() {
            if level.submeshes.is_empty() {
                return Err(DescriptorError::EmptyLod { id: self.id, lod });
            }
            if lod > 0 && level.screen_relative_height >= self.lods[lod - 1].screen_relative_height {
                return Err(DescriptorError::UnorderedThresholds { id: self.id, lod });
            }
        }
        if let Some(&target) = self.shadow_lod_map.iter().find(|&&t| t as usize >= count) {
            return Err(DescriptorError::ShadowLodOutOfRange { id: self.id, target, count });
        }
        Ok(())
    }

    pub fn lod_count(&self) -> u32 {
        self.lods.len() as u32
    }

    /// Shadow LOD for a given selected LOD.
    pub fn shadow_lod(&self, lod: u32) -> u32 {
        self.shadow_lod_map.get(lod as usize).copied().unwrap_or(lod)
    }
}

/// Everything that makes two registrations land in the same render source group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSourceGroupDescriptor {
    pub prototype: PrototypeId,
    pub profile: ProfileId,
    pub lod_group: LodGroupId,
    /// Logical sub group, lets one prototype be split by the caller.
    pub group_id: u32,
    /// Order does not matter.
    pub shader_keywords: Vec<String>,
}

/// Arguments of an indexed indirect draw, laid out as the GPU consumes them.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

bitflags::bitflags! {
    /// Bits of [`InstanceVisibility::flags`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VisibilityFlags: u32 {
        const VISIBLE = 1 << 0;
        const SHADOW = 1 << 1;
        const CROSSFADING = 1 << 2;
    }
}

/// One compacted visible instance, read by the vertex stage through `instance_index`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct InstanceVisibility {
    /// Index into the group's transform buffer.
    pub transform_index: u32,
    /// 1.0 when fully this LOD, lower while blending towards another.
    pub fade: f32,
    pub lod: u32,
    pub flags: u32,
}

impl InstanceVisibility {
    pub fn visibility_flags(&self) -> VisibilityFlags {
        VisibilityFlags::from_bits_truncate(self.flags)
    }
}

/// Per camera, per instance memory of animated cross-fades.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct InstanceLodState {
    pub lod: u32,
    pub previous_lod: u32,
    /// 1.0 once the transition has finished.
    pub fade_progress: f32,
    pub _padding: u32,
}

/// Value of [`InstanceLodState::lod`] before an instance was ever seen.
pub const LOD_STATE_UNSET: u32 = u32::MAX;
