//! Visibility and command update kernels.
//!
//! Both kernels exist twice: as WGSL compute shaders dispatched in gpu mode and
//! as reference implementations over the buffer mirrors in cpu mode.

use glam::{Mat4, Vec3};
use herd_types::DepthConvention;
use serde::Serialize;

use crate::{
    parameter::{LodGroupData, ProfileData, ProfileFlags},
    util::frustum::ShaderFrustum,
};

mod cpu;
mod gpu;

pub use cpu::*;
pub use gpu::*;

/// Threads per workgroup of every herd kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// Most texels per axis the occlusion test reads.
pub const MAX_OCCLUSION_SAMPLES: u32 = 4;

bitflags::bitflags! {
    /// Kernel permutation of a group, resolved every frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct PipelineVariant: u32 {
        const LOD = 1 << 0;
        const CROSSFADE = 1 << 1;
        const CROSSFADE_ANIMATED = 1 << 2;
        const SHADOWS = 1 << 3;
        const FRUSTUM = 1 << 4;
        const OCCLUSION = 1 << 5;
    }
}

impl PipelineVariant {
    pub fn resolve(profile: &ProfileData, lod_group: &LodGroupData, hi_z_ready: bool) -> Self {
        let flags = profile.flags();
        let has_lod = lod_group.lod_count() > 1;
        let crossfade = has_lod && flags.contains(ProfileFlags::LOD_CROSSFADE);
        let animated = flags.contains(ProfileFlags::ANIMATE_CROSSFADE);

        let mut variant = Self::empty();
        variant.set(Self::LOD, has_lod);
        variant.set(Self::CROSSFADE, crossfade && !animated);
        variant.set(Self::CROSSFADE_ANIMATED, crossfade && animated);
        variant.set(
            Self::SHADOWS,
            flags.contains(ProfileFlags::SHADOW_CASTING) && lod_group.descriptor.casts_shadows,
        );
        variant.set(Self::FRUSTUM, flags.contains(ProfileFlags::FRUSTUM_CULLING));
        variant.set(
            Self::OCCLUSION,
            hi_z_ready && flags.contains(ProfileFlags::OCCLUSION_CULLING),
        );
        variant
    }

    /// Cross-fades only exist on top of LOD selection, and only one kind at a time.
    pub fn is_valid(self) -> bool {
        let crossfades = self & (Self::CROSSFADE | Self::CROSSFADE_ANIMATED);
        match crossfades.bits().count_ones() {
            0 => true,
            1 => self.contains(Self::LOD),
            _ => false,
        }
    }

    /// Every valid permutation, the table compiled up front in gpu mode.
    pub fn permutations() -> impl Iterator<Item = Self> {
        (0..=Self::all().bits())
            .map(Self::from_bits_truncate)
            .filter(|v| v.is_valid())
    }

    pub fn shader_config(self) -> VariantConfig {
        VariantConfig {
            lod: self.contains(Self::LOD),
            crossfade: self.contains(Self::CROSSFADE),
            crossfade_animated: self.contains(Self::CROSSFADE_ANIMATED),
            shadows: self.contains(Self::SHADOWS),
            frustum: self.contains(Self::FRUSTUM),
            occlusion: self.contains(Self::OCCLUSION),
            workgroup_size: WORKGROUP_SIZE,
            max_occlusion_samples: MAX_OCCLUSION_SAMPLES,
        }
    }
}

/// Template arguments of `visibility.wgsl`.
#[derive(Debug, Copy, Clone, Serialize)]
pub struct VariantConfig {
    pub lod: bool,
    pub crossfade: bool,
    pub crossfade_animated: bool,
    pub shadows: bool,
    pub frustum: bool,
    pub occlusion: bool,
    pub workgroup_size: u32,
    pub max_occlusion_samples: u32,
}

/// Template arguments of the kernels without permutations.
#[derive(Debug, Copy, Clone, Serialize)]
pub struct KernelConfig {
    pub workgroup_size: u32,
}

/// Camera values the visibility kernel reads, already in the space of the
/// transforms it runs over.
#[derive(Debug, Copy, Clone)]
pub struct CullingCamera {
    pub view_proj: [Mat4; 2],
    pub frustums: [ShaderFrustum; 2],
    pub eye_count: u32,
    pub position: Vec3,
    /// `tan(vfov / 2)`, zero for orthographic cameras.
    pub tan_half_fov: f32,
    /// View height of orthographic cameras, zero otherwise.
    pub ortho_height: f32,
    pub depth: DepthConvention,
    pub delta_time: f32,
}

impl CullingCamera {
    /// Screen relative height of a sphere, before the profile's LOD bias.
    pub fn relative_height(&self, distance: f32, radius: f32) -> f32 {
        if self.ortho_height > 0.0 {
            2.0 * radius / self.ortho_height
        } else {
            2.0 * radius / (2.0 * distance * self.tan_half_fov).max(1e-6)
        }
    }
}

/// Where one group's dispatch reads and writes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GroupDispatch {
    pub variant: PipelineVariant,
    /// Start of the group's counters in the camera's visibility buffer.
    pub visibility_offset: u32,
    pub lod_count: u32,
    pub buffer_size: u32,
    pub active_count: u32,
    pub profile_start: u32,
    pub lod_group_start: u32,
}

impl GroupDispatch {
    /// Index of the counter of `(pass, lod)` relative to the group's region.
    pub fn bucket(&self, pass: u32, lod: u32) -> u32 {
        pass * self.lod_count + lod
    }
}

#[cfg(test)]
mod test {
    use herd_types::{
        Bounds, InstancingProfile, LodGroupDescriptor, LodGroupId, LodLevel, ProfileId, SubMeshDraw,
    };

    use super::PipelineVariant;
    use crate::{
        parameter::{LodGroupData, ParameterBuffer, ProfileData},
        ModeData,
    };

    fn lod_group(lods: usize, casts_shadows: bool, parameters: &mut ParameterBuffer) -> LodGroupData {
        LodGroupData::new(
            LodGroupDescriptor {
                id: LodGroupId(lods as u64),
                bounds: Bounds::default(),
                lods: (0..lods)
                    .map(|l| LodLevel {
                        screen_relative_height: 0.5 / (l + 1) as f32,
                        submeshes: vec![SubMeshDraw::default()],
                    })
                    .collect(),
                shadow_lod_map: Vec::new(),
                has_object_motion: false,
                casts_shadows,
            },
            parameters,
        )
    }

    #[test]
    fn permutation_table() {
        let all: Vec<_> = PipelineVariant::permutations().collect();
        assert_eq!(all.len(), 32);
        assert!(all.iter().all(|v| v.is_valid()));
        assert!(!PipelineVariant::CROSSFADE.is_valid());
        assert!(!(PipelineVariant::LOD | PipelineVariant::CROSSFADE | PipelineVariant::CROSSFADE_ANIMATED).is_valid());
    }

    #[test]
    fn resolution() {
        let mut parameters = ParameterBuffer::new(ModeData::Cpu(()));
        let profile = ProfileData::new(
            ProfileId(0),
            InstancingProfile {
                lod_crossfade: true,
                animate_crossfade: true,
                ..Default::default()
            },
            &mut parameters,
        );

        let single = lod_group(1, false, &mut parameters);
        let variant = PipelineVariant::resolve(&profile, &single, false);
        assert_eq!(variant, PipelineVariant::FRUSTUM);

        let multi = lod_group(3, true, &mut parameters);
        let variant = PipelineVariant::resolve(&profile, &multi, true);
        assert_eq!(
            variant,
            PipelineVariant::LOD
                | PipelineVariant::CROSSFADE_ANIMATED
                | PipelineVariant::SHADOWS
                | PipelineVariant::FRUSTUM
                | PipelineVariant::OCCLUSION
        );
        assert!(variant.is_valid());
    }
}
