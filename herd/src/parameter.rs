//! The shared parameter buffer.
//!
//! Profiles and LOD groups each own a fixed size record of floats inside one
//! process wide buffer. Every kernel dispatch gets the start of the records it
//! needs instead of a copy of the data.

use glam::Vec3;
use herd_types::{InstancingProfile, InstancingProfileChange, LodGroupDescriptor, LodGroupId, ProfileId, MAX_LOD};
use wgpu::BufferUsages;

use crate::{
    buffer::GpuDataBuffer,
    mode::HerdContext,
    util::{frustum::BoundingSphere, typedefs::FastHashMap},
};

pub const PROFILE_RECORD_SIZE: usize = 16;
pub const LOD_GROUP_RECORD_SIZE: usize = 32;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ProfileFlags: u32 {
        const FRUSTUM_CULLING = 1 << 0;
        const OCCLUSION_CULLING = 1 << 1;
        const SHADOW_CASTING = 1 << 2;
        const CULL_SHADOWS = 1 << 3;
        const LOD_CROSSFADE = 1 << 4;
        const ANIMATE_CROSSFADE = 1 << 5;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct LodGroupFlags: u32 {
        const HAS_OBJECT_MOTION = 1 << 0;
        const CASTS_SHADOWS = 1 << 1;
    }
}

/// Identity of a record in the parameter buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ParameterKey {
    Profile(ProfileId),
    LodGroup(LodGroupId),
}

/// Process wide float array holding every profile and LOD group record.
///
/// Records are allocated once per key and never move.
pub struct ParameterBuffer {
    buffer: GpuDataBuffer<f32>,
    starts: FastHashMap<ParameterKey, u32>,
}

impl ParameterBuffer {
    pub fn new(context: HerdContext) -> Self {
        Self {
            buffer: GpuDataBuffer::new("parameter buffer", context, BufferUsages::empty()),
            starts: FastHashMap::default(),
        }
    }

    /// Start of the record for `key`, allocating `len` floats if the key is new.
    pub fn allocate(&mut self, key: ParameterKey, len: usize) -> u32 {
        if let Some(&start) = self.starts.get(&key) {
            return start;
        }
        let start = self.buffer.len() as u32;
        self.buffer.resize(self.buffer.len() + len);
        self.starts.insert(key, start);
        log::debug!("Allocated parameter record {key:?} at {start}");
        start
    }

    pub fn start(&self, key: ParameterKey) -> Option<u32> {
        self.starts.get(&key).copied()
    }

    pub fn write(&mut self, start: u32, record: &[f32]) {
        self.buffer.set_range(start as usize, record);
    }

    pub fn record(&self, start: u32, len: usize) -> &[f32] {
        &self.buffer.data()[start as usize..start as usize + len]
    }

    pub fn data(&self) -> &[f32] {
        self.buffer.data()
    }

    pub fn buffer(&self) -> &GpuDataBuffer<f32> {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut GpuDataBuffer<f32> {
        &mut self.buffer
    }
}

/// Anything that owns a record in the [`ParameterBuffer`].
pub trait ParameterContributor {
    fn parameter_start(&self) -> u32;

    /// Writes the current record contents into `parameters`.
    fn set_parameter_buffer_data(&self, parameters: &mut ParameterBuffer);
}

/// A registered [`InstancingProfile`].
#[derive(Debug, Clone)]
pub struct ProfileData {
    pub id: ProfileId,
    pub profile: InstancingProfile,
    start: u32,
}

impl ProfileData {
    pub fn new(id: ProfileId, profile: InstancingProfile, parameters: &mut ParameterBuffer) -> Self {
        let start = parameters.allocate(ParameterKey::Profile(id), PROFILE_RECORD_SIZE);
        let data = Self { id, profile, start };
        data.set_parameter_buffer_data(parameters);
        data
    }

    pub fn update(&mut self, change: InstancingProfileChange, parameters: &mut ParameterBuffer) {
        self.profile.update_from_changes(change);
        self.set_parameter_buffer_data(parameters);
    }

    pub fn flags(&self) -> ProfileFlags {
        let p = &self.profile;
        let mut flags = ProfileFlags::empty();
        flags.set(ProfileFlags::FRUSTUM_CULLING, p.frustum_culling);
        flags.set(ProfileFlags::OCCLUSION_CULLING, p.occlusion_culling);
        flags.set(ProfileFlags::SHADOW_CASTING, p.shadow_casting);
        flags.set(ProfileFlags::CULL_SHADOWS, p.cull_shadows);
        flags.set(ProfileFlags::LOD_CROSSFADE, p.lod_crossfade);
        flags.set(ProfileFlags::ANIMATE_CROSSFADE, p.animate_crossfade);
        flags
    }

    pub fn record(&self) -> [f32; PROFILE_RECORD_SIZE] {
        let p = &self.profile;
        let mut record = [0.0; PROFILE_RECORD_SIZE];
        record[..10].copy_from_slice(&[
            p.min_culling_distance,
            p.max_distance,
            p.frustum_offset,
            p.occlusion_offset,
            p.occlusion_accuracy as f32,
            self.flags().bits() as f32,
            p.lod_bias,
            p.shadow_distance,
            p.crossfade_width,
            p.crossfade_duration,
        ]);
        record
    }
}

impl ParameterContributor for ProfileData {
    fn parameter_start(&self) -> u32 {
        self.start
    }

    fn set_parameter_buffer_data(&self, parameters: &mut ParameterBuffer) {
        parameters.write(self.start, &self.record());
    }
}

/// A registered [`LodGroupDescriptor`].
#[derive(Debug, Clone)]
pub struct LodGroupData {
    pub descriptor: LodGroupDescriptor,
    start: u32,
}

impl LodGroupData {
    pub fn new(descriptor: LodGroupDescriptor, parameters: &mut ParameterBuffer) -> Self {
        let start = parameters.allocate(ParameterKey::LodGroup(descriptor.id), LOD_GROUP_RECORD_SIZE);
        let data = Self { descriptor, start };
        data.set_parameter_buffer_data(parameters);
        data
    }

    pub fn lod_count(&self) -> u32 {
        self.descriptor.lod_count()
    }

    pub fn flags(&self) -> LodGroupFlags {
        let mut flags = LodGroupFlags::empty();
        flags.set(LodGroupFlags::HAS_OBJECT_MOTION, self.descriptor.has_object_motion);
        flags.set(LodGroupFlags::CASTS_SHADOWS, self.descriptor.casts_shadows);
        flags
    }

    pub fn record(&self) -> [f32; LOD_GROUP_RECORD_SIZE] {
        let sphere = BoundingSphere::from_bounds(&self.descriptor.bounds);
        let mut record = [0.0; LOD_GROUP_RECORD_SIZE];
        record[0..3].copy_from_slice(&sphere.center.to_array());
        record[3] = sphere.radius;
        record[4] = self.lod_count() as f32;
        record[5] = self.flags().bits() as f32;
        for (lod, level) in self.descriptor.lods.iter().take(MAX_LOD).enumerate() {
            record[8 + lod] = level.screen_relative_height;
            record[16 + lod] = self.descriptor.shadow_lod(lod as u32) as f32;
        }
        record
    }
}

impl ParameterContributor for LodGroupData {
    fn parameter_start(&self) -> u32 {
        self.start
    }

    fn set_parameter_buffer_data(&self, parameters: &mut ParameterBuffer) {
        parameters.write(self.start, &self.record());
    }
}

/// Profile record as kernels read it back out of the parameter buffer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ProfileParams {
    pub min_culling_distance: f32,
    pub max_distance: f32,
    pub frustum_offset: f32,
    pub occlusion_offset: f32,
    pub occlusion_accuracy: u32,
    pub flags: ProfileFlags,
    pub lod_bias: f32,
    pub shadow_distance: f32,
    pub crossfade_width: f32,
    pub crossfade_duration: f32,
}

impl ProfileParams {
    pub fn read(parameters: &[f32], start: u32) -> Self {
        let r = &parameters[start as usize..start as usize + PROFILE_RECORD_SIZE];
        Self {
            min_culling_distance: r[0],
            max_distance: r[1],
            frustum_offset: r[2],
            occlusion_offset: r[3],
            occlusion_accuracy: r[4] as u32,
            flags: ProfileFlags::from_bits_truncate(r[5] as u32),
            lod_bias: r[6],
            shadow_distance: r[7],
            crossfade_width: r[8],
            crossfade_duration: r[9],
        }
    }
}

/// LOD group record as kernels read it back out of the parameter buffer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LodGroupParams {
    pub sphere: BoundingSphere,
    pub lod_count: u32,
    pub flags: LodGroupFlags,
    pub thresholds: [f32; MAX_LOD],
    pub shadow_lods: [u32; MAX_LOD],
}

impl LodGroupParams {
    pub fn read(parameters: &[f32], start: u32) -> Self {
        let r = &parameters[start as usize..start as usize + LOD_GROUP_RECORD_SIZE];
        let mut thresholds = [0.0; MAX_LOD];
        thresholds.copy_from_slice(&r[8..8 + MAX_LOD]);
        let mut shadow_lods = [0; MAX_LOD];
        for (dst, &src) in shadow_lods.iter_mut().zip(&r[16..16 + MAX_LOD]) {
            *dst = src as u32;
        }
        Self {
            sphere: BoundingSphere {
                center: Vec3::new(r[0], r[1], r[2]),
                radius: r[3],
            },
            lod_count: r[4] as u32,
            flags: LodGroupFlags::from_bits_truncate(r[5] as u32),
            thresholds,
            shadow_lods,
        }
    }
}
