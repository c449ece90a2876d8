//! Transform storage of a render source group.

use glam::{Mat4, Vec3};
use herd_types::{BufferMode, CameraId, InstanceLodState, InstanceVisibility, LOD_STATE_UNSET};
use wgpu::{BufferUsages, CommandEncoder};

use crate::{
    buffer::{CopyRegion, GpuDataBuffer},
    format_sso,
    mode::HerdContext,
    util::typedefs::{FastHashMap, SsoString},
};

/// Everything a camera's visibility pass writes for one group.
pub struct CameraInstanceData {
    /// `buffer_size` entries per (pass, LOD) pair.
    pub visibility: GpuDataBuffer<InstanceVisibility>,
    /// One entry per transform slot, remembers animated cross-fades between frames.
    pub lod_state: GpuDataBuffer<InstanceLodState>,
}

/// Lod state of a slot no animated cross-fade has seen yet.
const UNSET_LOD_STATE: InstanceLodState = InstanceLodState {
    lod: LOD_STATE_UNSET,
    previous_lod: LOD_STATE_UNSET,
    fade_progress: 1.0,
    _padding: 0,
};

impl CameraInstanceData {
    fn new(label: &str, context: HerdContext) -> Self {
        Self {
            visibility: GpuDataBuffer::new(&format_sso!("{label} visibility"), context.clone(), BufferUsages::empty()),
            lod_state: GpuDataBuffer::new(&format_sso!("{label} lod state"), context, BufferUsages::empty()),
        }
    }

    fn ensure_size(&mut self, buffer_size: usize, lod_count: usize) {
        self.visibility.resize(buffer_size * lod_count * 2);

        let old_len = self.lod_state.len();
        if old_len < buffer_size {
            self.lod_state
                .write_range(old_len, &vec![UNSET_LOD_STATE; buffer_size - old_len]);
        } else {
            self.lod_state.resize(buffer_size);
        }
    }
}

/// A camera's copy of the transforms with the camera at the origin.
struct CameraTransforms {
    transforms: GpuDataBuffer<Mat4>,
    /// Camera position and source generation the copy was last built from.
    built_from: Option<(Vec3, u64)>,
}

/// Transform buffers of one render source group.
///
/// Holds the current transforms, optionally a previous frame copy for motion
/// vectors, camera relative copies when running [`BufferMode::CameraBased`],
/// and the per camera visibility output.
pub struct TransformBufferData {
    label: SsoString,
    context: HerdContext,
    buffer_mode: BufferMode,
    transforms: GpuDataBuffer<Mat4>,
    previous: Option<GpuDataBuffer<Mat4>>,
    camera_transforms: FastHashMap<CameraId, CameraTransforms>,
    instance_data: FastHashMap<CameraId, CameraInstanceData>,
    last_updated_frame: Option<u64>,
    previous_updates: u64,
}

impl TransformBufferData {
    pub fn new(label: &str, context: HerdContext, buffer_mode: BufferMode, motion_vectors: bool) -> Self {
        let previous = motion_vectors.then(|| {
            GpuDataBuffer::new(&format_sso!("{label} previous transforms"), context.clone(), BufferUsages::empty())
        });
        Self {
            label: SsoString::from(label),
            transforms: GpuDataBuffer::new(&format_sso!("{label} transforms"), context.clone(), BufferUsages::empty()),
            context,
            buffer_mode,
            previous,
            camera_transforms: FastHashMap::default(),
            instance_data: FastHashMap::default(),
            last_updated_frame: None,
            previous_updates: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.buffer_mode
    }

    pub fn transforms(&self) -> &GpuDataBuffer<Mat4> {
        &self.transforms
    }

    pub fn transforms_mut(&mut self) -> &mut GpuDataBuffer<Mat4> {
        &mut self.transforms
    }

    pub fn previous(&self) -> Option<&GpuDataBuffer<Mat4>> {
        self.previous.as_ref()
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Adds or drops the previous frame buffer. A new one starts as a copy of
    /// the current transforms, so nothing moves on its first frame.
    pub fn set_motion_vectors(&mut self, enabled: bool) {
        match (enabled, self.previous.take()) {
            (true, Some(previous)) => self.previous = Some(previous),
            (true, None) => {
                let mut previous = GpuDataBuffer::new(
                    &format_sso!("{} previous transforms", self.label),
                    self.context.clone(),
                    BufferUsages::empty(),
                );
                previous.set_range(0, self.transforms.data());
                self.previous = Some(previous);
            }
            (false, Some(mut previous)) => previous.release_buffers(),
            (false, None) => {}
        }
    }

    /// Forgets every camera's animated cross-fade state, e.g. when the LOD
    /// levels the states index into were replaced.
    pub fn reset_lod_states(&mut self) {
        for data in self.instance_data.values_mut() {
            data.lod_state.fill(UNSET_LOD_STATE);
        }
    }

    /// Amount of times the previous frame buffer was refreshed by [`update_data`](Self::update_data).
    pub fn previous_updates(&self) -> u64 {
        self.previous_updates
    }

    /// Rebuilds every buffer at `new_len`, keeping `regions`.
    ///
    /// The previous frame buffer follows the same layout; slots no region
    /// carries over are initialized from the current transforms. Per camera
    /// lod states move with their slots, uncovered ones start unset.
    pub fn resize(&mut self, new_len: usize, regions: &[CopyRegion]) {
        profiling::scope!("TransformBufferData::resize");

        self.transforms.remap(new_len, regions);

        if let Some(ref mut previous) = self.previous {
            previous.remap(new_len, regions);
            for gap in CopyRegion::uncovered(new_len, regions) {
                previous.set_range(gap.start, &self.transforms.data()[gap]);
            }
        }

        for data in self.instance_data.values_mut() {
            let carried: Vec<CopyRegion> = regions
                .iter()
                .filter(|r| r.src + r.len <= data.lod_state.len())
                .copied()
                .collect();
            data.lod_state.remap_filled(new_len, &carried, UNSET_LOD_STATE);
        }

        // Rebuilt from the current transforms before their next use.
        for relative in self.camera_transforms.values_mut() {
            relative.transforms.resize(new_len);
            relative.built_from = None;
        }
    }

    /// Removes `count` slots starting at `start`, compacting everything after them.
    pub fn remove_indexes(&mut self, start: usize, count: usize) {
        let len = self.len();
        let end = (start + count).min(len);
        let regions = [CopyRegion::new(0, 0, start), CopyRegion::new(end, start, len - end)];
        self.resize(len - (end - start), &regions);
    }

    /// Writes `data` at `dst_offset`. The buffer must already be large enough.
    ///
    /// `overwrite_previous` also writes the previous frame buffer, so a freshly
    /// registered instance has no motion on its first frame.
    pub fn set_transform_buffer_data(&mut self, dst_offset: usize, data: &[Mat4], overwrite_previous: bool) {
        self.transforms.set_range(dst_offset, data);
        if overwrite_previous {
            if let Some(ref mut previous) = self.previous {
                previous.set_range(dst_offset, data);
            }
        }
    }

    /// Copies the current transforms into the previous frame buffer, at most once per frame.
    ///
    /// Returns true if the copy happened.
    pub fn update_data(&mut self, frame: u64, encoder: Option<&mut CommandEncoder>) -> bool {
        let Some(ref mut previous) = self.previous else {
            return false;
        };
        if self.last_updated_frame.map_or(false, |last| frame <= last) {
            return false;
        }
        self.last_updated_frame = Some(frame);

        self.transforms.update_buffer_data(false);
        previous.update_buffer_data(false);
        previous.copy_from(encoder, &self.transforms);
        self.previous_updates += 1;
        true
    }

    /// The transforms and the camera relative copy for `camera` when the copy is
    /// out of date for a camera at `origin`, sized to match. The copy counts as
    /// built afterwards; the caller runs the kernel filling it.
    pub fn stale_camera_relative(
        &mut self,
        camera: CameraId,
        origin: Vec3,
    ) -> Option<(&mut GpuDataBuffer<Mat4>, &mut GpuDataBuffer<Mat4>)> {
        let label = &self.label;
        let context = &self.context;
        let relative = self.camera_transforms.entry(camera).or_insert_with(|| CameraTransforms {
            transforms: GpuDataBuffer::new(
                &format_sso!("{label} camera {} transforms", camera.0),
                context.clone(),
                BufferUsages::empty(),
            ),
            built_from: None,
        });

        let current = (origin, self.transforms.generation());
        if relative.built_from == Some(current) && relative.transforms.len() == self.transforms.len() {
            return None;
        }
        relative.built_from = Some(current);
        relative.transforms.resize(self.transforms.len());
        Some((&mut self.transforms, &mut relative.transforms))
    }

    /// The transforms visibility for `camera` reads, with its output buffers sized
    /// for `buffer_size` slots and `lod_count` levels.
    pub fn camera_buffers(
        &mut self,
        camera: CameraId,
        buffer_size: usize,
        lod_count: usize,
    ) -> (&mut GpuDataBuffer<Mat4>, &mut CameraInstanceData) {
        let label = &self.label;
        let context = &self.context;
        let instance_data = self
            .instance_data
            .entry(camera)
            .or_insert_with(|| CameraInstanceData::new(&format_sso!("{label} camera {}", camera.0), context.clone()));
        instance_data.ensure_size(buffer_size, lod_count);

        let transforms = match self.buffer_mode {
            BufferMode::CameraBased => self
                .camera_transforms
                .get_mut(&camera)
                .map_or(&mut self.transforms, |relative| &mut relative.transforms),
            BufferMode::Default => &mut self.transforms,
        };
        (transforms, instance_data)
    }

    /// The camera relative copy for `camera`, once one was built.
    pub fn camera_transforms(&self, camera: CameraId) -> Option<&GpuDataBuffer<Mat4>> {
        self.camera_transforms.get(&camera).map(|relative| &relative.transforms)
    }

    pub fn instance_data(&self, camera: CameraId) -> Option<&CameraInstanceData> {
        self.instance_data.get(&camera)
    }

    pub fn instance_data_mut(&mut self, camera: CameraId) -> Option<&mut CameraInstanceData> {
        self.instance_data.get_mut(&camera)
    }

    pub fn release_camera(&mut self, camera: CameraId) {
        if let Some(mut data) = self.instance_data.remove(&camera) {
            data.visibility.release_buffers();
            data.lod_state.release_buffers();
        }
        if let Some(mut relative) = self.camera_transforms.remove(&camera) {
            relative.transforms.release_buffers();
        }
    }

    pub fn release_buffers(&mut self) {
        log::debug!("{}: releasing transform buffers", self.label);
        self.transforms.release_buffers();
        if let Some(ref mut previous) = self.previous {
            previous.release_buffers();
        }
        let cameras: Vec<CameraId> = self
            .instance_data
            .keys()
            .chain(self.camera_transforms.keys())
            .copied()
            .collect();
        for camera in cameras {
            self.release_camera(camera);
        }
    }
}

#[cfg(test)]
mod test {
    use glam::{Mat4, Vec3};
    use herd_types::{BufferMode, CameraId, InstanceLodState, LOD_STATE_UNSET};

    use super::TransformBufferData;
    use crate::{buffer::CopyRegion, culling::run_camera_relative, ModeData};

    fn translation(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    fn data(count: usize, motion: bool) -> TransformBufferData {
        let mut data = TransformBufferData::new("test", ModeData::Cpu(()), BufferMode::Default, motion);
        data.resize(count, &[]);
        let transforms: Vec<_> = (0..count).map(|i| translation(i as f32)).collect();
        data.set_transform_buffer_data(0, &transforms, true);
        data
    }

    #[test]
    fn previous_updated_once_per_frame() {
        let mut data = data(4, true);
        data.set_transform_buffer_data(1, &[translation(10.0)], false);
        assert_eq!(data.previous().unwrap().data()[1], translation(1.0));

        assert!(data.update_data(7, None));
        assert_eq!(data.previous().unwrap().data()[1], translation(10.0));

        data.set_transform_buffer_data(1, &[translation(20.0)], false);
        assert!(!data.update_data(7, None));
        assert!(!data.update_data(6, None));
        assert_eq!(data.previous().unwrap().data()[1], translation(10.0));
        assert_eq!(data.previous_updates(), 1);

        assert!(data.update_data(8, None));
        assert_eq!(data.previous().unwrap().data()[1], translation(20.0));
    }

    #[test]
    fn motion_vectors_toggle() {
        let mut data = data(3, false);
        assert!(!data.has_previous());

        data.set_motion_vectors(true);
        assert_eq!(data.previous().unwrap().data(), data.transforms().data());

        data.set_transform_buffer_data(1, &[translation(7.0)], false);
        data.set_motion_vectors(true);
        assert_eq!(data.previous().unwrap().data()[1], translation(1.0));

        data.set_motion_vectors(false);
        assert!(data.previous().is_none());
    }

    #[test]
    fn growth_back_fills_previous() {
        let mut data = data(2, true);
        data.set_transform_buffer_data(0, &[translation(7.0)], false);
        data.resize(4, &[CopyRegion::new(0, 0, 2)]);
        assert!(data.previous().unwrap().len() >= data.len());
        assert_eq!(&data.previous().unwrap().data()[..2], &[translation(0.0), translation(1.0)]);
        assert_eq!(&data.previous().unwrap().data()[2..], &data.transforms().data()[2..]);
    }

    #[test]
    fn remove_indexes_compacts_both_buffers() {
        let mut data = data(6, true);
        data.remove_indexes(1, 2);
        let expected = [translation(0.0), translation(3.0), translation(4.0), translation(5.0)];
        assert_eq!(data.transforms().data(), &expected);
        assert_eq!(data.previous().unwrap().data(), &expected);
    }

    #[test]
    fn camera_relative_copies_rebuild_only_when_stale() {
        let mut data = TransformBufferData::new("test", ModeData::Cpu(()), BufferMode::CameraBased, false);
        data.resize(1, &[]);
        data.set_transform_buffer_data(0, &[translation(100.0)], false);

        let origin = Vec3::new(99.0, 0.0, 0.0);
        let (transforms, relative) = data.stale_camera_relative(CameraId(0), origin).unwrap();
        run_camera_relative(transforms.data(), relative.data_mut(), origin);
        assert!(data.stale_camera_relative(CameraId(0), origin).is_none());

        let (transforms, instance_data) = data.camera_buffers(CameraId(0), 1, 2);
        assert_eq!(transforms.data()[0], translation(1.0));
        assert_eq!(instance_data.visibility.len(), 4);
        assert_eq!(instance_data.lod_state.len(), 1);

        // Moving the camera or writing transforms invalidates the copy.
        assert!(data.stale_camera_relative(CameraId(0), Vec3::ZERO).is_some());
        assert!(data.stale_camera_relative(CameraId(0), Vec3::ZERO).is_none());
        data.set_transform_buffer_data(0, &[translation(50.0)], false);
        assert!(data.stale_camera_relative(CameraId(0), Vec3::ZERO).is_some());
        data.resize(2, &[CopyRegion::new(0, 0, 1)]);
        let (_, relative) = data.stale_camera_relative(CameraId(0), Vec3::ZERO).unwrap();
        assert_eq!(relative.len(), 2);
    }

    fn lod_state(lod: u32) -> InstanceLodState {
        InstanceLodState {
            lod,
            previous_lod: lod,
            fade_progress: 1.0,
            _padding: 0,
        }
    }

    #[test]
    fn lod_states_follow_their_slots() {
        let mut data = data(4, false);
        let (_, instance_data) = data.camera_buffers(CameraId(3), 4, 1);
        assert!(instance_data.lod_state.data().iter().all(|s| s.lod == LOD_STATE_UNSET));
        instance_data
            .lod_state
            .set_range(0, &[lod_state(0), lod_state(1), lod_state(2), lod_state(3)]);

        data.remove_indexes(0, 2);
        let states = data.instance_data(CameraId(3)).unwrap().lod_state.data();
        assert_eq!(states, &[lod_state(2), lod_state(3)]);

        data.resize(4, &[CopyRegion::new(0, 2, 2)]);
        let states = data.instance_data(CameraId(3)).unwrap().lod_state.data();
        assert_eq!(states[0].lod, LOD_STATE_UNSET);
        assert_eq!(states[1].lod, LOD_STATE_UNSET);
        assert_eq!(&states[2..], &[lod_state(2), lod_state(3)]);
    }

    #[test]
    fn reset_forgets_lod_states() {
        let mut data = data(2, false);
        let (_, instance_data) = data.camera_buffers(CameraId(1), 2, 3);
        instance_data.lod_state.set_range(0, &[lod_state(2), lod_state(1)]);

        data.reset_lod_states();
        let states = data.instance_data(CameraId(1)).unwrap().lod_state.data();
        assert!(states.iter().all(|s| s.lod == LOD_STATE_UNSET && s.previous_lod == LOD_STATE_UNSET));
    }
}
