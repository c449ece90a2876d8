//! Per camera visibility state: matrices, the visibility buffer, indirect
//! draw arguments and the Hi-Z pyramid.

use arrayvec::ArrayVec;
use glam::{Mat4, Vec3, Vec4};
use herd_types::{
    BufferMode, Camera, CameraId, CameraProjection, DepthConvention, DrawPass, Handedness, IndirectDrawArgs,
    LodGroupDescriptor, OcclusionCullingMode, StereoMode, MAX_LOD,
};
use wgpu::{BufferAddress, BufferUsages};

use crate::{
    buffer::GpuDataBuffer,
    culling::CullingCamera,
    format_sso,
    mode::HerdContext,
    occlusion::OcclusionCullingData,
    source::RenderSourceGroupKey,
    util::{frustum::ShaderFrustum, typedefs::FastHashMap},
};

/// Size of one [`IndirectDrawArgs`] in the command buffer.
pub const INDIRECT_ARGS_SIZE: BufferAddress = std::mem::size_of::<IndirectDrawArgs>() as BufferAddress;

const DRAW_PASSES: [DrawPass; 2] = [DrawPass::Main, DrawPass::Shadow];

/// Where a camera is within its frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CameraState {
    Idle,
    MatricesUpdated,
    HiZReady,
    VisibilityComputed,
    CommandBufferUpdated,
    Drawn,
}

/// A group's region of a camera's visibility and command buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityData {
    /// First counter of the group in the visibility buffer.
    pub offset: u32,
    pub lod_count: u32,
    /// Group buffer size the command arguments were written for.
    pub buffer_size: u32,
    pub command_start: u32,
    pub command_count: u32,
    /// Submesh count of every LOD.
    pub submeshes: ArrayVec<u32, MAX_LOD>,
}

impl VisibilityData {
    fn submeshes_per_pass(&self) -> u32 {
        self.submeshes.iter().sum()
    }

    /// Index of the counter for `(pass, lod)` in the camera's visibility buffer.
    pub fn counter_index(&self, pass: DrawPass, lod: u32) -> u32 {
        self.offset + pass as u32 * self.lod_count + lod
    }
}

/// One indirect draw the host issues for a group.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IndirectDraw {
    pub lod: u32,
    pub submesh: u32,
    /// Byte offset into [`CameraData::commands`].
    pub offset: BufferAddress,
}

/// Why a group was not dispatched for a camera this frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The group owns no transform slots yet.
    NoTransforms,
    /// The group has slots but no instance is rendered.
    NoActiveInstances,
    MissingProfile,
    MissingLodGroup,
    /// A buffer the kernel binds has not been uploaded.
    MissingBuffer,
}

/// What [`Herd::update_camera_data`](crate::Herd::update_camera_data) did.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrameReport {
    pub camera: CameraId,
    pub frame: u64,
    pub groups_dispatched: u32,
    pub skipped: Vec<(RenderSourceGroupKey, SkipReason)>,
    /// True if at least one group was culled against the Hi-Z pyramid.
    pub occlusion_used: bool,
}

fn compute_projection_matrix(
    data: Camera,
    handedness: Handedness,
    depth: DepthConvention,
    aspect_ratio: f32,
) -> Mat4 {
    match data.projection {
        CameraProjection::Orthographic { size } => {
            let half = size * 0.5;
            let (near, far) = match depth {
                DepthConvention::Reversed => (half.z, -half.z),
                DepthConvention::Standard => (-half.z, half.z),
            };
            if handedness == Handedness::Left {
                Mat4::orthographic_lh(-half.x, half.x, -half.y, half.y, near, far)
            } else {
                Mat4::orthographic_rh(-half.x, half.x, -half.y, half.y, near, far)
            }
        }
        CameraProjection::Perspective { vfov, near } => match (handedness, depth) {
            (Handedness::Left, DepthConvention::Reversed) => {
                Mat4::perspective_infinite_reverse_lh(vfov.to_radians(), aspect_ratio, near)
            }
            (Handedness::Right, DepthConvention::Reversed) => {
                Mat4::perspective_infinite_reverse_rh(vfov.to_radians(), aspect_ratio, near)
            }
            (Handedness::Left, DepthConvention::Standard) => {
                Mat4::perspective_infinite_lh(vfov.to_radians(), aspect_ratio, near)
            }
            (Handedness::Right, DepthConvention::Standard) => {
                Mat4::perspective_infinite_rh(vfov.to_radians(), aspect_ratio, near)
            }
        },
        CameraProjection::Raw(proj) => proj,
    }
}

fn compute_origin_matrix(data: Camera) -> Mat4 {
    let mut view = data.view;

    view.w_axis = Vec4::W;
    view
}

/// `(tan(vfov / 2), 0)` for perspective projections, `(0, view height)` for orthographic ones.
fn lod_metrics(proj: Mat4) -> (f32, f32) {
    let scale_y = proj.y_axis.y.abs().max(f32::EPSILON);
    if proj.w_axis.w == 0.0 {
        (1.0 / scale_y, 0.0)
    } else {
        (0.0, 2.0 / scale_y)
    }
}

#[derive(Debug, Copy, Clone)]
struct EyeMatrices {
    proj: Mat4,
    view_proj: Mat4,
    origin_view_proj: Mat4,
    location: Vec3,
}

impl EyeMatrices {
    fn new(data: Camera, handedness: Handedness, depth: DepthConvention, aspect_ratio: f32) -> Self {
        let proj = compute_projection_matrix(data, handedness, depth, aspect_ratio);
        Self {
            proj,
            view_proj: proj * data.view,
            origin_view_proj: proj * compute_origin_matrix(data),
            location: data.view.inverse().w_axis.truncate(),
        }
    }
}

/// Everything one camera owns.
pub struct CameraData {
    id: CameraId,
    handedness: Handedness,
    depth: DepthConvention,
    stereo: StereoMode,
    aspect_ratio: f32,
    eyes: ArrayVec<Camera, 2>,
    matrices: ArrayVec<EyeMatrices, 2>,
    state: CameraState,
    counters: GpuDataBuffer<u32>,
    commands: GpuDataBuffer<IndirectDrawArgs>,
    command_visibility_index: GpuDataBuffer<u32>,
    regions: FastHashMap<RenderSourceGroupKey, VisibilityData>,
    /// Counters left behind by released regions.
    released_counters: usize,
    occlusion: OcclusionCullingData,
}

impl CameraData {
    /// `occlusion_mode` must already be resolved.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: CameraId,
        camera: Camera,
        aspect_ratio: Option<f32>,
        handedness: Handedness,
        depth: DepthConvention,
        stereo: StereoMode,
        occlusion_mode: OcclusionCullingMode,
        context: HerdContext,
    ) -> Self {
        profiling::scope!("CameraData::new");

        log::debug!("Creating camera {:?} ({occlusion_mode:?}, {stereo:?})", id);
        let label = format_sso!("camera {}", id.0);
        let mut eyes = ArrayVec::new();
        eyes.push(camera);
        let mut data = Self {
            id,
            handedness,
            depth,
            stereo,
            aspect_ratio: aspect_ratio.unwrap_or(1.0),
            eyes,
            matrices: ArrayVec::new(),
            state: CameraState::Idle,
            counters: GpuDataBuffer::new(&format_sso!("{label} visibility"), context.clone(), BufferUsages::empty()),
            commands: GpuDataBuffer::new(&format_sso!("{label} commands"), context.clone(), BufferUsages::INDIRECT),
            command_visibility_index: GpuDataBuffer::new(
                &format_sso!("{label} command index"),
                context,
                BufferUsages::empty(),
            ),
            regions: FastHashMap::default(),
            released_counters: 0,
            occlusion: OcclusionCullingData::new(occlusion_mode, depth, stereo.eye_count()),
        };
        data.update_matrices();
        data.state = CameraState::Idle;
        data
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: CameraState) {
        self.state = state;
    }

    pub fn eye_count(&self) -> u32 {
        self.stereo.eye_count()
    }

    pub fn stereo(&self) -> StereoMode {
        self.stereo
    }

    pub fn depth_convention(&self) -> DepthConvention {
        self.depth
    }

    /// Sets the camera of every eye. Eyes missing from `eyes` reuse the first one.
    pub fn set_camera_data(&mut self, eyes: &[Camera]) {
        let Some(&first) = eyes.first() else {
            log::error!("Camera {:?}: no eye data given, keeping the previous matrices", self.id);
            return;
        };
        self.eyes.clear();
        for eye in 0..self.eye_count() as usize {
            self.eyes.push(eyes.get(eye).copied().unwrap_or(first));
        }
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: Option<f32>) {
        self.aspect_ratio = aspect_ratio.unwrap_or(1.0);
    }

    /// Recomputes the matrices of every eye. Starts the camera's frame.
    pub fn update_matrices(&mut self) {
        profiling::scope!("CameraData::update_matrices");

        let first = self.eyes.first().copied().unwrap_or_default();
        self.matrices.clear();
        for eye in 0..self.eye_count() as usize {
            let data = self.eyes.get(eye).copied().unwrap_or(first);
            self.matrices
                .push(EyeMatrices::new(data, self.handedness, self.depth, self.aspect_ratio));
        }
        self.state = CameraState::MatricesUpdated;
    }

    fn eye(&self, eye: usize) -> EyeMatrices {
        let first = self.matrices.first().copied().unwrap_or_else(|| {
            EyeMatrices::new(Camera::default(), self.handedness, self.depth, self.aspect_ratio)
        });
        self.matrices.get(eye).copied().unwrap_or(first)
    }

    pub fn view_proj(&self, eye: usize) -> Mat4 {
        self.eye(eye).view_proj
    }

    /// Midpoint of every eye's location.
    pub fn location(&self) -> Vec3 {
        let count = self.matrices.len().max(1) as f32;
        self.matrices.iter().map(|m| m.location).sum::<Vec3>() / count
    }

    /// Camera values for the visibility kernel.
    ///
    /// Camera based buffers hold camera relative transforms, so the camera sits at the origin.
    pub fn culling_camera(&self, buffer_mode: BufferMode, delta_time: f32) -> CullingCamera {
        let eyes = [self.eye(0), self.eye(1)];
        let view_proj = eyes.map(|e| match buffer_mode {
            BufferMode::Default => e.view_proj,
            BufferMode::CameraBased => e.origin_view_proj,
        });
        let (tan_half_fov, ortho_height) = lod_metrics(eyes[0].proj);
        CullingCamera {
            view_proj,
            frustums: view_proj.map(|m| ShaderFrustum::from_matrix(m, self.depth)),
            eye_count: self.eye_count(),
            position: match buffer_mode {
                BufferMode::Default => self.location(),
                BufferMode::CameraBased => Vec3::ZERO,
            },
            tan_half_fov,
            ortho_height,
            depth: self.depth,
            delta_time,
        }
    }

    /// The group's region, allocated on first use.
    ///
    /// A changed buffer size rewrites the region's `first_instance` values. A
    /// changed LOD layout abandons the old region and allocates a new one.
    pub fn ensure_region(
        &mut self,
        group: RenderSourceGroupKey,
        buffer_size: u32,
        lod_group: &LodGroupDescriptor,
    ) -> &VisibilityData {
        let submeshes: ArrayVec<u32, MAX_LOD> = lod_group
            .lods
            .iter()
            .take(MAX_LOD)
            .map(|lod| lod.submeshes.len() as u32)
            .collect();

        let stale = self.regions.get(&group).map(|r| r.submeshes != submeshes);
        if stale == Some(true) {
            log::debug!("Camera {:?}: LOD layout of group {:016x} changed", self.id, group.0);
            self.release_group(group);
        }

        if !self.regions.contains_key(&group) {
            let lod_count = submeshes.len() as u32;
            let offset = self.counters.len() as u32;
            let command_start = self.commands.len() as u32;
            let command_count = submeshes.iter().sum::<u32>() * DRAW_PASSES.len() as u32;
            log::debug!(
                "Camera {:?}: allocating visibility region {offset} and {command_count} commands for group {:016x}",
                self.id,
                group.0
            );

            self.counters.resize(offset as usize + lod_count as usize * DRAW_PASSES.len());
            self.commands.resize((command_start + command_count) as usize);
            self.command_visibility_index
                .resize((command_start + command_count) as usize);

            let region = VisibilityData {
                offset,
                lod_count,
                buffer_size,
                command_start,
                command_count,
                submeshes,
            };
            self.write_commands(&region, lod_group);
            self.regions.insert(group, region);
        } else if let Some(region) = self.regions.get_mut(&group) {
            if region.buffer_size != buffer_size {
                region.buffer_size = buffer_size;
                let region = region.clone();
                self.write_commands(&region, lod_group);
            }
        }

        &self.regions[&group]
    }

    fn write_commands(&mut self, region: &VisibilityData, lod_group: &LodGroupDescriptor) {
        let mut args = Vec::with_capacity(region.command_count as usize);
        let mut indexes = Vec::with_capacity(region.command_count as usize);
        for pass in DRAW_PASSES {
            for (lod, level) in lod_group.lods.iter().take(region.lod_count as usize).enumerate() {
                let bucket = pass as u32 * region.lod_count + lod as u32;
                for submesh in &level.submeshes {
                    args.push(IndirectDrawArgs {
                        index_count: submesh.index_count,
                        instance_count: 0,
                        first_index: submesh.first_index,
                        base_vertex: submesh.base_vertex,
                        first_instance: bucket * region.buffer_size,
                    });
                    indexes.push(region.offset + bucket);
                }
            }
        }
        self.commands.set_range(region.command_start as usize, &args);
        self.command_visibility_index
            .set_range(region.command_start as usize, &indexes);
    }

    pub fn region(&self, group: RenderSourceGroupKey) -> Option<&VisibilityData> {
        self.regions.get(&group)
    }

    pub fn regions(&self) -> impl Iterator<Item = (&RenderSourceGroupKey, &VisibilityData)> + '_ {
        self.regions.iter()
    }

    /// Visible count of `(pass, lod)` as the mirror holds it. In gpu mode this
    /// needs a readback of [`counters`](Self::counters) first.
    pub fn visible_count(&self, group: RenderSourceGroupKey, pass: DrawPass, lod: u32) -> Option<u32> {
        let region = self.regions.get(&group)?;
        if lod >= region.lod_count {
            return None;
        }
        self.counters.data().get(region.counter_index(pass, lod) as usize).copied()
    }

    /// Draws of a group in `pass`, in LOD then submesh order.
    pub fn indirect_draws(&self, group: RenderSourceGroupKey, pass: DrawPass) -> Vec<IndirectDraw> {
        let Some(region) = self.regions.get(&group) else {
            return Vec::new();
        };
        let mut index = region.command_start + pass as u32 * region.submeshes_per_pass();
        let mut draws = Vec::with_capacity(region.submeshes_per_pass() as usize);
        for (lod, &count) in region.submeshes.iter().enumerate() {
            for submesh in 0..count {
                draws.push(IndirectDraw {
                    lod: lod as u32,
                    submesh,
                    offset: index as BufferAddress * INDIRECT_ARGS_SIZE,
                });
                index += 1;
            }
        }
        draws
    }

    /// The host consumed the command buffer.
    pub fn mark_drawn(&mut self) {
        if self.state != CameraState::CommandBufferUpdated {
            log::warn!("Camera {:?} drawn in state {:?}", self.id, self.state);
        }
        self.state = CameraState::Drawn;
    }

    /// Forgets a group's region. Its slots are left as a hole until [`Self::reclaim_holes`]
    /// finds enough of them.
    pub fn release_group(&mut self, group: RenderSourceGroupKey) {
        let Some(region) = self.regions.remove(&group) else {
            return;
        };
        self.released_counters += region.lod_count as usize * DRAW_PASSES.len();
        let range = region.command_start as usize..(region.command_start + region.command_count) as usize;
        self.command_visibility_index.data_mut()[range.clone()].fill(u32::MAX);
        self.commands.data_mut()[range].fill(IndirectDrawArgs::default());
    }

    /// Drops every region once holes make up more than half of the counters.
    /// Live groups get fresh regions on their next update. Returns whether it compacted.
    pub fn reclaim_holes(&mut self) -> bool {
        if self.released_counters * 2 <= self.counters.len() {
            return false;
        }
        log::debug!(
            "Camera {:?}: {} of {} counters are holes, compacting",
            self.id,
            self.released_counters,
            self.counters.len()
        );
        self.clear_visibility_data();
        true
    }

    /// Drops every region and shrinks all buffers to nothing.
    pub fn clear_visibility_data(&mut self) {
        log::debug!("Camera {:?}: clearing visibility data", self.id);
        self.regions.clear();
        self.released_counters = 0;
        self.counters.resize(0);
        self.commands.resize(0);
        self.command_visibility_index.resize(0);
    }

    /// Per group counters, `2 * lod_count` entries per region.
    pub fn counters(&self) -> &GpuDataBuffer<u32> {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut GpuDataBuffer<u32> {
        &mut self.counters
    }

    pub fn commands(&self) -> &GpuDataBuffer<IndirectDrawArgs> {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut GpuDataBuffer<IndirectDrawArgs> {
        &mut self.commands
    }

    pub fn command_visibility_index(&self) -> &GpuDataBuffer<u32> {
        &self.command_visibility_index
    }

    /// The three buffers of the command update, borrowed together.
    pub(crate) fn command_parts(
        &mut self,
    ) -> (
        &mut GpuDataBuffer<IndirectDrawArgs>,
        &mut GpuDataBuffer<u32>,
        &mut GpuDataBuffer<u32>,
    ) {
        (&mut self.commands, &mut self.command_visibility_index, &mut self.counters)
    }

    /// The visibility buffer and the Hi-Z state, borrowed together for cpu dispatch.
    pub(crate) fn visibility_parts(&mut self) -> (&mut GpuDataBuffer<u32>, &OcclusionCullingData) {
        (&mut self.counters, &self.occlusion)
    }

    /// Drives in-flight readbacks of the camera's buffers. Returns how many completed.
    pub fn poll_readbacks(&mut self) -> u32 {
        [
            self.counters.poll_readback(),
            self.command_visibility_index.poll_readback(),
            self.commands.poll_readback(),
        ]
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count() as u32
    }

    pub fn occlusion(&self) -> &OcclusionCullingData {
        &self.occlusion
    }

    pub fn occlusion_mut(&mut self) -> &mut OcclusionCullingData {
        &mut self.occlusion
    }

    pub fn release_buffers(&mut self) {
        self.counters.release_buffers();
        self.commands.release_buffers();
        self.command_visibility_index.release_buffers();
        self.occlusion.release();
    }
}

#[cfg(test)]
mod test {
    use glam::{Mat4, Vec3};
    use herd_types::{
        Bounds, Camera, CameraId, CameraProjection, DepthConvention, DrawPass, Handedness, LodGroupDescriptor,
        LodGroupId, LodLevel, OcclusionCullingMode, StereoMode, SubMeshDraw,
    };

    use super::{lod_metrics, CameraData, CameraState, INDIRECT_ARGS_SIZE};
    use crate::{source::RenderSourceGroupKey, ModeData};

    fn lod_group(submeshes: &[usize]) -> LodGroupDescriptor {
        LodGroupDescriptor {
            id: LodGroupId(0),
            bounds: Bounds::default(),
            lods: submeshes
                .iter()
                .enumerate()
                .map(|(lod, &count)| LodLevel {
                    screen_relative_height: 0.5 / (lod + 1) as f32,
                    submeshes: (0..count)
                        .map(|s| SubMeshDraw {
                            index_count: 3 * (s as u32 + 1),
                            first_index: 0,
                            base_vertex: 0,
                        })
                        .collect(),
                })
                .collect(),
            shadow_lod_map: Vec::new(),
            has_object_motion: false,
            casts_shadows: true,
        }
    }

    fn camera() -> CameraData {
        CameraData::new(
            CameraId(0),
            Camera::default(),
            None,
            Handedness::Left,
            DepthConvention::Reversed,
            StereoMode::None,
            OcclusionCullingMode::DirectTextureAccess,
            ModeData::Cpu(()),
        )
    }

    #[test]
    fn regions_are_allocated_lazily_and_reused() {
        let mut camera = camera();
        let a = RenderSourceGroupKey(1);
        let b = RenderSourceGroupKey(2);

        let region = camera.ensure_region(a, 10, &lod_group(&[2, 1])).clone();
        assert_eq!((region.offset, region.lod_count, region.command_count), (0, 2, 6));
        let region_b = camera.ensure_region(b, 4, &lod_group(&[1])).clone();
        assert_eq!((region_b.offset, region_b.command_start), (4, 6));
        assert_eq!(camera.counters().len(), 6);

        assert_eq!(camera.ensure_region(a, 10, &lod_group(&[2, 1])), &region);

        // Shadow entries of LOD 1 start after the main pass and LOD 0 of the shadow pass.
        let args = camera.commands().data();
        assert_eq!(args[5].first_instance, 3 * 10);
        assert_eq!(camera.command_visibility_index().data()[5], 3);

        camera.ensure_region(a, 20, &lod_group(&[2, 1]));
        assert_eq!(camera.commands().data()[5].first_instance, 3 * 20);
        assert_eq!(camera.counters().len(), 6);
    }

    #[test]
    fn released_regions_leave_holes() {
        let mut camera = camera();
        let a = RenderSourceGroupKey(1);
        camera.ensure_region(a, 10, &lod_group(&[1]));
        camera.release_group(a);
        assert!(camera.region(a).is_none());
        assert!(camera.command_visibility_index().data().iter().all(|&i| i == u32::MAX));

        let again = camera.ensure_region(a, 10, &lod_group(&[1])).clone();
        assert_eq!(again.offset, 2);
        assert_eq!(again.command_start, 2);

        camera.clear_visibility_data();
        assert_eq!(camera.ensure_region(a, 10, &lod_group(&[1])).offset, 0);
    }

    #[test]
    fn holes_are_reclaimed_past_half() {
        let mut camera = camera();
        let a = RenderSourceGroupKey(1);
        let b = RenderSourceGroupKey(2);
        camera.ensure_region(a, 10, &lod_group(&[1]));
        camera.ensure_region(b, 10, &lod_group(&[1]));

        camera.release_group(a);
        assert!(!camera.reclaim_holes());
        assert_eq!(camera.region(b).map(|r| r.offset), Some(2));

        camera.ensure_region(a, 10, &lod_group(&[1]));
        camera.release_group(a);
        assert_eq!(camera.counters().len(), 6);
        assert!(camera.reclaim_holes());
        assert_eq!(camera.counters().len(), 0);
        assert!(camera.region(b).is_none());

        assert_eq!(camera.ensure_region(b, 10, &lod_group(&[1])).offset, 0);
        assert!(!camera.reclaim_holes());
    }

    #[test]
    fn indirect_draw_offsets() {
        let mut camera = camera();
        let a = RenderSourceGroupKey(1);
        camera.ensure_region(a, 8, &lod_group(&[2, 1]));

        let main = camera.indirect_draws(a, DrawPass::Main);
        assert_eq!(main.len(), 3);
        assert_eq!((main[2].lod, main[2].submesh), (1, 0));
        assert_eq!(main[2].offset, 2 * INDIRECT_ARGS_SIZE);

        let shadow = camera.indirect_draws(a, DrawPass::Shadow);
        assert_eq!(shadow[0].offset, 3 * INDIRECT_ARGS_SIZE);
        assert!(camera.indirect_draws(RenderSourceGroupKey(9), DrawPass::Main).is_empty());
    }

    #[test]
    fn matrices_and_metrics() {
        let mut camera = camera();
        assert_eq!(camera.state(), CameraState::Idle);
        camera.set_camera_data(&[Camera {
            projection: CameraProjection::Perspective { vfov: 90.0, near: 0.1 },
            view: Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)),
        }]);
        camera.update_matrices();
        assert_eq!(camera.state(), CameraState::MatricesUpdated);
        assert!((camera.location() - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-5);

        let culling = camera.culling_camera(herd_types::BufferMode::Default, 0.0);
        assert!((culling.tan_half_fov - 1.0).abs() < 1e-5);
        assert_eq!(culling.ortho_height, 0.0);
        let relative = camera.culling_camera(herd_types::BufferMode::CameraBased, 0.0);
        assert_eq!(relative.position, Vec3::ZERO);

        let ortho = Mat4::orthographic_lh(-2.0, 2.0, -4.0, 4.0, 10.0, -10.0);
        assert_eq!(lod_metrics(ortho).0, 0.0);
        assert!((lod_metrics(ortho).1 - 8.0).abs() < 1e-5);
    }
}
