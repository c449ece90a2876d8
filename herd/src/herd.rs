use std::sync::Arc;

use glam::Mat4;
use herd_types::{
    BufferMode, Camera, CameraId, InstancingProfile, InstancingProfileChange, LodGroupDescriptor, LodGroupId,
    OcclusionCullingMode, OwnerId, ProfileId, RenderSourceGroupDescriptor,
};
use indexmap::IndexMap;
use wgpu::{CommandEncoder, CommandEncoderDescriptor};

use crate::{
    camera::{CameraData, CameraFrameReport, CameraState, SkipReason},
    culling::{
        run_camera_relative, run_command_update, run_visibility, CpuVisibilityArgs, GpuKernels, GpuVisibilityArgs, GroupDispatch,
        PipelineVariant,
    },
    mode::HerdContext,
    occlusion::{CameraEvent, DepthSource, HiZPyramid, HiZTrigger},
    parameter::{LodGroupData, ParameterBuffer, ParameterContributor, ProfileData},
    setup::InstanceAdapterDevice,
    source::{RenderSource, RenderSourceGroup, RenderSourceGroupKey, RenderSourceKey},
    util::typedefs::FastHashMap,
    HerdError, HerdInitializationError, HerdOptions, ModeData, RendererMode, ShaderPreProcessor,
};

/// The instancing engine: every profile, LOD group, render source and camera.
///
/// Registration and per-frame calls must come from one thread at a time;
/// nothing in here locks.
pub struct Herd {
    mode: RendererMode,
    options: HerdOptions,
    occlusion_mode: OcclusionCullingMode,
    context: HerdContext,
    kernels: ModeData<(), GpuKernels>,

    parameters: ParameterBuffer,
    profiles: FastHashMap<ProfileId, ProfileData>,
    lod_groups: FastHashMap<LodGroupId, LodGroupData>,

    groups: IndexMap<RenderSourceGroupKey, RenderSourceGroup>,
    source_groups: FastHashMap<RenderSourceKey, RenderSourceGroupKey>,
    cameras: IndexMap<CameraId, CameraData>,

    frame: u64,
}

impl Herd {
    /// Creates the engine on `iad`, or purely on the CPU if there is none or
    /// the adapter was downgraded to [`RendererMode::CpuPowered`].
    pub fn new(iad: Option<&InstanceAdapterDevice>, options: HerdOptions) -> Result<Self, HerdInitializationError> {
        profiling::scope!("Herd::new");

        let context: HerdContext = match iad {
            Some(iad) if iad.mode == RendererMode::GpuPowered => ModeData::Gpu(iad.context()),
            _ => ModeData::Cpu(()),
        };
        let mode = context.mode();

        let kernels = match context {
            ModeData::Gpu(ref ctx) => {
                let spp = ShaderPreProcessor::new();
                ModeData::Gpu(GpuKernels::new(Arc::clone(ctx), &spp, options.depth_convention)?)
            }
            ModeData::Cpu(()) => ModeData::Cpu(()),
        };

        let occlusion_mode = options.resolve_occlusion_mode(mode);
        log::info!("Herd running in {mode:?} mode, occlusion culling through {occlusion_mode:?}");

        Ok(Self {
            mode,
            occlusion_mode,
            parameters: ParameterBuffer::new(context.clone()),
            context,
            kernels,
            options,
            profiles: FastHashMap::default(),
            lod_groups: FastHashMap::default(),
            groups: IndexMap::new(),
            source_groups: FastHashMap::default(),
            cameras: IndexMap::new(),
            frame: 0,
        })
    }

    pub fn mode(&self) -> RendererMode {
        self.mode
    }

    pub fn options(&self) -> &HerdOptions {
        &self.options
    }

    /// The occlusion strategy every camera uses, with `Auto` resolved.
    pub fn occlusion_mode(&self) -> OcclusionCullingMode {
        self.occlusion_mode
    }

    /// Number of frames finished by [`end_frame`](Self::end_frame).
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn parameters(&self) -> &ParameterBuffer {
        &self.parameters
    }

    /// Registers or replaces a profile. A replaced profile keeps its parameter record.
    pub fn register_profile(&mut self, id: ProfileId, profile: InstancingProfile) {
        match self.profiles.get_mut(&id) {
            Some(existing) => {
                log::debug!("Replacing profile {id:?}");
                existing.profile = profile;
                existing.set_parameter_buffer_data(&mut self.parameters);
            }
            None => {
                self.profiles.insert(id, ProfileData::new(id, profile, &mut self.parameters));
            }
        }
    }

    pub fn update_profile(&mut self, id: ProfileId, change: InstancingProfileChange) -> Result<(), HerdError> {
        let profile = self.profiles.get_mut(&id).ok_or(HerdError::UnknownProfile(id))?;
        profile.update(change, &mut self.parameters);
        Ok(())
    }

    pub fn profile(&self, id: ProfileId) -> Option<&ProfileData> {
        self.profiles.get(&id)
    }

    /// Registers or replaces a LOD group.
    ///
    /// Replacing one drops the camera regions of every group using it, so their
    /// draw arguments are rebuilt from the new levels on the next update, and
    /// forgets their animated cross-fades. Those groups also gain or lose their
    /// previous frame buffer with `has_object_motion`.
    pub fn register_lod_group(&mut self, descriptor: LodGroupDescriptor) -> Result<(), HerdError> {
        descriptor.validate()?;
        let id = descriptor.id;

        if self.lod_groups.contains_key(&id) {
            log::debug!("Replacing LOD group {id:?}");
            let motion_vectors = self.options.motion_vectors && descriptor.has_object_motion;
            for (key, group) in &mut self.groups {
                if group.descriptor().lod_group == id {
                    group.transforms_mut().set_motion_vectors(motion_vectors);
                    group.transforms_mut().reset_lod_states();
                    for camera in self.cameras.values_mut() {
                        camera.release_group(*key);
                    }
                }
            }
        }

        self.lod_groups.insert(id, LodGroupData::new(descriptor, &mut self.parameters));
        Ok(())
    }

    pub fn lod_group(&self, id: LodGroupId) -> Option<&LodGroupData> {
        self.lod_groups.get(&id)
    }

    /// Adds a render source for `owner` to the group `descriptor` identifies,
    /// creating the group if it doesn't exist yet.
    pub fn create_render_source(
        &mut self,
        owner: OwnerId,
        descriptor: RenderSourceGroupDescriptor,
    ) -> Result<RenderSourceKey, HerdError> {
        profiling::scope!("Herd::create_render_source");

        if !self.profiles.contains_key(&descriptor.profile) {
            return Err(HerdError::UnknownProfile(descriptor.profile));
        }
        let lod_group = self
            .lod_groups
            .get(&descriptor.lod_group)
            .ok_or(HerdError::UnknownLodGroup(descriptor.lod_group))?;
        let motion_vectors = self.options.motion_vectors && lod_group.descriptor.has_object_motion;

        let key = RenderSourceGroupKey::from_descriptor(&descriptor);
        let context = &self.context;
        let buffer_mode = self.options.buffer_mode;
        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| RenderSourceGroup::new(descriptor, context.clone(), buffer_mode, motion_vectors));

        let source = group.add_render_source(owner)?;
        self.source_groups.insert(source, key);
        Ok(source)
    }

    fn source_group_mut(&mut self, source: RenderSourceKey) -> Result<&mut RenderSourceGroup, HerdError> {
        let key = self
            .source_groups
            .get(&source)
            .ok_or(HerdError::UnknownRenderSource(source))?;
        self.groups.get_mut(key).ok_or(HerdError::UnknownRenderSource(source))
    }

    pub fn set_buffer_size(&mut self, source: RenderSourceKey, size: u32, copy_previous: bool) -> Result<(), HerdError> {
        self.source_group_mut(source)?.set_buffer_size(source, size, copy_previous)
    }

    pub fn set_instance_count(&mut self, source: RenderSourceKey, count: u32) -> Result<(), HerdError> {
        self.source_group_mut(source)?.set_instance_count(source, count)
    }

    /// See [`RenderSourceGroup::set_transform_buffer_data`].
    pub fn set_transform_buffer_data(
        &mut self,
        source: RenderSourceKey,
        matrices: &[Mat4],
        src_offset: usize,
        dst_offset: u32,
        count: usize,
        overwrite_previous: bool,
    ) -> Result<(), HerdError> {
        self.source_group_mut(source)?.set_transform_buffer_data(
            source,
            matrices,
            src_offset,
            dst_offset,
            count,
            overwrite_previous,
        )
    }

    /// Removes a render source. The last source of a group takes the group with it.
    pub fn dispose_render_source(&mut self, source: RenderSourceKey) -> Result<(), HerdError> {
        let key = self
            .source_groups
            .remove(&source)
            .ok_or(HerdError::UnknownRenderSource(source))?;
        let group = self.groups.get_mut(&key).ok_or(HerdError::UnknownRenderSource(source))?;

        if group.remove_render_source(source)? {
            self.groups.shift_remove(&key);
            for camera in self.cameras.values_mut() {
                camera.release_group(key);
            }
        }
        Ok(())
    }

    pub fn render_source(&self, source: RenderSourceKey) -> Option<&RenderSource> {
        let key = self.source_groups.get(&source)?;
        self.groups.get(key)?.source(source)
    }

    pub fn group(&self, key: RenderSourceGroupKey) -> Option<&RenderSourceGroup> {
        self.groups.get(&key)
    }

    pub fn group_mut(&mut self, key: RenderSourceGroupKey) -> Option<&mut RenderSourceGroup> {
        self.groups.get_mut(&key)
    }

    /// Key of the group a source belongs to.
    pub fn group_of(&self, source: RenderSourceKey) -> Option<RenderSourceGroupKey> {
        self.source_groups.get(&source).copied()
    }

    /// Every group, in creation order.
    pub fn groups(&self) -> impl ExactSizeIterator<Item = &RenderSourceGroup> + '_ {
        self.groups.values()
    }

    pub fn add_camera(&mut self, id: CameraId, camera: Camera, aspect_ratio: Option<f32>) -> Result<(), HerdError> {
        if self.cameras.contains_key(&id) {
            return Err(HerdError::DuplicateCamera(id));
        }
        let data = CameraData::new(
            id,
            camera,
            aspect_ratio,
            self.options.handedness,
            self.options.depth_convention,
            self.options.stereo,
            self.occlusion_mode,
            self.context.clone(),
        );
        self.cameras.insert(id, data);
        Ok(())
    }

    /// Sets the view and projection of every eye. Takes effect on the next update.
    pub fn set_camera_data(&mut self, id: CameraId, eyes: &[Camera], aspect_ratio: Option<f32>) -> Result<(), HerdError> {
        let camera = self.cameras.get_mut(&id).ok_or(HerdError::UnknownCamera(id))?;
        camera.set_camera_data(eyes);
        camera.set_aspect_ratio(aspect_ratio);
        Ok(())
    }

    pub fn remove_camera(&mut self, id: CameraId) -> Result<(), HerdError> {
        let mut camera = self.cameras.shift_remove(&id).ok_or(HerdError::UnknownCamera(id))?;
        camera.release_buffers();
        for group in self.groups.values_mut() {
            group.transforms_mut().release_camera(id);
        }
        log::debug!("Removed camera {id:?}");
        Ok(())
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraData> {
        self.cameras.get(&id)
    }

    pub fn camera_mut(&mut self, id: CameraId) -> Option<&mut CameraData> {
        self.cameras.get_mut(&id)
    }

    pub fn cameras(&self) -> impl ExactSizeIterator<Item = &CameraData> + '_ {
        self.cameras.values()
    }

    /// Hook for hosts with a render graph, called before the graph executes.
    pub fn begin_rendering(&mut self) {
        for camera in self.cameras.values_mut() {
            camera.occlusion_mut().begin_rendering();
        }
    }

    fn create_encoder(&self, label: &str) -> Option<CommandEncoder> {
        match self.context {
            ModeData::Gpu(ref ctx) => Some(ctx.device.create_command_encoder(&CommandEncoderDescriptor { label: Some(label) })),
            ModeData::Cpu(()) => None,
        }
    }

    fn submit(&self, encoder: Option<CommandEncoder>) {
        if let (ModeData::Gpu(ctx), Some(encoder)) = (&self.context, encoder) {
            ctx.queue.submit(Some(encoder.finish()));
        }
    }

    /// Runs the camera's frame: matrices, Hi-Z if the strategy builds here,
    /// visibility of every group and the command update.
    ///
    /// Groups that can't be dispatched are logged and listed in the report.
    pub fn update_camera_data(
        &mut self,
        id: CameraId,
        depth: DepthSource<'_>,
        delta_time: f32,
    ) -> Result<CameraFrameReport, HerdError> {
        profiling::scope!("Herd::update_camera_data");

        let mut encoder = self.create_encoder("herd camera update");
        let camera = self.cameras.get_mut(&id).ok_or(HerdError::UnknownCamera(id))?;

        camera.update_matrices();
        if camera
            .occlusion_mut()
            .acquire(HiZTrigger::CameraUpdate, &depth, &self.kernels, encoder.as_mut())
        {
            camera.set_state(CameraState::HiZReady);
        }
        let hi_z_ready = camera.occlusion().is_ready();

        let buffer_mode = self.options.buffer_mode;
        let culling = camera.culling_camera(buffer_mode, delta_time);
        let mut report = CameraFrameReport {
            camera: id,
            frame: self.frame,
            groups_dispatched: 0,
            skipped: Vec::new(),
            occlusion_used: false,
        };

        camera.reclaim_holes();

        // Regions first, the visibility buffer must have its final size before clearing.
        let mut dispatches = Vec::with_capacity(self.groups.len());
        for (key, group) in &mut self.groups {
            if group.transforms().is_empty() {
                report.skipped.push((*key, SkipReason::NoTransforms));
                continue;
            }
            let descriptor = group.descriptor();
            let Some(profile) = self.profiles.get(&descriptor.profile) else {
                log::error!("Group {:016x}: profile {:?} is not registered, skipping", key.0, descriptor.profile);
                report.skipped.push((*key, SkipReason::MissingProfile));
                continue;
            };
            let Some(lod_group) = self.lod_groups.get(&descriptor.lod_group) else {
                log::error!("Group {:016x}: LOD group {:?} is not registered, skipping", key.0, descriptor.lod_group);
                report.skipped.push((*key, SkipReason::MissingLodGroup));
                continue;
            };

            let region = camera.ensure_region(*key, group.buffer_size(), &lod_group.descriptor);
            if group.instance_count() == 0 {
                report.skipped.push((*key, SkipReason::NoActiveInstances));
                continue;
            }

            dispatches.push((
                *key,
                GroupDispatch {
                    variant: PipelineVariant::resolve(profile, lod_group, hi_z_ready),
                    visibility_offset: region.offset,
                    lod_count: region.lod_count,
                    buffer_size: group.buffer_size(),
                    active_count: group.instance_count(),
                    profile_start: profile.parameter_start(),
                    lod_group_start: lod_group.parameter_start(),
                },
            ));

            if buffer_mode == BufferMode::CameraBased {
                let origin = camera.location();
                if let Some((transforms, relative)) = group.transforms_mut().stale_camera_relative(id, origin) {
                    match (&self.kernels, encoder.as_mut()) {
                        (ModeData::Gpu(kernels), Some(encoder)) => {
                            transforms.update_buffer_data(false);
                            relative.update_buffer_data(false);
                            if let (Some(src), Some(dst)) = (transforms.buffer(), relative.buffer()) {
                                kernels.dispatch_camera_relative(encoder, src, dst, transforms.len() as u32, origin)?;
                            }
                        }
                        _ => run_camera_relative(transforms.data(), relative.data_mut(), origin),
                    }
                }
            }
        }

        camera.counters_mut().clear(encoder.as_mut());
        camera.counters_mut().update_buffer_data(false);
        self.parameters.buffer_mut().update_buffer_data(false);

        for (key, dispatch) in &dispatches {
            let Some(group) = self.groups.get_mut(key) else {
                continue;
            };
            let (transforms, active_indexes) = group.dispatch_parts();
            let (transform_buffer, instance_data) =
                transforms.camera_buffers(id, dispatch.buffer_size as usize, dispatch.lod_count as usize);
            report.occlusion_used |= dispatch.variant.contains(PipelineVariant::OCCLUSION);

            match (&self.kernels, encoder.as_mut()) {
                (ModeData::Gpu(kernels), Some(encoder)) => {
                    transform_buffer.update_buffer_data(false);
                    active_indexes.update_buffer_data(false);
                    instance_data.visibility.update_buffer_data(false);
                    instance_data.lod_state.update_buffer_data(false);

                    let buffers = (
                        transform_buffer.buffer(),
                        active_indexes.buffer(),
                        self.parameters.buffer().buffer(),
                        camera.counters().buffer(),
                        instance_data.visibility.buffer(),
                        instance_data.lod_state.buffer(),
                    );
                    let (Some(transforms), Some(active), Some(parameters), Some(counters), Some(instances), Some(lod_states)) =
                        buffers
                    else {
                        log::error!("Group {:016x}: a kernel buffer was never uploaded, skipping", key.0);
                        report.skipped.push((*key, SkipReason::MissingBuffer));
                        continue;
                    };

                    kernels.dispatch_visibility(
                        encoder,
                        GpuVisibilityArgs {
                            camera: &culling,
                            dispatch,
                            transforms,
                            active_indexes: active,
                            parameters,
                            hi_z: camera.occlusion().hi_z(),
                            counters,
                            instances,
                            lod_states,
                        },
                    )?;
                }
                _ => {
                    let (counters, occlusion) = camera.visibility_parts();
                    run_visibility(CpuVisibilityArgs {
                        camera: &culling,
                        dispatch,
                        transforms: transform_buffer.data(),
                        active_indexes: active_indexes.data(),
                        parameters: self.parameters.data(),
                        hi_z: occlusion.hi_z().and_then(HiZPyramid::cpu),
                        counters: counters.kernel_output(),
                        instances: instance_data.visibility.kernel_output(),
                        lod_states: instance_data.lod_state.kernel_output(),
                    });
                }
            }
            report.groups_dispatched += 1;
        }
        camera.set_state(CameraState::VisibilityComputed);

        let multiplier = self.options.stereo.instance_count_multiplier();
        let (commands, command_visibility_index, counters) = camera.command_parts();
        match (&self.kernels, encoder.as_mut()) {
            (ModeData::Gpu(kernels), Some(encoder)) => {
                commands.update_buffer_data(false);
                command_visibility_index.update_buffer_data(false);
                if let (Some(command_buffer), Some(index_buffer), Some(counter_buffer)) =
                    (commands.buffer(), command_visibility_index.buffer(), counters.buffer())
                {
                    kernels.dispatch_command_update(
                        encoder,
                        command_buffer,
                        index_buffer,
                        counter_buffer,
                        commands.len() as u32,
                        multiplier,
                    )?;
                }
            }
            _ => run_command_update(
                commands.kernel_output(),
                command_visibility_index.data(),
                counters.data(),
                multiplier,
            ),
        }
        camera.set_state(CameraState::CommandBufferUpdated);

        self.submit(encoder);
        Ok(report)
    }

    /// Forwards a point of the camera's frame. Returns true if the Hi-Z pyramid was built.
    pub fn execute_camera_event(
        &mut self,
        id: CameraId,
        event: CameraEvent,
        depth: DepthSource<'_>,
    ) -> Result<bool, HerdError> {
        profiling::scope!("Herd::execute_camera_event");

        let mut encoder = self.create_encoder("herd camera event");
        let camera = self.cameras.get_mut(&id).ok_or(HerdError::UnknownCamera(id))?;
        let built = camera
            .occlusion_mut()
            .acquire(HiZTrigger::Camera(event), &depth, &self.kernels, encoder.as_mut());
        self.submit(encoder);
        Ok(built)
    }

    /// Finishes the frame: end of frame Hi-Z builds, then the previous frame
    /// snapshot of every motion vector group.
    ///
    /// Cameras missing from `depth` have no depth this frame.
    pub fn end_frame(&mut self, depth: &[(CameraId, DepthSource<'_>)]) {
        profiling::scope!("Herd::end_frame");

        let mut encoder = self.create_encoder("herd end of frame");
        for (id, camera) in &mut self.cameras {
            let source = depth
                .iter()
                .find(|(camera_id, _)| camera_id == id)
                .map_or(DepthSource::Unavailable, |&(_, source)| source);
            camera
                .occlusion_mut()
                .acquire(HiZTrigger::EndOfFrame, &source, &self.kernels, encoder.as_mut());
        }

        for group in self.groups.values_mut() {
            group.transforms_mut().update_data(self.frame, encoder.as_mut());
        }

        self.submit(encoder);
        self.frame += 1;
    }

    /// Drives in-flight readbacks of every camera and group buffer. Returns how many completed.
    pub fn poll_readbacks(&mut self) -> u32 {
        let mut completed = self.cameras.values_mut().map(CameraData::poll_readbacks).sum::<u32>();
        for group in self.groups.values_mut() {
            if matches!(group.transforms_mut().transforms_mut().poll_readback(), Ok(true)) {
                completed += 1;
            }
        }
        if matches!(self.parameters.buffer_mut().poll_readback(), Ok(true)) {
            completed += 1;
        }
        completed
    }
}
