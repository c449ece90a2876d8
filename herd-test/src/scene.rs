use anyhow::Context;
use glam::{Mat4, Vec3};
use herd::{
    source::{RenderSourceGroupKey, RenderSourceKey},
    types::{
        Camera, CameraId, CameraProjection, DrawPass, InstancingProfile, LodGroupDescriptor, OwnerId, ProfileId,
        PrototypeId, RenderSourceGroupDescriptor,
    },
    occlusion::DepthSource,
    CameraFrameReport, Herd, HerdOptions, InstanceAdapterDevice,
};

pub const CAMERA: CameraId = CameraId(1);
pub const PROFILE: ProfileId = ProfileId(1);

/// A herd with one camera at the origin looking down +z and a single profile.
pub struct TestScene {
    pub herd: Herd,
    next_owner: u64,
}

impl TestScene {
    /// Cpu mode scene.
    pub fn new(options: HerdOptions, profile: InstancingProfile) -> anyhow::Result<Self> {
        Self::with_iad(None, options, profile)
    }

    pub fn with_iad(
        iad: Option<&InstanceAdapterDevice>,
        options: HerdOptions,
        profile: InstancingProfile,
    ) -> anyhow::Result<Self> {
        crate::init_logging();

        let mut herd = Herd::new(iad, options).context("Herd creation failed")?;
        herd.register_profile(PROFILE, profile);
        herd.add_camera(CAMERA, Self::camera(Mat4::IDENTITY), Some(1.0))?;
        Ok(Self { herd, next_owner: 0 })
    }

    /// 60 degree perspective camera with the given view matrix.
    pub fn camera(view: Mat4) -> Camera {
        Camera {
            projection: CameraProjection::Perspective { vfov: 60.0, near: 0.1 },
            view,
        }
    }

    /// Profile with only frustum culling.
    pub fn frustum_only_profile() -> InstancingProfile {
        InstancingProfile {
            occlusion_culling: false,
            shadow_casting: false,
            ..Default::default()
        }
    }

    pub fn group_descriptor(prototype: u64, lod_group: &LodGroupDescriptor) -> RenderSourceGroupDescriptor {
        RenderSourceGroupDescriptor {
            prototype: PrototypeId(prototype),
            profile: PROFILE,
            lod_group: lod_group.id,
            group_id: 0,
            shader_keywords: Vec::new(),
        }
    }

    /// Adds a source of `prototype` holding `transforms`, every one of them rendered.
    pub fn add_source(
        &mut self,
        prototype: u64,
        lod_group: &LodGroupDescriptor,
        transforms: &[Mat4],
    ) -> anyhow::Result<RenderSourceKey> {
        if self.herd.lod_group(lod_group.id).is_none() {
            self.herd.register_lod_group(lod_group.clone())?;
        }
        self.next_owner += 1;
        let source = self
            .herd
            .create_render_source(OwnerId(self.next_owner), Self::group_descriptor(prototype, lod_group))?;
        self.herd
            .set_transform_buffer_data(source, transforms, 0, 0, transforms.len(), true)?;
        self.herd.set_instance_count(source, transforms.len() as u32)?;
        Ok(source)
    }

    pub fn group_key(&self, source: RenderSourceKey) -> anyhow::Result<RenderSourceGroupKey> {
        self.herd.group_of(source).context("source has no group")
    }

    pub fn update(&mut self, depth: DepthSource<'_>) -> anyhow::Result<CameraFrameReport> {
        Ok(self.herd.update_camera_data(CAMERA, depth, 1.0 / 60.0)?)
    }

    /// Sum of the visible counts of every LOD of a group in `pass`.
    pub fn visible(&self, group: RenderSourceGroupKey, pass: DrawPass) -> anyhow::Result<u32> {
        let camera = self.herd.camera(CAMERA).context("camera missing")?;
        let region = camera.region(group).context("group has no region")?;
        Ok((0..region.lod_count)
            .filter_map(|lod| camera.visible_count(group, pass, lod))
            .sum())
    }

    /// Instance counts of a group's draws in `pass`, read from the command buffer mirror.
    pub fn draw_instance_counts(&self, group: RenderSourceGroupKey, pass: DrawPass) -> anyhow::Result<Vec<u32>> {
        let camera = self.herd.camera(CAMERA).context("camera missing")?;
        let commands = camera.commands().data();
        camera
            .indirect_draws(group, pass)
            .into_iter()
            .map(|draw| {
                let index = (draw.offset / herd::INDIRECT_ARGS_SIZE) as usize;
                commands
                    .get(index)
                    .map(|args| args.instance_count)
                    .context("draw outside the command buffer")
            })
            .collect()
    }

    pub fn camera_position(&self) -> Vec3 {
        self.herd.camera(CAMERA).map_or(Vec3::ZERO, |c| c.location())
    }
}
