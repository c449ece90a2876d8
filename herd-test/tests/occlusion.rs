use anyhow::Context;
use glam::{Mat4, UVec2, Vec3};
use herd::{
    occlusion::{CameraEvent, DepthImage, DepthSource},
    types::{DrawPass, InstancingProfile, OcclusionCullingMode, StereoMode},
    HerdOptions,
};
use herd_test::{cube_lod_group, grid, test_attr, TestScene, CAMERA};

fn occluding_profile() -> InstancingProfile {
    InstancingProfile {
        shadow_casting: false,
        ..Default::default()
    }
}

fn scene_with_mode(mode: OcclusionCullingMode) -> anyhow::Result<TestScene> {
    TestScene::new(
        HerdOptions {
            occlusion_mode: mode,
            ..Default::default()
        },
        occluding_profile(),
    )
}

/// Reversed depth of a wall facing the camera `distance` units ahead.
fn wall_depth(scene: &TestScene, distance: f32) -> anyhow::Result<f32> {
    let view_proj = scene.herd.camera(CAMERA).context("camera missing")?.view_proj(0);
    let clip = view_proj * Vec3::new(0.0, 0.0, distance).extend(1.0);
    Ok(clip.z / clip.w)
}

#[test_attr]
pub async fn pyramid_follows_depth_layout() -> anyhow::Result<()> {
    let mut scene = TestScene::new(Default::default(), occluding_profile())?;
    assert_eq!(scene.herd.occlusion_mode(), OcclusionCullingMode::DirectTextureAccess);

    let depth = DepthImage::filled(100, 60, 1, 0.0);
    scene.update(DepthSource::Cpu(&depth))?;
    scene.update(DepthSource::Cpu(&depth))?;
    {
        let occlusion = scene.herd.camera(CAMERA).context("camera missing")?.occlusion();
        let pyramid = occlusion.pyramid().context("no pyramid")?;
        assert_eq!(pyramid.size(), UVec2::new(100, 60));
        assert_eq!(pyramid.mip_count(), 7);
        assert_eq!(pyramid.cpu().map(|p| p.mip_size(6)), Some(UVec2::new(1, 1)));
        assert_eq!(occlusion.rebuild_count(), 1);
        assert!(occlusion.is_ready());
    }

    let resized = DepthImage::filled(300, 200, 1, 0.0);
    scene.update(DepthSource::Cpu(&resized))?;
    {
        let occlusion = scene.herd.camera(CAMERA).context("camera missing")?.occlusion();
        let pyramid = occlusion.pyramid().context("no pyramid")?;
        assert_eq!(pyramid.size(), UVec2::new(300, 200));
        assert_eq!(pyramid.mip_count(), 9);
        assert_eq!(occlusion.rebuild_count(), 2);
    }

    scene.update(DepthSource::Unavailable)?;
    let occlusion = scene.herd.camera(CAMERA).context("camera missing")?.occlusion();
    assert!(occlusion.pyramid().is_none());
    assert!(!occlusion.is_ready());

    Ok(())
}

#[test_attr]
pub async fn wall_occludes_everything_behind_it() -> anyhow::Result<()> {
    let mut scene = TestScene::new(Default::default(), occluding_profile())?;
    let source = scene.add_source(1, &cube_lod_group(1, 2), &grid(Vec3::new(-3.0, -1.0, 10.0), 6, 36, 1.5))?;
    let key = scene.group_key(source)?;

    let open = DepthImage::filled(64, 64, 1, 0.0);
    let report = scene.update(DepthSource::Cpu(&open))?;
    assert!(report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 36);

    let wall = DepthImage::filled(64, 64, 1, wall_depth(&scene, 5.0)?);
    let report = scene.update(DepthSource::Cpu(&wall))?;
    assert!(report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 0);
    assert!(scene.draw_instance_counts(key, DrawPass::Main)?.iter().all(|&count| count == 0));

    // A wall behind the instances hides nothing.
    let far_wall = DepthImage::filled(64, 64, 1, wall_depth(&scene, 100.0)?);
    scene.update(DepthSource::Cpu(&far_wall))?;
    assert_eq!(scene.visible(key, DrawPass::Main)?, 36);

    // Neither does a wall the profile doesn't cull against.
    scene.herd.update_profile(
        herd_test::PROFILE,
        herd::types::InstancingProfileChange {
            occlusion_culling: Some(false),
            ..Default::default()
        },
    )?;
    let report = scene.update(DepthSource::Cpu(&wall))?;
    assert!(!report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 36);

    Ok(())
}

#[test_attr]
pub async fn end_of_frame_builds_for_next_frame() -> anyhow::Result<()> {
    let mut scene = scene_with_mode(OcclusionCullingMode::CommandBufferExecutedOnEndRendering)?;
    let source = scene.add_source(1, &cube_lod_group(1, 1), &grid(Vec3::new(-3.0, -1.0, 10.0), 6, 36, 1.5))?;
    let key = scene.group_key(source)?;

    scene.update(DepthSource::Unavailable)?;
    let wall = DepthImage::filled(32, 32, 1, wall_depth(&scene, 5.0)?);

    let report = scene.update(DepthSource::Cpu(&wall))?;
    assert!(!report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 36);

    scene.herd.end_frame(&[(CAMERA, DepthSource::Cpu(&wall))]);
    let report = scene.update(DepthSource::Unavailable)?;
    assert!(report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 0);

    // No depth for the camera at the end of this frame.
    scene.herd.end_frame(&[]);
    let report = scene.update(DepthSource::Unavailable)?;
    assert!(!report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 36);

    Ok(())
}

#[test_attr]
pub async fn recorded_commands_are_replayed() -> anyhow::Result<()> {
    let mut scene = scene_with_mode(OcclusionCullingMode::CommandBufferAddedToCamera)?;
    let depth = DepthImage::filled(32, 16, 1, 0.0);

    assert!(!scene.herd.execute_camera_event(CAMERA, CameraEvent::RenderGraphPass, DepthSource::Cpu(&depth))?);
    for _ in 0..3 {
        assert!(scene.herd.execute_camera_event(CAMERA, CameraEvent::AfterDepthPrepass, DepthSource::Cpu(&depth))?);
    }
    let occlusion = scene.herd.camera(CAMERA).context("camera missing")?.occlusion();
    assert_eq!(occlusion.recordings(), 1);
    assert_eq!(occlusion.rebuild_count(), 1);

    let resized = DepthImage::filled(64, 16, 1, 0.0);
    scene
        .herd
        .execute_camera_event(CAMERA, CameraEvent::AfterDepthPrepass, DepthSource::Cpu(&resized))?;
    let occlusion = scene.herd.camera(CAMERA).context("camera missing")?.occlusion();
    assert_eq!(occlusion.recordings(), 2);
    assert_eq!(occlusion.rebuild_count(), 2);

    Ok(())
}

#[test_attr]
pub async fn render_graph_pass_runs_once_per_enqueue() -> anyhow::Result<()> {
    let mut scene = scene_with_mode(OcclusionCullingMode::RenderGraphPass)?;
    let depth = DepthImage::filled(16, 16, 1, 0.0);
    let event = CameraEvent::RenderGraphPass;

    assert!(!scene.herd.execute_camera_event(CAMERA, event, DepthSource::Cpu(&depth))?);
    scene.herd.begin_rendering();
    assert!(scene.herd.execute_camera_event(CAMERA, event, DepthSource::Cpu(&depth))?);
    assert!(!scene.herd.execute_camera_event(CAMERA, event, DepthSource::Cpu(&depth))?);

    Ok(())
}

#[test_attr]
pub async fn depth_needs_a_layer_per_eye() -> anyhow::Result<()> {
    let options = HerdOptions {
        stereo: StereoMode::SinglePassInstanced,
        occlusion_mode: OcclusionCullingMode::DirectTextureAccess,
        ..Default::default()
    };
    let mut scene = TestScene::new(options, occluding_profile())?;
    let eye = TestScene::camera(Mat4::IDENTITY);
    scene.herd.set_camera_data(CAMERA, &[eye, eye], Some(1.0))?;
    let source = scene.add_source(1, &cube_lod_group(1, 1), &grid(Vec3::new(-3.0, -1.0, 10.0), 6, 36, 1.5))?;
    let key = scene.group_key(source)?;

    scene.update(DepthSource::Unavailable)?;
    let unoccluded = scene.visible(key, DrawPass::Main)?;
    assert!(unoccluded > 0);

    let depth = wall_depth(&scene, 5.0)?;
    let stereo_wall = DepthImage::filled(64, 64, 2, depth);
    let report = scene.update(DepthSource::Cpu(&stereo_wall))?;
    assert!(report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, 0);

    // One layer for two eyes is a configuration error, culling goes on without occlusion.
    let mono_wall = DepthImage::filled(64, 64, 1, depth);
    let report = scene.update(DepthSource::Cpu(&mono_wall))?;
    assert!(!report.occlusion_used);
    assert_eq!(scene.visible(key, DrawPass::Main)?, unoccluded);
    let camera = scene.herd.camera(CAMERA).context("camera missing")?;
    assert!(camera.occlusion().pyramid().is_none());

    Ok(())
}
