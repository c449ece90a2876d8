//! Reference kernels running over the buffer mirrors in cpu mode.

use arrayvec::ArrayVec;
use glam::{Mat4, UVec2, Vec2, Vec3, Vec4Swizzles};
use herd_types::{
    DepthConvention, DrawPass, IndirectDrawArgs, InstanceLodState, InstanceVisibility, VisibilityFlags,
    LOD_STATE_UNSET,
};

use crate::{
    culling::{CullingCamera, GroupDispatch, PipelineVariant, MAX_OCCLUSION_SAMPLES},
    occlusion::CpuPyramid,
    parameter::{LodGroupParams, ProfileFlags, ProfileParams},
    util::frustum::BoundingSphere,
};

/// One entry an instance adds to a (pass, LOD) list.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Append {
    pub pass: DrawPass,
    pub lod: u32,
    pub fade: f32,
    pub flags: VisibilityFlags,
}

impl Append {
    fn main(lod: u32, fade: f32, flags: VisibilityFlags) -> Self {
        Self {
            pass: DrawPass::Main,
            lod,
            fade,
            flags: VisibilityFlags::VISIBLE | flags,
        }
    }
}

fn reset_lod_state(state: &mut InstanceLodState) {
    state.lod = LOD_STATE_UNSET;
    state.previous_lod = LOD_STATE_UNSET;
    state.fade_progress = 1.0;
}

/// Occlusion test of a sphere against one eye of the pyramid.
///
/// Anything crossing the camera plane counts as visible.
#[allow(clippy::too_many_arguments)]
pub fn is_occluded(
    sphere: BoundingSphere,
    view_proj: Mat4,
    eye: u32,
    eye_count: u32,
    pyramid: &CpuPyramid,
    depth: DepthConvention,
    accuracy: u32,
    offset: f32,
) -> bool {
    let mut min_uv = Vec2::ONE;
    let mut max_uv = Vec2::ZERO;
    let mut box_nearest = depth.far_value();
    for corner in 0..8u32 {
        let sign = Vec3::new(
            if corner & 1 != 0 { 1.0 } else { -1.0 },
            if corner & 2 != 0 { 1.0 } else { -1.0 },
            if corner & 4 != 0 { 1.0 } else { -1.0 },
        );
        let clip = view_proj * (sphere.center + sign * sphere.radius).extend(1.0);
        if clip.w <= 0.0 {
            return false;
        }
        let ndc = clip.xyz() / clip.w;
        let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        min_uv = min_uv.min(uv);
        max_uv = max_uv.max(uv);
        box_nearest = depth.nearest(box_nearest, ndc.z);
    }
    min_uv = min_uv.clamp(Vec2::ZERO, Vec2::ONE);
    max_uv = max_uv.clamp(Vec2::ZERO, Vec2::ONE);

    let eye_scale = 1.0 / eye_count as f32;
    min_uv.x = (min_uv.x + eye as f32) * eye_scale;
    max_uv.x = (max_uv.x + eye as f32) * eye_scale;

    let size = pyramid.mip_size(0).as_vec2();
    let extent = (max_uv - min_uv) * size;
    let texels = extent.x.max(extent.y).max(1.0);
    let ideal = texels.log2().ceil() as i32 - accuracy as i32;
    let mip = ideal.clamp(0, pyramid.mip_count() as i32 - 1) as u32;

    let mip_size = pyramid.mip_size(mip);
    let last = mip_size - UVec2::ONE;
    let lo = (min_uv * mip_size.as_vec2()).floor().as_uvec2().min(last);
    let hi = (max_uv * mip_size.as_vec2())
        .floor()
        .as_uvec2()
        .min(last)
        .min(lo + UVec2::splat(MAX_OCCLUSION_SAMPLES - 1));

    let mut occluder = pyramid.load(mip, lo.x, lo.y);
    for y in lo.y..=hi.y {
        for x in lo.x..=hi.x {
            occluder = depth.farthest(occluder, pyramid.load(mip, x, y));
        }
    }

    let biased = match depth {
        DepthConvention::Standard => occluder + offset,
        DepthConvention::Reversed => occluder - offset,
    };
    depth.is_farther(box_nearest, biased)
}

/// Decides what a single instance draws this frame.
///
/// `state` is the instance's animated cross-fade memory and is updated in place.
pub fn evaluate_instance(
    camera: &CullingCamera,
    variant: PipelineVariant,
    profile: &ProfileParams,
    lod_group: &LodGroupParams,
    transform: Mat4,
    hi_z: Option<&CpuPyramid>,
    state: &mut InstanceLodState,
) -> ArrayVec<Append, 3> {
    let mut appends = ArrayVec::new();

    let sphere = lod_group.sphere.apply_transform(transform);
    let distance = (sphere.center - camera.position).length();
    if distance > profile.max_distance + sphere.radius {
        reset_lod_state(state);
        return appends;
    }
    let near = distance < profile.min_culling_distance;
    let eyes = 0..camera.eye_count.clamp(1, 2);

    let mut visible = true;
    if variant.contains(PipelineVariant::FRUSTUM) && !near {
        visible = eyes
            .clone()
            .any(|eye| camera.frustums[eye as usize].contains_sphere(sphere, profile.frustum_offset));
    }
    if let (true, Some(pyramid)) = (variant.contains(PipelineVariant::OCCLUSION), hi_z) {
        if !near && visible {
            visible = !eyes.clone().all(|eye| {
                is_occluded(
                    sphere,
                    camera.view_proj[eye as usize],
                    eye,
                    camera.eye_count,
                    pyramid,
                    camera.depth,
                    profile.occlusion_accuracy,
                    profile.occlusion_offset,
                )
            });
        }
    }

    let lod_count = lod_group.lod_count;
    let mut lod = 0;
    let mut height = 0.0;
    if variant.contains(PipelineVariant::LOD) {
        height = camera.relative_height(distance, sphere.radius) * profile.lod_bias;
        match (0..lod_count).find(|&l| height >= lod_group.thresholds[l as usize]) {
            Some(selected) => lod = selected,
            None => {
                reset_lod_state(state);
                return appends;
            }
        }
    }

    if visible {
        append_main(camera, variant, profile, lod_group, lod, height, state, &mut appends);
    } else {
        reset_lod_state(state);
    }

    if variant.contains(PipelineVariant::SHADOWS)
        && distance - sphere.radius <= profile.shadow_distance
        && (visible || !profile.flags.contains(ProfileFlags::CULL_SHADOWS))
    {
        appends.push(Append {
            pass: DrawPass::Shadow,
            lod: lod_group.shadow_lods[lod as usize],
            fade: 1.0,
            flags: VisibilityFlags::VISIBLE | VisibilityFlags::SHADOW,
        });
    }

    appends
}

#[allow(clippy::too_many_arguments)]
fn append_main(
    camera: &CullingCamera,
    variant: PipelineVariant,
    profile: &ProfileParams,
    lod_group: &LodGroupParams,
    lod: u32,
    height: f32,
    state: &mut InstanceLodState,
    appends: &mut ArrayVec<Append, 3>,
) {
    if variant.contains(PipelineVariant::CROSSFADE) {
        let threshold = lod_group.thresholds[lod as usize];
        let width = profile.crossfade_width;
        if lod + 1 < lod_group.lod_count && width > 0.0 && height < threshold * (1.0 + width) {
            let t = ((height - threshold) / (threshold * width)).clamp(0.0, 1.0);
            appends.push(Append::main(lod, t, VisibilityFlags::CROSSFADING));
            appends.push(Append::main(lod + 1, 1.0 - t, VisibilityFlags::CROSSFADING));
            return;
        }
    }

    if variant.contains(PipelineVariant::CROSSFADE_ANIMATED) {
        // Covers unset states and states left over from a replaced LOD group.
        if state.lod >= lod_group.lod_count || state.previous_lod >= lod_group.lod_count {
            *state = InstanceLodState {
                lod,
                previous_lod: lod,
                fade_progress: 1.0,
                _padding: 0,
            };
        } else if state.lod != lod {
            state.previous_lod = state.lod;
            state.lod = lod;
            state.fade_progress = 0.0;
        }
        if state.fade_progress < 1.0 {
            state.fade_progress = if profile.crossfade_duration > 0.0 {
                (state.fade_progress + camera.delta_time / profile.crossfade_duration).min(1.0)
            } else {
                1.0
            };
        }
        if state.fade_progress < 1.0 && state.previous_lod != state.lod {
            appends.push(Append::main(state.lod, state.fade_progress, VisibilityFlags::CROSSFADING));
            appends.push(Append::main(
                state.previous_lod,
                1.0 - state.fade_progress,
                VisibilityFlags::CROSSFADING,
            ));
            return;
        }
    }

    appends.push(Append::main(lod, 1.0, VisibilityFlags::empty()));
}

/// Inputs of one group's visibility dispatch.
pub struct CpuVisibilityArgs<'a> {
    pub camera: &'a CullingCamera,
    pub dispatch: &'a GroupDispatch,
    pub transforms: &'a [Mat4],
    pub active_indexes: &'a [u32],
    pub parameters: &'a [f32],
    pub hi_z: Option<&'a CpuPyramid>,
    /// The camera's whole visibility buffer.
    pub counters: &'a mut [u32],
    pub instances: &'a mut [InstanceVisibility],
    pub lod_states: &'a mut [InstanceLodState],
}

/// Visibility kernel of one group.
pub fn run_visibility(args: CpuVisibilityArgs<'_>) {
    profiling::scope!("cpu visibility");

    let dispatch = args.dispatch;
    let profile = ProfileParams::read(args.parameters, dispatch.profile_start);
    let lod_group = LodGroupParams::read(args.parameters, dispatch.lod_group_start);

    for &index in args.active_indexes.iter().take(dispatch.active_count as usize) {
        let (Some(&transform), Some(state)) = (
            args.transforms.get(index as usize),
            args.lod_states.get_mut(index as usize),
        ) else {
            continue;
        };

        let appends = evaluate_instance(
            args.camera,
            dispatch.variant,
            &profile,
            &lod_group,
            transform,
            args.hi_z,
            state,
        );

        for append in appends {
            let bucket = dispatch.bucket(append.pass as u32, append.lod);
            let counter = &mut args.counters[(dispatch.visibility_offset + bucket) as usize];
            let slot = *counter;
            *counter += 1;
            if slot < dispatch.buffer_size {
                args.instances[(bucket * dispatch.buffer_size + slot) as usize] = InstanceVisibility {
                    transform_index: index,
                    fade: append.fade,
                    lod: append.lod,
                    flags: append.flags.bits(),
                };
            }
        }
    }
}

/// Camera relative copy of `transforms`, translated so `origin` sits at the origin.
pub fn run_camera_relative(transforms: &[Mat4], relative: &mut [Mat4], origin: Vec3) {
    profiling::scope!("cpu camera relative");

    let offset = origin.extend(0.0);
    for (dst, src) in relative.iter_mut().zip(transforms) {
        *dst = *src;
        dst.w_axis -= offset;
    }
}

/// Command update kernel: copies visible counts into the indirect arguments.
///
/// Entries whose index is `u32::MAX` belong to released groups and draw nothing.
pub fn run_command_update(
    commands: &mut [IndirectDrawArgs],
    command_visibility_index: &[u32],
    counters: &[u32],
    multiplier: u32,
) {
    profiling::scope!("cpu command update");

    for (command, &index) in commands.iter_mut().zip(command_visibility_index) {
        command.instance_count = counters
            .get(index as usize)
            .map_or(0, |&count| count * multiplier);
    }
}

#[cfg(test)]
mod test {
    use glam::{Mat4, Vec3};
    use herd_types::{DepthConvention, DrawPass, InstanceLodState, VisibilityFlags, LOD_STATE_UNSET, MAX_LOD};

    use super::{evaluate_instance, is_occluded, run_command_update};
    use crate::{
        culling::{CullingCamera, PipelineVariant},
        occlusion::{DepthImage, HiZPyramid},
        parameter::{LodGroupFlags, LodGroupParams, ProfileFlags, ProfileParams},
        util::frustum::{BoundingSphere, ShaderFrustum},
        ModeData,
    };

    fn camera() -> CullingCamera {
        let proj = Mat4::perspective_infinite_reverse_lh(std::f32::consts::FRAC_PI_2, 1.0, 0.1);
        CullingCamera {
            view_proj: [proj; 2],
            frustums: [ShaderFrustum::from_matrix(proj, DepthConvention::Reversed); 2],
            eye_count: 1,
            position: Vec3::ZERO,
            tan_half_fov: 1.0,
            ortho_height: 0.0,
            depth: DepthConvention::Reversed,
            delta_time: 0.1,
        }
    }

    fn profile(flags: ProfileFlags) -> ProfileParams {
        ProfileParams {
            min_culling_distance: 0.0,
            max_distance: 100.0,
            frustum_offset: 0.0,
            occlusion_offset: 0.0,
            occlusion_accuracy: 1,
            flags,
            lod_bias: 1.0,
            shadow_distance: 20.0,
            crossfade_width: 0.5,
            crossfade_duration: 0.25,
        }
    }

    fn lod_group() -> LodGroupParams {
        let mut thresholds = [0.0; MAX_LOD];
        thresholds[..3].copy_from_slice(&[0.5, 0.1, 0.02]);
        let mut shadow_lods = [0; MAX_LOD];
        shadow_lods[..3].copy_from_slice(&[2, 2, 2]);
        LodGroupParams {
            sphere: BoundingSphere {
                center: Vec3::ZERO,
                radius: 1.0,
            },
            lod_count: 3,
            flags: LodGroupFlags::CASTS_SHADOWS,
            thresholds,
            shadow_lods,
        }
    }

    fn unset() -> InstanceLodState {
        InstanceLodState {
            lod: LOD_STATE_UNSET,
            previous_lod: LOD_STATE_UNSET,
            fade_progress: 1.0,
            _padding: 0,
        }
    }

    fn at(z: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(0.0, 0.0, z))
    }

    #[test]
    fn lod_follows_relative_height() {
        let variant = PipelineVariant::LOD | PipelineVariant::FRUSTUM;
        let profile = profile(ProfileFlags::FRUSTUM_CULLING);
        let mut state = unset();

        // h = 2 / (2 * d) = 1 / d
        for (distance, lod) in [(1.5, 0), (5.0, 1), (20.0, 2)] {
            let appends = evaluate_instance(&camera(), variant, &profile, &lod_group(), at(distance), None, &mut state);
            assert_eq!(appends.len(), 1);
            assert_eq!(appends[0].lod, lod, "distance {distance}");
        }

        // Below the last threshold nothing is drawn.
        let appends = evaluate_instance(&camera(), variant, &profile, &lod_group(), at(80.0), None, &mut state);
        assert!(appends.is_empty());
    }

    #[test]
    fn distance_and_frustum() {
        let variant = PipelineVariant::FRUSTUM;
        let mut state = unset();
        let p = profile(ProfileFlags::FRUSTUM_CULLING);

        assert!(evaluate_instance(&camera(), variant, &p, &lod_group(), at(-10.0), None, &mut state).is_empty());
        assert!(evaluate_instance(&camera(), variant, &p, &lod_group(), at(150.0), None, &mut state).is_empty());
        assert_eq!(evaluate_instance(&camera(), variant, &p, &lod_group(), at(10.0), None, &mut state).len(), 1);

        let near = ProfileParams {
            min_culling_distance: 20.0,
            ..p
        };
        assert_eq!(evaluate_instance(&camera(), variant, &near, &lod_group(), at(-10.0), None, &mut state).len(), 1);
    }

    #[test]
    fn shadows_use_shadow_lod_and_ignore_frustum_unless_asked() {
        let variant = PipelineVariant::FRUSTUM | PipelineVariant::SHADOWS;
        let mut state = unset();

        let behind = evaluate_instance(
            &camera(),
            variant,
            &profile(ProfileFlags::FRUSTUM_CULLING | ProfileFlags::SHADOW_CASTING),
            &lod_group(),
            at(-10.0),
            None,
            &mut state,
        );
        assert_eq!(behind.len(), 1);
        assert_eq!(behind[0].pass, DrawPass::Shadow);
        assert_eq!(behind[0].lod, 2);
        assert!(behind[0].flags.contains(VisibilityFlags::SHADOW));

        let culled = evaluate_instance(
            &camera(),
            variant,
            &profile(ProfileFlags::FRUSTUM_CULLING | ProfileFlags::SHADOW_CASTING | ProfileFlags::CULL_SHADOWS),
            &lod_group(),
            at(-10.0),
            None,
            &mut state,
        );
        assert!(culled.is_empty());

        let far = evaluate_instance(
            &camera(),
            variant,
            &profile(ProfileFlags::SHADOW_CASTING),
            &lod_group(),
            at(50.0),
            None,
            &mut state,
        );
        assert_eq!(far.len(), 1);
        assert_eq!(far[0].pass, DrawPass::Main);
    }

    #[test]
    fn distance_crossfade_draws_both_levels() {
        let variant = PipelineVariant::LOD | PipelineVariant::CROSSFADE;
        let mut state = unset();
        // h = 1 / 1.8 ~ 0.555, inside 0.5 * 1.5
        let appends = evaluate_instance(
            &camera(),
            variant,
            &profile(ProfileFlags::LOD_CROSSFADE),
            &lod_group(),
            at(1.8),
            None,
            &mut state,
        );
        assert_eq!(appends.len(), 2);
        assert_eq!((appends[0].lod, appends[1].lod), (0, 1));
        assert!((appends[0].fade + appends[1].fade - 1.0).abs() < 1e-6);
        assert!(appends[0].flags.contains(VisibilityFlags::CROSSFADING));
    }

    #[test]
    fn animated_crossfade_progresses() {
        let variant = PipelineVariant::LOD | PipelineVariant::CROSSFADE_ANIMATED;
        let p = profile(ProfileFlags::LOD_CROSSFADE | ProfileFlags::ANIMATE_CROSSFADE);
        let mut state = unset();

        let first = evaluate_instance(&camera(), variant, &p, &lod_group(), at(1.5), None, &mut state);
        assert_eq!(first.len(), 1);
        assert_eq!(state.lod, 0);

        // dt 0.1 over 0.25s
        let switched = evaluate_instance(&camera(), variant, &p, &lod_group(), at(5.0), None, &mut state);
        assert_eq!(switched.len(), 2);
        assert_eq!((switched[0].lod, switched[1].lod), (1, 0));
        assert!((switched[0].fade - 0.4).abs() < 1e-5);

        evaluate_instance(&camera(), variant, &p, &lod_group(), at(5.0), None, &mut state);
        let done = evaluate_instance(&camera(), variant, &p, &lod_group(), at(5.0), None, &mut state);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].lod, 1);
        assert_eq!(state.fade_progress, 1.0);

        evaluate_instance(&camera(), variant, &p, &lod_group(), at(500.0), None, &mut state);
        assert_eq!(state.lod, LOD_STATE_UNSET);
    }

    #[test]
    fn stale_lod_states_restart() {
        let variant = PipelineVariant::LOD | PipelineVariant::CROSSFADE_ANIMATED;
        let p = profile(ProfileFlags::LOD_CROSSFADE | ProfileFlags::ANIMATE_CROSSFADE);
        let mut state = InstanceLodState {
            lod: 4,
            previous_lod: 4,
            fade_progress: 1.0,
            _padding: 0,
        };

        let appends = evaluate_instance(&camera(), variant, &p, &lod_group(), at(5.0), None, &mut state);
        assert_eq!(appends.len(), 1);
        assert_eq!(appends[0].lod, 1);
        assert_eq!((state.lod, state.previous_lod), (1, 1));
    }

    #[test]
    fn occlusion_against_wall() {
        let mut image = DepthImage::filled(64, 64, 1, 0.0);
        let mut pyramid = HiZPyramid::new(glam::UVec2::new(64, 64), 1, DepthConvention::Reversed, &ModeData::Cpu(()));
        let camera = camera();

        // A wall at distance 5 covering the whole screen.
        let wall = camera.view_proj[0] * Vec3::new(0.0, 0.0, 5.0).extend(1.0);
        image.data_mut().fill(wall.z / wall.w);
        pyramid.generate_cpu(&image);
        let cpu = pyramid.cpu().unwrap();

        let sphere = |z: f32| BoundingSphere {
            center: Vec3::new(0.0, 0.0, z),
            radius: 0.5,
        };
        let test = |z: f32| is_occluded(sphere(z), camera.view_proj[0], 0, 1, cpu, DepthConvention::Reversed, 1, 0.0);
        assert!(test(20.0));
        assert!(!test(2.0));
        // Crossing the camera plane is never occluded.
        assert!(!test(0.0));
    }

    #[test]
    fn command_update_applies_multiplier_and_holes() {
        let mut commands = vec![herd_types::IndirectDrawArgs::default(); 3];
        run_command_update(&mut commands, &[0, u32::MAX, 1], &[3, 5], 2);
        let counts: Vec<_> = commands.iter().map(|c| c.instance_count).collect();
        assert_eq!(counts, [6, 0, 10]);
    }
}
