use glam::{Mat4, Vec3, Vec4};
use herd::types::{Bounds, LodGroupDescriptor, LodGroupId, LodLevel, SubMeshDraw};

/// A LOD group of unit cubes with one submesh per level.
///
/// The thresholds are small enough that nothing in a test scene is LOD culled.
pub fn cube_lod_group(id: u64, lod_count: u32) -> LodGroupDescriptor {
    LodGroupDescriptor {
        id: LodGroupId(id),
        bounds: Bounds {
            center: Vec3::ZERO,
            extents: Vec3::splat(0.5),
        },
        lods: (0..lod_count)
            .map(|lod| LodLevel {
                screen_relative_height: 0.1 / 10f32.powi(lod as i32 + 1),
                submeshes: vec![SubMeshDraw {
                    index_count: 36 >> lod.min(2),
                    first_index: 36 * lod,
                    base_vertex: 0,
                }],
            })
            .collect(),
        shadow_lod_map: Vec::new(),
        has_object_motion: false,
        casts_shadows: true,
    }
}

/// `count` translations laid out row by row on the xz plane, `spacing` apart, starting at `origin`.
pub fn grid(origin: Vec3, columns: u32, count: u32, spacing: f32) -> Vec<Mat4> {
    (0..count)
        .map(|i| {
            let offset = Vec3::new((i % columns) as f32, 0.0, (i / columns) as f32) * spacing;
            Mat4::from_translation(origin + offset)
        })
        .collect()
}

/// Brute force frustum test of a sphere against `view_proj`, for checking the kernels.
///
/// Planes come straight from the rows of the matrix; the near plane is the
/// reversed depth one at `z = w`.
pub fn sphere_in_frustum(view_proj: Mat4, center: Vec3, radius: f32, offset: f32) -> bool {
    let r0 = view_proj.row(0);
    let r1 = view_proj.row(1);
    let r2 = view_proj.row(2);
    let r3 = view_proj.row(3);

    [r3 + r0, r3 - r0, r3 - r1, r3 + r1, r3 - r2].into_iter().all(|plane: Vec4| {
        let normal_length = plane.truncate().length();
        let plane = plane / normal_length;
        plane.truncate().dot(center) + plane.w >= -(radius + offset)
    })
}

/// How many of `transforms` pass [`sphere_in_frustum`] with the bounds of `lod_group`.
pub fn brute_force_visible(view_proj: Mat4, transforms: &[Mat4], lod_group: &LodGroupDescriptor, offset: f32) -> u32 {
    let radius = lod_group.bounds.sphere_radius();
    transforms
        .iter()
        .filter(|transform| {
            let center = transform.transform_point3(lod_group.bounds.center);
            sphere_in_frustum(view_proj, center, radius, offset)
        })
        .count() as u32
}
