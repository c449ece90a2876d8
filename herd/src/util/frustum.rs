//! Frustums and bounding spheres.
//!
//! Plane extraction follows <https://www.gamedevs.org/uploads/fast-extraction-viewing-frustum-planes-from-world-view-projection-matrix.pdf>.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};
use herd_types::{Bounds, DepthConvention};

/// Represents a point in space and a radius from that point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}
impl BoundingSphere {
    pub fn from_bounds(bounds: &Bounds) -> Self {
        Self {
            center: bounds.center,
            radius: bounds.sphere_radius(),
        }
    }

    /// Moves the sphere into the space of `transform`, scaling the radius by the largest axis scale.
    pub fn apply_transform(self, transform: Mat4) -> Self {
        let max_scale = transform
            .x_axis
            .xyz()
            .length_squared()
            .max(
                transform
                    .y_axis
                    .xyz()
                    .length_squared()
                    .max(transform.z_axis.xyz().length_squared()),
            )
            .sqrt();
        let center = transform * self.center.extend(1.0);

        Self {
            center: center.truncate(),
            radius: max_scale * self.radius,
        }
    }
}

/// Represents a plane as a vec4 (or vec3 + f32)
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ShaderPlane {
    pub abc: Vec3,
    pub d: f32,
}

impl ShaderPlane {
    pub fn new(a: f32, b: f32, c: f32, d: f32) -> Self {
        Self {
            abc: Vec3::new(a, b, c),
            d,
        }
    }

    pub fn normalize(mut self) -> Self {
        let mag = self.abc.length();

        self.abc /= mag;
        self.d /= mag;

        self
    }

    pub fn distance(self, point: Vec3) -> f32 {
        self.abc.dot(point) + self.d
    }

    pub fn to_vec4(self) -> Vec4 {
        self.abc.extend(self.d)
    }
}

/// A frustum composed of 5 different planes. Has no far plane as all
/// projections are infinite.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ShaderFrustum {
    left: ShaderPlane,
    right: ShaderPlane,
    top: ShaderPlane,
    bottom: ShaderPlane,
    near: ShaderPlane,
}

impl ShaderFrustum {
    pub fn from_matrix(matrix: Mat4, depth: DepthConvention) -> Self {
        let m = matrix.to_cols_array_2d();

        let left = ShaderPlane::new(m[0][3] + m[0][0], m[1][3] + m[1][0], m[2][3] + m[2][0], m[3][3] + m[3][0]);
        let right = ShaderPlane::new(m[0][3] - m[0][0], m[1][3] - m[1][0], m[2][3] - m[2][0], m[3][3] - m[3][0]);
        let top = ShaderPlane::new(m[0][3] - m[0][1], m[1][3] - m[1][1], m[2][3] - m[2][1], m[3][3] - m[3][1]);
        let bottom = ShaderPlane::new(m[0][3] + m[0][1], m[1][3] + m[1][1], m[2][3] + m[2][1], m[3][3] + m[3][1]);

        // Reversed depth has the near plane at z = w, standard depth at z = 0.
        let near = match depth {
            DepthConvention::Reversed => {
                ShaderPlane::new(m[0][3] - m[0][2], m[1][3] - m[1][2], m[2][3] - m[2][2], m[3][3] - m[3][2])
            }
            DepthConvention::Standard => ShaderPlane::new(m[0][2], m[1][2], m[2][2], m[3][2]),
        };

        Self {
            left: left.normalize(),
            right: right.normalize(),
            top: top.normalize(),
            bottom: bottom.normalize(),
            near: near.normalize(),
        }
    }

    pub fn planes(&self) -> [ShaderPlane; 5] {
        [self.left, self.right, self.top, self.bottom, self.near]
    }

    /// Determines if the sphere, grown by `offset`, is at all inside the frustum.
    pub fn contains_sphere(&self, sphere: BoundingSphere, offset: f32) -> bool {
        let neg_radius = -(sphere.radius + offset);

        self.planes()
            .iter()
            .all(|plane| plane.distance(sphere.center) >= neg_radius)
    }
}
