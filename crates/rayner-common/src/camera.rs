//! Orthographic camera and the uniform block it feeds.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Per-frame uniform data, one copy per frame slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub view_projection: [[f32; 4]; 4],
}

impl CameraUniform {
    pub fn new(view_projection: Mat4) -> Self {
        Self { view_projection: view_projection.to_cols_array_2d() }
    }
}

/// Orthographic projection plus a view transform.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    projection: Mat4,
    view: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Camera {
    /// Camera covering `[-aspect, aspect] x [-1, 1] x [-1, 1]`.
    pub fn new(aspect: f32) -> Self {
        let mut camera = Self { projection: Mat4::IDENTITY, view: Mat4::IDENTITY };
        camera.set_aspect(aspect);
        camera
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.set_orthographic(-aspect, aspect, -1.0, 1.0, -1.0, 1.0);
    }

    /// Vulkan-style orthographic projection (depth mapped to 0..1).
    pub fn set_orthographic(&mut self, left: f32, right: f32, top: f32, bottom: f32, near: f32, far: f32) {
        self.projection = Mat4::from_cols(
            Vec4::new(2.0 / (right - left), 0.0, 0.0, 0.0),
            Vec4::new(0.0, 2.0 / (bottom - top), 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0 / (far - near), 0.0),
            Vec4::new(
                -(right + left) / (right - left),
                -(bottom + top) / (bottom - top),
                -near / (far - near),
                1.0,
            ),
        );
    }

    /// View looking along `direction` from `position`.
    pub fn set_view_direction(&mut self, position: Vec3, direction: Vec3, up: Vec3) {
        let w = direction.normalize();
        let u = w.cross(up).normalize();
        let v = w.cross(u);
        self.view = basis_view(u, v, w, position);
    }

    /// View from Tait-Bryan angles applied in Y, X, Z order.
    pub fn set_view_yxz(&mut self, position: Vec3, rotation: Vec3) {
        let (s3, c3) = rotation.z.sin_cos();
        let (s2, c2) = rotation.x.sin_cos();
        let (s1, c1) = rotation.y.sin_cos();
        let u = Vec3::new(c1 * c3 + s1 * s2 * s3, c2 * s3, c1 * s2 * s3 - c3 * s1);
        let v = Vec3::new(c3 * s1 * s2 - c1 * s3, c2 * c3, c1 * c3 * s2 + s1 * s3);
        let w = Vec3::new(c2 * s1, -s2, c1 * c2);
        self.view = basis_view(u, v, w, position);
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn uniform(&self) -> CameraUniform {
        CameraUniform::new(self.projection * self.view)
    }
}

fn basis_view(u: Vec3, v: Vec3, w: Vec3, position: Vec3) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(u.x, v.x, w.x, 0.0),
        Vec4::new(u.y, v.y, w.y, 0.0),
        Vec4::new(u.z, v.z, w.z, 0.0),
        Vec4::new(-u.dot(position), -v.dot(position), -w.dot(position), 1.0),
    )
}

/// Held-key state sampled once per frame. Each axis is in `-1.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveInput {
    pub right: f32,
    pub up: f32,
    pub forward: f32,
    pub look_right: f32,
    pub look_up: f32,
}

/// Free-flying camera driven by [`MoveInput`].
#[derive(Debug, Clone, Copy)]
pub struct CameraController {
    pub position: Vec3,
    pub rotation: Vec3,
    pub move_speed: f32,
    pub look_speed: f32,
}

impl Default for CameraController {
    fn default() -> Self {
        Self {
            position: Vec3::new(-2.0, 0.0, 0.0),
            rotation: Vec3::new(0.0, 90f32.to_radians(), 0.0),
            move_speed: 3.0,
            look_speed: 1.0,
        }
    }
}

impl CameraController {
    /// Integrate one frame of input and write the result into `camera`.
    pub fn update(&mut self, input: MoveInput, dt: f32, camera: &mut Camera) {
        let look = Vec3::new(input.look_up, input.look_right, 0.0);
        if look.length_squared() > f32::EPSILON {
            self.rotation += self.look_speed * dt * look.normalize();
        }
        self.rotation.x = self.rotation.x.clamp(-1.5, 1.5);
        self.rotation.y = self.rotation.y.rem_euclid(std::f32::consts::TAU);

        let yaw = self.rotation.y;
        let forward = Vec3::new(yaw.sin(), 0.0, yaw.cos());
        let right = Vec3::new(forward.z, 0.0, -forward.x);
        let up = Vec3::new(0.0, -1.0, 0.0);

        let step = forward * input.forward + right * input.right + up * input.up;
        if step.length_squared() > f32::EPSILON {
            self.position += self.move_speed * dt * step.normalize();
        }

        camera.set_view_yxz(self.position, self.rotation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).abs().max_element() < 1e-5
    }

    // ============================================================
    // Projection
    // ============================================================

    #[test]
    fn test_orthographic_maps_corners_to_ndc() {
        let camera = Camera::new(2.0);
        let p = camera.projection();
        assert!(approx(p.project_point3(Vec3::new(2.0, 1.0, 1.0)), Vec3::new(1.0, 1.0, 1.0)));
        assert!(approx(p.project_point3(Vec3::new(-2.0, -1.0, -1.0)), Vec3::new(-1.0, -1.0, 0.0)));
    }

    #[test]
    fn test_set_aspect_rescales_x_only() {
        let mut camera = Camera::new(1.0);
        camera.set_aspect(4.0);
        let p = camera.projection().project_point3(Vec3::new(4.0, 0.5, 0.0));
        assert!(approx(p, Vec3::new(1.0, 0.5, 0.5)));
    }

    // ============================================================
    // View
    // ============================================================

    #[test]
    fn test_view_yxz_zero_rotation_is_translation() {
        let mut camera = Camera::default();
        camera.set_view_yxz(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        let moved = camera.view().transform_point3(Vec3::new(1.0, 2.0, 3.0));
        assert!(approx(moved, Vec3::ZERO));
    }

    #[test]
    fn test_view_direction_matches_yxz_for_forward_z() {
        let mut a = Camera::default();
        let mut b = Camera::default();
        a.set_view_direction(Vec3::ZERO, Vec3::Z, Vec3::new(0.0, -1.0, 0.0));
        b.set_view_yxz(Vec3::ZERO, Vec3::ZERO);
        let point = Vec3::new(0.3, -0.2, 0.7);
        assert!(approx(a.view().transform_point3(point), b.view().transform_point3(point)));
    }

    #[test]
    fn test_uniform_is_projection_times_view() {
        let mut camera = Camera::new(1.5);
        camera.set_view_yxz(Vec3::new(0.0, 0.0, -1.0), Vec3::ZERO);
        let expected = (camera.projection() * camera.view()).to_cols_array_2d();
        assert_eq!(camera.uniform().view_projection, expected);
    }

    // ============================================================
    // Controller
    // ============================================================

    #[test]
    fn test_controller_moves_forward() {
        let mut controller = CameraController {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            move_speed: 2.0,
            look_speed: 1.0,
        };
        let mut camera = Camera::default();
        controller.update(MoveInput { forward: 1.0, ..Default::default() }, 0.5, &mut camera);
        assert!(approx(controller.position, Vec3::new(0.0, 0.0, 1.0)));
    }

    #[test]
    fn test_controller_idle_input_keeps_position() {
        let mut controller = CameraController::default();
        let before = controller.position;
        controller.update(MoveInput::default(), 1.0, &mut Camera::default());
        assert_eq!(controller.position, before);
    }

    #[test]
    fn test_controller_clamps_pitch() {
        let mut controller = CameraController::default();
        controller.update(MoveInput { look_up: 1.0, ..Default::default() }, 100.0, &mut Camera::default());
        assert!(controller.rotation.x <= 1.5);
    }
}
