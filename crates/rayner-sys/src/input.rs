// input.rs -- keyboard to render command mapping and held-key camera input

use std::collections::HashSet;

use winit::keyboard::KeyCode;

use rayner_common::{MoveInput, RenderCommand};

/// Ray and point counts adjusted from the keyboard, clamped to capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub rays: u32,
    pub points: u32,
    pub max: u32,
}

impl Counts {
    pub fn new(rays: u32, points: u32, max: u32) -> Self {
        Self { rays: rays.min(max), points: points.min(max), max }
    }

    fn scale(value: u32, grow: bool, max: u32) -> u32 {
        if grow {
            value.saturating_mul(2).max(1).min(max)
        } else {
            value / 2
        }
    }
}

/// Translate a key press into a render command.
///
/// | key | command |
/// |---|---|
/// | 1 2 3 4 | toggle triangles, rays, points, hits |
/// | P / R | launch a point / ray trace |
/// | [ / ] | previous / next mesh subset |
/// | = / - | double / halve the ray count |
/// | . / , | double / halve the point count |
pub fn command_for_key(key: KeyCode, counts: &mut Counts) -> Option<RenderCommand> {
    let command = match key {
        KeyCode::Digit1 => RenderCommand::ToggleTriangles,
        KeyCode::Digit2 => RenderCommand::ToggleRays,
        KeyCode::Digit3 => RenderCommand::TogglePoints,
        KeyCode::Digit4 => RenderCommand::ToggleHits,
        KeyCode::KeyP => RenderCommand::LaunchPoints,
        KeyCode::KeyR => RenderCommand::LaunchRays,
        KeyCode::BracketRight => RenderCommand::NextSubset,
        KeyCode::BracketLeft => RenderCommand::PreviousSubset,
        KeyCode::Equal | KeyCode::Minus => {
            counts.rays = Counts::scale(counts.rays, key == KeyCode::Equal, counts.max);
            RenderCommand::SetRayCount(counts.rays)
        }
        KeyCode::Period | KeyCode::Comma => {
            counts.points = Counts::scale(counts.points, key == KeyCode::Period, counts.max);
            RenderCommand::SetPointCount(counts.points)
        }
        _ => return None,
    };
    Some(command)
}

/// Keys currently held down.
#[derive(Debug, Default)]
pub struct HeldKeys {
    keys: HashSet<KeyCode>,
}

impl HeldKeys {
    pub fn press(&mut self, key: KeyCode) {
        self.keys.insert(key);
    }

    pub fn release(&mut self, key: KeyCode) {
        self.keys.remove(&key);
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    fn axis(&self, positive: KeyCode, negative: KeyCode) -> f32 {
        let mut value = 0.0;
        if self.keys.contains(&positive) {
            value += 1.0;
        }
        if self.keys.contains(&negative) {
            value -= 1.0;
        }
        value
    }

    /// WASD moves, Q/E lowers and raises, arrows look around.
    pub fn move_input(&self) -> MoveInput {
        MoveInput {
            right: self.axis(KeyCode::KeyD, KeyCode::KeyA),
            up: self.axis(KeyCode::KeyE, KeyCode::KeyQ),
            forward: self.axis(KeyCode::KeyW, KeyCode::KeyS),
            look_right: self.axis(KeyCode::ArrowRight, KeyCode::ArrowLeft),
            look_up: self.axis(KeyCode::ArrowUp, KeyCode::ArrowDown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Commands
    // ============================================================

    #[test]
    fn test_digits_toggle_layers() {
        let mut counts = Counts::new(8, 8, 64);
        assert_eq!(command_for_key(KeyCode::Digit1, &mut counts), Some(RenderCommand::ToggleTriangles));
        assert_eq!(command_for_key(KeyCode::Digit4, &mut counts), Some(RenderCommand::ToggleHits));
    }

    #[test]
    fn test_launch_and_subset_keys() {
        let mut counts = Counts::new(8, 8, 64);
        assert_eq!(command_for_key(KeyCode::KeyR, &mut counts), Some(RenderCommand::LaunchRays));
        assert_eq!(command_for_key(KeyCode::KeyP, &mut counts), Some(RenderCommand::LaunchPoints));
        assert_eq!(command_for_key(KeyCode::BracketRight, &mut counts), Some(RenderCommand::NextSubset));
        assert_eq!(command_for_key(KeyCode::KeyW, &mut counts), None);
    }

    #[test]
    fn test_count_keys_clamp_to_capacity() {
        let mut counts = Counts::new(40, 1, 64);
        assert_eq!(command_for_key(KeyCode::Equal, &mut counts), Some(RenderCommand::SetRayCount(64)));
        assert_eq!(command_for_key(KeyCode::Equal, &mut counts), Some(RenderCommand::SetRayCount(64)));
        assert_eq!(command_for_key(KeyCode::Comma, &mut counts), Some(RenderCommand::SetPointCount(0)));
        assert_eq!(command_for_key(KeyCode::Period, &mut counts), Some(RenderCommand::SetPointCount(1)));
    }

    // ============================================================
    // Held keys
    // ============================================================

    #[test]
    fn test_opposite_keys_cancel() {
        let mut held = HeldKeys::default();
        held.press(KeyCode::KeyW);
        held.press(KeyCode::KeyS);
        held.press(KeyCode::KeyD);
        let input = held.move_input();
        assert_eq!(input.forward, 0.0);
        assert_eq!(input.right, 1.0);
    }

    #[test]
    fn test_release_stops_motion() {
        let mut held = HeldKeys::default();
        held.press(KeyCode::ArrowLeft);
        assert_eq!(held.move_input().look_right, -1.0);
        held.release(KeyCode::ArrowLeft);
        assert_eq!(held.move_input(), MoveInput::default());
    }
}
