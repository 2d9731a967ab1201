//! Input sampling.
//!
//! In a real client this would integrate with windowing and key bindings;
//! here it only turns sampled button state into the wire bitmask sent once
//! per tick.

use blitz_shared::input::Buttons;

/// Sampled button state at a moment in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub right: bool,
    pub left: bool,
    pub up: bool,
    pub down: bool,
    pub shoot: bool,
}

impl InputState {
    pub fn buttons(self) -> Buttons {
        let mut b = Buttons::empty();
        if self.right {
            b |= Buttons::RIGHT;
        }
        if self.left {
            b |= Buttons::LEFT;
        }
        if self.up {
            b |= Buttons::UP;
        }
        if self.down {
            b |= Buttons::DOWN;
        }
        if self.shoot {
            b |= Buttons::SHOOT;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_map_one_to_one() {
        let state = InputState {
            right: true,
            shoot: true,
            ..InputState::default()
        };
        assert_eq!(state.buttons(), Buttons::RIGHT | Buttons::SHOOT);
        assert_eq!(InputState::default().buttons(), Buttons::empty());
    }
}
