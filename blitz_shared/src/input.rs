//! Player input bitmask.
//!
//! One byte on the wire; the simulation consumes it once per tick
//! (last-writer-wins, no cross-tick queuing).

use bitflags::bitflags;

use crate::math::Vec2;

bitflags! {
    /// Pressed-button set carried by INPUT packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        const RIGHT = 0x01;
        const LEFT  = 0x02;
        const UP    = 0x04;
        const DOWN  = 0x08;
        const SHOOT = 0x10;
    }
}

impl Buttons {
    /// Maps the directional bits to a unit-per-axis vector.
    ///
    /// Opposing bits cancel; the result is not normalized (diagonals move
    /// faster, as the original game behaved).
    pub fn axis(self) -> Vec2 {
        let mut v = Vec2::ZERO;
        if self.contains(Buttons::RIGHT) {
            v.x += 1.0;
        }
        if self.contains(Buttons::LEFT) {
            v.x -= 1.0;
        }
        if self.contains(Buttons::DOWN) {
            v.y += 1.0;
        }
        if self.contains(Buttons::UP) {
            v.y -= 1.0;
        }
        v
    }
}
