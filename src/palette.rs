//! Output color slots.
//!
//! Every run owns one `Palette`. Slots are handed out in dispatch order and cycle
//! through a fixed set of five colors, so the same inventory always prints with
//! the same colors.

use colored::Color;

pub const PALETTE: [Color; 5] = [
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
];

/// Index into `PALETTE`. A retried attempt keeps the slot of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSlot(usize);

impl ColorSlot {
    pub fn color(self) -> Color {
        PALETTE[self.0 % PALETTE.len()]
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-run slot allocator.
#[derive(Debug, Default)]
pub struct Palette {
    next: usize,
}

impl Palette {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next slot. Slots only move forward.
    pub fn allocate(&mut self) -> ColorSlot {
        let slot = ColorSlot(self.next);
        self.next += 1;
        slot
    }

    /// One slot per target, in target order.
    pub fn assign(&mut self, count: usize) -> Vec<ColorSlot> {
        (0..count).map(|_| self.allocate()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_cycle_every_five() {
        let mut palette = Palette::new();
        let slots = palette.assign(7);
        assert_eq!(slots[0].color(), Color::Cyan);
        assert_eq!(slots[4].color(), Color::Blue);
        assert_eq!(slots[5].color(), slots[0].color());
        assert_eq!(slots[6].color(), slots[1].color());
    }

    #[test]
    fn test_independent_runs_assign_identically() {
        let first: Vec<_> = Palette::new().assign(3).iter().map(|s| s.color()).collect();
        let second: Vec<_> = Palette::new().assign(3).iter().map(|s| s.color()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let mut palette = Palette::new();
        let a = palette.allocate();
        let b = palette.allocate();
        assert!(b.index() > a.index());
    }
}
