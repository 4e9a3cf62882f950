//! Miscellaneous utility structs and functions.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// An interval on the real number line.
#[derive(Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval<T> {
    pub min: T,
    pub max: T,
}

impl<T> Interval<T> {
    /// Creates a new interval.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: std::cmp::PartialOrd> Interval<T> {
    /// Returns true if this interval contains the value.
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    /// Returns true if the value lies below the interval.
    pub fn value_below(&self, value: T) -> bool {
        value < self.min
    }

    /// Returns true if the value lies above the interval.
    pub fn value_above(&self, value: T) -> bool {
        value > self.max
    }
}

impl Interval<f64> {
    /// Returns the centre/mid-point of the interval.
    pub fn midpoint(&self) -> f64 {
        0.5 * (self.min + self.max)
    }

    /// Computes the distance between a point and the interval.
    /// Will be negative if the point is within the interval.
    pub fn distance(&self, other: f64) -> f64 {
        f64::max(other - self.max, self.min - other)
    }

    /// Samples a value uniformly from the interval.
    /// Degenerate intervals always yield `min`.
    pub fn sample(&self, rng: &mut impl rand::Rng) -> f64 {
        if self.max > self.min {
            rng.gen_range(self.min..self.max)
        } else {
            self.min
        }
    }
}

impl<T: Debug> Debug for Interval<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interval({:?}, {:?})", &self.min, &self.max)
    }
}

/// A counter which saturates within `[0, max]`.
///
/// Used to hold off reversing the direction of a control input
/// for a number of frames after the last reversal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangedCounter {
    value: u32,
    max: u32,
}

impl RangedCounter {
    /// Creates a counter which is initially expired.
    pub const fn new(max: u32) -> Self {
        Self { value: 0, max }
    }

    /// Restarts the counter from its maximum.
    pub fn restart(&mut self) {
        self.value = self.max;
    }

    /// Decrements the counter, saturating at zero.
    pub fn tick(&mut self) {
        self.value = self.value.saturating_sub(1);
    }

    /// Whether the counter has run down to zero.
    pub fn expired(&self) -> bool {
        self.value == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interval_sides() {
        let band = Interval::new(4.0, 6.0);
        assert!(band.value_below(3.0));
        assert!(band.value_above(7.0));
        assert!(band.contains(5.0));
        assert_eq!(band.midpoint(), 5.0);
        assert_eq!(band.distance(8.0), 2.0);
    }

    #[test]
    fn degenerate_sample() {
        let mut rng = rand::thread_rng();
        assert_eq!(Interval::new(3.0, 3.0).sample(&mut rng), 3.0);
        let x = Interval::new(1.0, 2.0).sample(&mut rng);
        assert!((1.0..2.0).contains(&x));
    }

    #[test]
    fn counter_saturates() {
        let mut cnt = RangedCounter::new(2);
        assert!(cnt.expired());
        cnt.restart();
        cnt.tick();
        assert!(!cnt.expired());
        cnt.tick();
        cnt.tick();
        assert!(cnt.expired());
    }
}
