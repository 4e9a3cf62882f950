//! Horn patterns sounded by trains approaching a level crossing.

use crate::network::ConsistControl;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Time a linked bell keeps ringing after the start of a single blast, in s.
const SINGLE_BLAST_BELL_TIME: u32 = 30;

/// Time a linked bell keeps ringing after a long-long-short-long sequence, in s.
const MULTI_STAGE_BELL_TIME: u32 = 11;

/// The pattern of horn blasts sounded ahead of a level crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HornPattern {
    /// A single blast of the given or a random duration.
    SingleBlast,
    /// The North American long, long, short, long sequence.
    LongLongShortLong,
}

/// What a horn step does to the locomotive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HornSignal {
    HornOn,
    HornOff,
    BellOff,
}

/// A single step of a horn pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HornStep {
    /// The signal applied when the step is reached.
    pub signal: HornSignal,
    /// The number of seconds until the next step.
    pub wait: u32,
}

impl HornStep {
    const fn new(signal: HornSignal, wait: u32) -> Self {
        Self { signal, wait }
    }
}

impl HornPattern {
    /// The time before reaching the crossing at which the pattern must begin, in s.
    pub fn activation_window(&self) -> f64 {
        match self {
            HornPattern::SingleBlast => 6.0,
            HornPattern::LongLongShortLong => 19.0,
        }
    }

    /// Gets the step at `index` of the pattern, or `None` once the pattern has finished.
    ///
    /// # Parameters
    /// * `duration` - The duration of a single blast in s; unused by other patterns
    /// * `bell_linked` - Whether the horn also rings the locomotive's bell
    pub fn step(&self, index: usize, duration: u32, bell_linked: bool) -> Option<HornStep> {
        use HornSignal::*;
        match self {
            HornPattern::SingleBlast => {
                let off_wait = if bell_linked {
                    SINGLE_BLAST_BELL_TIME.saturating_sub(duration)
                } else {
                    0
                };
                match (index, bell_linked) {
                    (0, _) => Some(HornStep::new(HornOn, duration)),
                    (1, _) => Some(HornStep::new(HornOff, off_wait)),
                    (2, true) => Some(HornStep::new(BellOff, 0)),
                    _ => None,
                }
            }
            HornPattern::LongLongShortLong => {
                const STEPS: [HornStep; 8] = [
                    HornStep::new(HornOn, 3),
                    HornStep::new(HornOff, 2),
                    HornStep::new(HornOn, 3),
                    HornStep::new(HornOff, 2),
                    // short: sounds until the next frame
                    HornStep::new(HornOn, 0),
                    HornStep::new(HornOff, 1),
                    HornStep::new(HornOn, 8),
                    HornStep::new(HornOff, 0),
                ];
                match index {
                    7 if bell_linked => Some(HornStep::new(HornOff, MULTI_STAGE_BELL_TIME)),
                    8 if bell_linked => Some(HornStep::new(BellOff, 0)),
                    _ => STEPS.get(index).copied(),
                }
            }
        }
    }

    /// Iterates over every step of the pattern.
    pub fn steps(self, duration: u32, bell_linked: bool) -> impl Iterator<Item = HornStep> {
        (0..).map_while(move |idx| self.step(idx, duration, bell_linked))
    }
}

/// An in-progress horn pattern.
///
/// The sequence advances by at most one step per frame, and only once the
/// wait of the previous step has elapsed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HornSequence {
    pattern: HornPattern,
    /// The duration of a single blast in s.
    duration: u32,
    bell_linked: bool,
    /// The index of the next step.
    next: usize,
    /// Seconds until the next step is due.
    wait: f64,
    finished: bool,
}

impl HornSequence {
    /// Creates a new horn sequence.
    /// Single blasts without an explicit duration last between 2 and 5 seconds.
    pub fn new(
        pattern: HornPattern,
        duration: Option<u32>,
        bell_linked: bool,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            pattern,
            duration: duration.unwrap_or_else(|| rng.gen_range(2..=5)),
            bell_linked,
            next: 0,
            wait: 0.0,
            finished: false,
        }
    }

    /// The pattern being sounded.
    pub fn pattern(&self) -> HornPattern {
        self.pattern
    }

    /// The duration of a single blast in s.
    pub fn duration(&self) -> u32 {
        self.duration
    }

    /// Advances the sequence by `dt` seconds, applying the next step to the
    /// consist if it has become due. Returns `true` while the sequence is still running.
    pub fn advance<C: ConsistControl + ?Sized>(&mut self, dt: f64, consist: &mut C) -> bool {
        if self.finished {
            return false;
        }
        self.wait -= dt;
        if self.wait > 0.0 {
            return true;
        }
        match self.pattern.step(self.next, self.duration, self.bell_linked) {
            Some(step) => {
                match step.signal {
                    HornSignal::HornOn => consist.set_horn(true),
                    HornSignal::HornOff => consist.set_horn(false),
                    HornSignal::BellOff => consist.set_bell(false),
                }
                self.next += 1;
                self.wait = step.wait as f64;
                true
            }
            None => {
                self.finished = true;
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consist::PointMassConsist;
    use crate::params::TrainAttributes;
    use HornSignal::*;

    fn total_on_time(steps: &[HornStep]) -> u32 {
        steps
            .iter()
            .filter(|s| s.signal == HornOn)
            .map(|s| s.wait)
            .sum()
    }

    #[test]
    fn single_blast() {
        let steps = HornPattern::SingleBlast.steps(4, false).collect::<Vec<_>>();
        assert_eq!(
            steps,
            vec![HornStep::new(HornOn, 4), HornStep::new(HornOff, 0)]
        );
        assert_eq!(total_on_time(&steps), 4);
    }

    #[test]
    fn single_blast_with_bell() {
        let steps = HornPattern::SingleBlast.steps(4, true).collect::<Vec<_>>();
        assert_eq!(
            steps,
            vec![
                HornStep::new(HornOn, 4),
                HornStep::new(HornOff, 26),
                HornStep::new(BellOff, 0)
            ]
        );
        assert_eq!(total_on_time(&steps), 4);
    }

    #[test]
    fn long_long_short_long() {
        let steps = HornPattern::LongLongShortLong
            .steps(0, false)
            .collect::<Vec<_>>();
        assert_eq!(steps.len(), 8);
        assert_eq!(total_on_time(&steps), 14);
        assert_eq!(steps[4], HornStep::new(HornOn, 0));
        assert_eq!(steps.last().unwrap().signal, HornOff);

        let steps = HornPattern::LongLongShortLong.steps(0, true).collect::<Vec<_>>();
        assert_eq!(steps.len(), 9);
        assert_eq!(steps[7], HornStep::new(HornOff, 11));
        assert_eq!(steps[8], HornStep::new(BellOff, 0));
    }

    #[test]
    fn random_duration_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let seq = HornSequence::new(HornPattern::SingleBlast, None, false, &mut rng);
            assert!((2..=5).contains(&seq.duration()));
        }
    }

    #[test]
    fn sequence_sounds_for_duration() {
        let mut consist = PointMassConsist::new(&TrainAttributes::default());
        let mut rng = rand::thread_rng();
        let mut seq = HornSequence::new(HornPattern::SingleBlast, Some(3), false, &mut rng);

        let mut frames_on = 0;
        let mut frames = 0;
        while seq.advance(0.5, &mut consist) {
            if consist.horn() {
                frames_on += 1;
            }
            frames += 1;
            assert!(frames < 100);
        }
        assert!(!consist.horn());
        assert_eq!(frames_on, 6);
    }
}
