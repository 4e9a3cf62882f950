use serde::{Deserialize, Serialize};

/// Seconds in a day.
const DAY: f64 = 86400.0; // s

/// How long a train waits at a waiting point, decoded from the waiting point's delay code.
///
/// | code | meaning |
/// |---|---|
/// | `0..30000` | wait for that many seconds |
/// | `3HHMM` | wait until the clock time `HH:MM` |
/// | `4NNNN` | uncouple, keeping `NNNN` cars at the front |
/// | `5NNNN` | uncouple, keeping `NNNN` cars at the rear |
/// | `60001` | attach unconditionally to the train ahead |
/// | `60002` | wait for permission to pass the signal ahead |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitingDelay {
    Seconds(u32),
    Absolute { hour: u32, minute: u32 },
    Uncouple { keep: usize, from_front: bool },
    Attach,
    Permission,
}

impl WaitingDelay {
    /// Decodes a waiting point delay code. Returns `None` for codes with no meaning.
    pub fn decode(code: u32) -> Option<Self> {
        match code {
            0..=29999 => Some(WaitingDelay::Seconds(code)),
            30000..=39999 => {
                let hour = (code - 30000) / 100;
                let minute = code % 100;
                (hour < 24 && minute < 60).then(|| WaitingDelay::Absolute { hour, minute })
            }
            40000..=59999 => {
                let from_front = code < 50000;
                let keep = (code % 10000) as usize;
                (keep > 0).then(|| WaitingDelay::Uncouple { keep, from_front })
            }
            60001 => Some(WaitingDelay::Attach),
            60002 => Some(WaitingDelay::Permission),
            _ => None,
        }
    }

    /// Encodes the delay back into a delay code.
    pub fn encode(&self) -> u32 {
        match *self {
            WaitingDelay::Seconds(secs) => secs,
            WaitingDelay::Absolute { hour, minute } => 30000 + 100 * hour + minute,
            WaitingDelay::Uncouple { keep, from_front } => {
                let base = if from_front { 40000 } else { 50000 };
                base + keep as u32
            }
            WaitingDelay::Attach => 60001,
            WaitingDelay::Permission => 60002,
        }
    }

    /// Whether the delay ends at a fixed clock time.
    pub fn is_absolute(&self) -> bool {
        matches!(self, WaitingDelay::Absolute { .. })
    }

    /// Computes the clock time at which a train stopping at `clock` may depart,
    /// or `None` if departure depends on a request being granted.
    ///
    /// Absolute times refer to the current day; an absolute time which has
    /// already passed allows immediate departure.
    pub fn departure(&self, clock: f64, uncouple_hold: f64) -> Option<f64> {
        match *self {
            WaitingDelay::Seconds(secs) => Some(clock + secs as f64),
            WaitingDelay::Absolute { hour, minute } => {
                let day_start = (clock / DAY).floor() * DAY;
                let target = day_start + (3600 * hour + 60 * minute) as f64;
                Some(f64::max(target, clock))
            }
            WaitingDelay::Uncouple { .. } => Some(clock + uncouple_hold),
            WaitingDelay::Attach => Some(clock),
            WaitingDelay::Permission => None,
        }
    }
}
