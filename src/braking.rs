//! The braking distance model used to schedule and execute actions.

use crate::params::ControllerParams;
use crate::util::Interval;

/// The fraction of the maximum deceleration used when planning an approach.
pub const APPROACH_DECEL_FACTOR: f64 = 0.22;

/// Time allowed to react to a newly triggered action, in s.
const TRIGGER_LEAD_TIME: f64 = 2.0; // s

/// Computes the distance needed to slow from `from_speed` to `to_speed`
/// at a constant deceleration `decel`.
///
/// Evaluated as `v*t + 0.5*a*t²` with `t = Δv / a` and `v` the lower speed.
/// Returns zero if no slowing is needed, and infinity if `decel` is not positive.
pub fn braking_distance(from_speed: f64, to_speed: f64, decel: f64) -> f64 {
    let to_speed = f64::max(to_speed, 0.0);
    if from_speed <= to_speed {
        return 0.0;
    }
    if decel <= 0.0 {
        return f64::INFINITY;
    }
    let t = (from_speed - to_speed) / decel;
    to_speed * t + 0.5 * decel * t * t
}

/// Computes the distance travelled at which a train running at `speed` must
/// start reacting to reach `required_speed` at `activation_distance`.
///
/// # Parameters
/// * `activation_distance` - The distance travelled at which the action is reached
/// * `speed` - The speed to plan from, usually the present or maximum speed
/// * `required_speed` - The speed required at the action
/// * `max_decel` - The train's maximum deceleration
/// * `margin` - An extra distance to start reacting early by
pub fn trigger_distance(
    activation_distance: f64,
    speed: f64,
    required_speed: f64,
    max_decel: f64,
    margin: f64,
) -> f64 {
    let decel = APPROACH_DECEL_FACTOR * max_decel;
    let lead = TRIGGER_LEAD_TIME * speed;
    activation_distance - braking_distance(speed, required_speed, decel) - lead - margin
}

/// Computes the speed a train should ideally be travelling at while approaching an action.
pub fn ideal_speed(
    distance_to_go: f64,
    required_speed: f64,
    max_decel: f64,
    approach_margin: f64,
) -> f64 {
    let required_speed = f64::max(required_speed, 0.0);
    let dist = f64::max(distance_to_go - approach_margin, 0.0);
    (2.0 * APPROACH_DECEL_FACTOR * max_decel * dist + required_speed.powi(2)).sqrt()
}

/// The remaining distance to a target and the speed required on reaching it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Approach {
    /// The distance to go in m.
    pub distance: f64,
    /// The speed required at the target in m/s.
    pub required_speed: f64,
}

impl Approach {
    /// Whether the approach ends in a stop.
    pub fn is_stop(&self) -> bool {
        self.required_speed <= 0.0
    }

    /// Whether a train at `speed` must apply full brake to stop in time.
    pub fn needs_full_brake(&self, speed: f64, max_decel: f64, params: &ControllerParams) -> bool {
        self.is_stop()
            && self.distance <= params.final_approach_margin + braking_distance(speed, 0.0, max_decel)
    }
}

/// Computes the ideal speed band of a train.
///
/// Without an approach the band sits just below the allowed maximum speed.
/// Approaches to a stop keep a lower bound of the creep speed until the train
/// is within the arrival distance, so that it never stalls short of the stop.
pub fn ideal_band(
    approach: Option<Approach>,
    allowed_max: f64,
    max_decel: f64,
    params: &ControllerParams,
) -> Interval<f64> {
    let h = params.hysteresis;
    let cap = f64::max(allowed_max - h, 0.0);
    let ideal = match approach {
        Some(a) => f64::min(
            ideal_speed(a.distance, a.required_speed, max_decel, params.approach_margin),
            cap,
        ),
        None => cap,
    };
    let mut band = Interval::new(f64::max(ideal - 2.0 * h, 0.0), ideal + h);
    let creeping = approach.map_or(false, |a| a.is_stop() && a.distance > params.arrival_distance);
    if creeping {
        let creep = f64::min(params.creep_speed, allowed_max);
        band.min = f64::max(band.min, f64::min(creep, ideal));
        band.max = f64::max(band.max, creep);
    }
    band
}

/// The distance to look ahead for constraints when running at `speed`.
pub fn lookahead_distance(speed: f64, max_decel: f64, params: &ControllerParams) -> f64 {
    let decel = APPROACH_DECEL_FACTOR * max_decel;
    f64::max(
        params.min_check_distance,
        1.5 * braking_distance(speed, 0.0, decel) + TRIGGER_LEAD_TIME * speed,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn braking_distance_basic() {
        // 10 m/s to 0 at 0.5 m/s^2 takes 20 s and 100 m
        assert_approx_eq!(braking_distance(10.0, 0.0, 0.5), 100.0);
        // equivalent to (v1^2 - v2^2) / 2a
        assert_approx_eq!(braking_distance(20.0, 10.0, 0.5), 300.0);
        assert_eq!(braking_distance(5.0, 10.0, 0.5), 0.0);
        assert_eq!(braking_distance(5.0, 0.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn braking_distance_monotonic_in_required_speed() {
        let mut prev = f64::INFINITY;
        for i in 0..=40 {
            let required = 0.5 * i as f64;
            let dist = braking_distance(20.0, required, 0.7);
            assert!(dist <= prev);
            prev = dist;
        }
        assert_eq!(prev, 0.0);
    }

    #[test]
    fn trigger_before_activation() {
        let trigger = trigger_distance(1000.0, 10.0, 0.0, 0.5, 0.0);
        // 10^2 / (2 * 0.11) = 454.5 m plus 20 m of lead
        assert_approx_eq!(trigger, 1000.0 - 454.545454 - 20.0, 1e-3);
        assert_eq!(trigger_distance(1000.0, 5.0, 10.0, 0.5, 0.0), 990.0);
    }

    #[test]
    fn ideal_speed_reaches_required() {
        assert_approx_eq!(ideal_speed(1.5, 0.0, 0.5, 1.5), 0.0);
        assert_approx_eq!(ideal_speed(0.0, 8.0, 0.5, 1.5), 8.0);
        assert_approx_eq!(ideal_speed(101.5, 0.0, 0.5, 1.5), 22.0_f64.sqrt());
    }

    #[test]
    fn band_is_capped() {
        let params = ControllerParams::default();
        let band = ideal_band(None, 20.0, 0.5, &params);
        assert_approx_eq!(band.max, 20.0);
        assert_approx_eq!(band.min, 18.5);

        let far = Approach {
            distance: 10000.0,
            required_speed: 0.0,
        };
        assert_eq!(ideal_band(Some(far), 20.0, 0.5, &params), band);
    }

    #[test]
    fn band_creeps_to_stop() {
        let params = ControllerParams::default();
        let near = Approach {
            distance: 4.0,
            required_speed: 0.0,
        };
        let band = ideal_band(Some(near), 20.0, 0.5, &params);
        assert!(band.min > 0.0);
        assert!(band.max >= params.creep_speed);

        let arrived = Approach {
            distance: 2.0,
            required_speed: 0.0,
        };
        let band = ideal_band(Some(arrived), 20.0, 0.5, &params);
        assert_eq!(band.min, 0.0);
    }

    #[test]
    fn full_brake_near_stop() {
        let params = ControllerParams::default();
        let a = Approach {
            distance: 20.0,
            required_speed: 0.0,
        };
        assert!(!a.needs_full_brake(2.0, 0.5, &params));
        assert!(a.needs_full_brake(5.0, 0.5, &params));
    }
}
