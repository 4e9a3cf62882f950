//! Train attributes and controller tuning parameters.

use crate::error::StateError;
use crate::util::Interval;
use serde::{Deserialize, Serialize};

/// The attributes of an AI driven train.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainAttributes {
    /// The maximum permitted speed of the train, in m/s.
    pub max_speed: f64,
    /// The maximum acceleration of the train, in m/s<sup>2</sup>.
    pub max_accel: f64,
    /// The maximum service deceleration of the train, a positive number in m/s<sup>2</sup>.
    pub max_decel: f64,
    /// The length of the train in m.
    pub length: f64,
    /// Whether the train is a freight train.
    /// Freight trains keep a larger distance behind stationary trains.
    #[serde(default)]
    pub freight: bool,
}

impl Default for TrainAttributes {
    fn default() -> Self {
        Self {
            max_speed: 30.0,
            max_accel: 0.5,
            max_decel: 0.5,
            length: 200.0,
            freight: false,
        }
    }
}

/// Tuning parameters of the train controller, shared by all trains.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerParams {
    /// Width of the speed hysteresis band, in m/s.
    pub hysteresis: f64,
    /// Distance kept before a signal at danger or other obstruction, in m.
    pub clearing_distance: f64,
    /// Distance subtracted from the distance to go before computing the ideal speed, in m.
    pub approach_margin: f64,
    /// Margin added to the full brake stopping distance in which
    /// the brakes are fully applied ahead of a stop, in m.
    pub final_approach_margin: f64,
    /// Distance to go below which a stopped train is considered to have arrived, in m.
    pub arrival_distance: f64,
    /// Speed below which a train is considered stopped, in m/s.
    pub stopped_tolerance: f64,
    /// Speed at which a train creeps up to a stopping point, in m/s.
    pub creep_speed: f64,
    /// Speed to pass a signal showing a restricted aspect, in m/s.
    pub restricted_speed: f64,
    /// Maximum rate of change of the throttle, in %/s.
    pub throttle_rate: f64,
    /// Maximum rate of change of the brake, in %/s.
    pub brake_rate: f64,
    /// Number of frames to wait before reversing the control direction.
    pub debounce_frames: u32,
    /// Distance kept behind a moving train, in m.
    pub keep_distance_moving: f64,
    /// Distance kept behind a stationary train by a passenger train, in m.
    pub keep_distance_passenger: f64,
    /// Distance kept behind a stationary train by a freight train, in m.
    pub keep_distance_freight: f64,
    /// Minimum gap to a stationary train ahead before starting to follow it, in m.
    pub follow_distance_stationary: f64,
    /// Distance to the end of the path within which a lost position freezes the train, in m.
    pub end_of_route_distance: f64,
    /// Minimum look ahead distance for signals, speed limits and stations, in m.
    pub min_check_distance: f64,
    /// Range of delays before a stopped train restarts, in s.
    pub restart_delay: Interval<f64>,
    /// Minimum time a train dwells at a station, in s.
    pub min_dwell: f64,
    /// Time a train holds after uncoupling cars at a waiting point, in s.
    pub uncouple_hold: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            hysteresis: 0.5,
            clearing_distance: 30.0,
            approach_margin: 1.5,
            final_approach_margin: 1.0,
            arrival_distance: 3.0,
            stopped_tolerance: 0.1,
            creep_speed: 1.0,
            restricted_speed: 4.0,
            throttle_rate: 25.0,
            brake_rate: 25.0,
            debounce_frames: 5,
            keep_distance_moving: 300.0,
            keep_distance_passenger: 10.0,
            keep_distance_freight: 50.0,
            follow_distance_stationary: 30.0,
            end_of_route_distance: 150.0,
            min_check_distance: 1000.0,
            restart_delay: Interval::new(1.0, 4.0),
            min_dwell: 10.0,
            uncouple_hold: 10.0,
        }
    }
}

impl ControllerParams {
    /// Parses controller parameters from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, StateError> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Checks that every distance, speed and rate is usable by the controller.
    pub fn validate(&self) -> Result<(), StateError> {
        let positive = [
            ("hysteresis", self.hysteresis),
            ("arrival_distance", self.arrival_distance),
            ("stopped_tolerance", self.stopped_tolerance),
            ("creep_speed", self.creep_speed),
            ("restricted_speed", self.restricted_speed),
            ("throttle_rate", self.throttle_rate),
            ("brake_rate", self.brake_rate),
            ("min_check_distance", self.min_check_distance),
        ];
        let non_negative = [
            ("clearing_distance", self.clearing_distance),
            ("approach_margin", self.approach_margin),
            ("final_approach_margin", self.final_approach_margin),
            ("keep_distance_moving", self.keep_distance_moving),
            ("keep_distance_passenger", self.keep_distance_passenger),
            ("keep_distance_freight", self.keep_distance_freight),
            ("follow_distance_stationary", self.follow_distance_stationary),
            ("end_of_route_distance", self.end_of_route_distance),
            ("restart_delay", self.restart_delay.min),
            ("min_dwell", self.min_dwell),
            ("uncouple_hold", self.uncouple_hold),
        ];
        if let Some((field, value)) = positive.into_iter().find(|(_, v)| !(*v > 0.0)) {
            return Err(StateError::InvalidParam { field, value });
        }
        if let Some((field, value)) = non_negative.into_iter().find(|(_, v)| !(*v >= 0.0)) {
            return Err(StateError::InvalidParam { field, value });
        }
        if self.restart_delay.max < self.restart_delay.min {
            return Err(StateError::InvalidParam {
                field: "restart_delay",
                value: self.restart_delay.max,
            });
        }
        Ok(())
    }

    /// The distance kept behind a stationary train.
    pub fn keep_distance_stationary(&self, attribs: &TrainAttributes) -> f64 {
        if attribs.freight {
            self.keep_distance_freight
        } else {
            self.keep_distance_passenger
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let params = ControllerParams::from_json(r#"{ "hysteresis": 0.75 }"#).unwrap();
        assert_eq!(params.hysteresis, 0.75);
        assert_eq!(params.clearing_distance, 30.0);
    }

    #[test]
    fn rejects_bad_values() {
        let err = ControllerParams::from_json(r#"{ "brake_rate": 0.0 }"#).unwrap_err();
        assert!(matches!(err, StateError::InvalidParam { field: "brake_rate", .. }));

        let err = ControllerParams::from_json(r#"{ "restart_delay": { "min": 5.0, "max": 1.0 } }"#)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidParam { field: "restart_delay", .. }));
    }

    #[test]
    fn malformed_json() {
        let err = ControllerParams::from_json("{ hysteresis").unwrap_err();
        assert!(matches!(err, StateError::Json { .. }));
    }
}
