//! The interfaces through which the train controller observes the railway
//! network and drives the vehicles of its train.

use crate::{CrossingId, SignalId, TrainId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;

/// A location on a train's path.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackLocation {
    /// The index of the subroute, which changes at each reversal.
    pub subroute: usize,
    /// The index of the track section within the subroute's route list.
    pub route_index: usize,
    /// The track section.
    pub section: u32,
    /// The offset into the track section in m.
    pub offset: f64,
}

impl TrackLocation {
    /// Orders locations by their position along a path.
    pub fn route_cmp(&self, other: &TrackLocation) -> Ordering {
        self.subroute
            .cmp(&other.subroute)
            .then(self.route_index.cmp(&other.route_index))
            .then(self.offset.total_cmp(&other.offset))
    }
}

/// The position of a train on its path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoutePosition {
    /// The location of the front of the train.
    pub front: TrackLocation,
    /// The track section occupied by the rear of the train.
    pub rear_section: u32,
}

impl RoutePosition {
    /// The current subroute.
    pub fn subroute(&self) -> usize {
        self.front.subroute
    }
}

/// The aspect shown by a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalAspect {
    Stop,
    Restricted,
    Approach,
    Clear,
}

/// What a train knows about a signal ahead.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalInfo {
    pub id: SignalId,
    /// The distance from the front of the train to the signal in m.
    pub distance: f64,
    pub aspect: SignalAspect,
    /// A speed limit imposed by the signal, in m/s.
    pub speed_limit: Option<f64>,
}

/// The reason the movement authority of a train ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorityKind {
    TrainAhead,
    ReservedSwitch,
    Loop,
    EndOfPath,
    MaxDistance,
}

/// The distance up to which a train may proceed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Authority {
    pub kind: AuthorityKind,
    /// The distance from the front of the train in m.
    pub distance: f64,
}

/// A change of line speed ahead of the train.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedPost {
    /// The distance from the front of the train in m.
    pub distance: f64,
    /// The speed limit beyond the post in m/s.
    pub speed: f64,
}

/// Another train ahead of a train.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainAheadInfo {
    pub id: TrainId,
    /// The distance from the front of the train to the rear of the train ahead in m.
    pub distance: f64,
    /// The speed of the train ahead in m/s.
    pub speed: f64,
}

/// A level crossing ahead of a train.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CrossingInfo {
    pub id: CrossingId,
    /// The distance from the front of the train in m.
    pub distance: f64,
}

/// Read-mostly queries against the signalling network and track layout,
/// answered on behalf of a single train.
///
/// All distances are measured along the train's path from the front of the train.
pub trait Network {
    /// The position of the train, or `None` if it is no longer on its path.
    fn position(&self, train: TrainId) -> Option<RoutePosition>;

    /// The distance along the train's path to `location`, or `None`
    /// if the location is not ahead of the train on its path.
    fn distance_to(&self, train: TrainId, location: &TrackLocation) -> Option<f64>;

    /// The route list index of `section` within the train's current subroute.
    fn route_index_of(&self, train: TrainId, section: u32) -> Option<usize>;

    /// The length of the current track section left ahead of the train in m.
    fn remaining_in_section(&self, train: TrainId) -> f64;

    /// The train's movement authority.
    fn authority(&self, train: TrainId) -> Authority;

    /// The next signal ahead of the train within `max_distance`.
    fn next_signal(&self, train: TrainId, max_distance: f64) -> Option<SignalInfo>;

    /// The state of a signal relative to the train, or `None` if the signal no
    /// longer exists or is no longer ahead of the train.
    fn signal(&self, train: TrainId, signal: SignalId) -> Option<SignalInfo>;

    /// Whether the signal is held locked on behalf of the train.
    fn is_signal_locked(&self, signal: SignalId, train: TrainId) -> bool;

    /// Holds a signal at danger on behalf of the train.
    fn lock_signal(&mut self, signal: SignalId, train: TrainId);

    /// Releases a signal locked by the train.
    fn unlock_signal(&mut self, signal: SignalId, train: TrainId);

    /// Requests the signal to clear for the train. Returns `true` if the request was granted.
    fn request_clear(&mut self, signal: SignalId, train: TrainId) -> bool;

    /// The line speed at the front of the train in m/s.
    fn current_speed_limit(&self, train: TrainId) -> f64;

    /// The next change of line speed within `max_distance`.
    fn next_speed_limit(&self, train: TrainId, max_distance: f64) -> Option<SpeedPost>;

    /// The nearest train ahead on the train's path.
    fn train_ahead(&self, train: TrainId) -> Option<TrainAheadInfo>;

    /// The level crossings ahead of the train within `max_distance`.
    fn level_crossings(&self, train: TrainId, max_distance: f64) -> SmallVec<[CrossingInfo; 4]>;

    /// The distance to the reversal point at the end of the current subroute,
    /// if the path continues in the reverse direction.
    fn reversal_point(&self, train: TrainId) -> Option<f64>;

    /// The distance to the end of the path, if it ends on the current subroute.
    fn end_of_path(&self, train: TrainId) -> Option<f64>;

    /// Moves the train onto the next subroute after reversing.
    /// Returns `false` if there is no next subroute.
    fn advance_subroute(&mut self, train: TrainId) -> bool;

    /// Asks for permission to pass the next signal at danger.
    fn request_permission(&mut self, train: TrainId) -> bool;

    /// Couples the train onto the train ahead.
    /// Returns `true` if the train was absorbed into the train ahead.
    fn couple(&mut self, train: TrainId, ahead: TrainId) -> bool;

    /// Whether the network has detected a contradiction between the train's
    /// authority and track occupancy.
    fn is_out_of_control(&self, train: TrainId) -> bool;
}

/// The controls of the vehicles making up a train.
pub trait ConsistControl {
    /// The current speed in m/s.
    fn speed(&self) -> f64;

    /// The total distance travelled in m.
    fn distance_travelled(&self) -> f64;

    /// Whether the leading locomotive has power.
    fn has_power(&self) -> bool;

    /// The current throttle setting in %.
    fn throttle_percent(&self) -> f64;

    /// The current brake setting in %.
    fn brake_percent(&self) -> f64;

    fn set_throttle_percent(&mut self, percent: f64);

    fn set_brake_percent(&mut self, percent: f64);

    /// Moves the train at a fixed speed, bypassing the physics model.
    /// Used to fast forward trains before the simulation starts.
    fn set_fixed_speed(&mut self, speed: f64);

    fn set_doors_open(&mut self, open: bool);

    fn set_horn(&mut self, on: bool);

    fn set_bell(&mut self, on: bool);

    /// Whether sounding the horn also rings the bell.
    fn horn_rings_bell(&self) -> bool;

    /// The number of cars in the train.
    fn car_count(&self) -> usize;

    /// Detaches cars, keeping `keep` cars at the front or rear of the train.
    /// Returns `false` if the train cannot be split that way.
    fn detach_cars(&mut self, keep: usize, from_front: bool) -> bool;
}
