//! A minimal reference network: a single straight line, divided into
//! fixed length track sections, with signals, level crossings and speed
//! restrictions placed along it.

use crate::network::{
    Authority, AuthorityKind, CrossingInfo, Network, RoutePosition, SignalAspect, SignalInfo,
    SpeedPost, TrackLocation, TrainAheadInfo,
};
use crate::util::Interval;
use crate::{CrossingId, SignalId, TrainId};
use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

/// The default line speed in m/s.
const DEFAULT_LINE_SPEED: f64 = 30.0; // m/s

/// The furthest a train may be given authority to proceed.
const MAX_AUTHORITY: f64 = 5000.0; // m

/// The path of a train along the line, as a sequence of subroutes.
/// Each subroute after the first starts where the previous one ends,
/// and runs in the opposite direction.
#[derive(Clone, Debug, PartialEq)]
pub struct LinePath {
    /// The start and end coordinates of each subroute.
    subroutes: SmallVec<[(f64, f64); 2]>,
}

impl LinePath {
    /// Creates a path with a single subroute.
    pub fn new(start: f64, end: f64) -> Self {
        let mut subroutes = SmallVec::new();
        subroutes.push((start, end));
        Self { subroutes }
    }

    /// Appends a subroute reversing from the end of the path to `end`.
    pub fn then_reverse_to(mut self, end: f64) -> Self {
        let start = self.subroutes.last().map_or(0.0, |s| s.1);
        self.subroutes.push((start, end));
        self
    }

    /// The number of subroutes.
    pub fn len(&self) -> usize {
        self.subroutes.len()
    }

    /// Whether the path is empty. Paths always have at least one subroute.
    pub fn is_empty(&self) -> bool {
        self.subroutes.is_empty()
    }

    /// The start and end coordinates of a subroute.
    pub fn subroute(&self, idx: usize) -> Option<(f64, f64)> {
        self.subroutes.get(idx).copied()
    }
}

#[derive(Clone, Debug)]
struct Signal {
    /// The coordinate of the signal in m.
    pos: f64,
    aspect: SignalAspect,
    speed_limit: Option<f64>,
    /// The train holding the signal at danger.
    locked_by: Option<TrainId>,
}

impl Signal {
    fn aspect(&self) -> SignalAspect {
        if self.locked_by.is_some() {
            SignalAspect::Stop
        } else {
            self.aspect
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SpeedRestriction {
    range: Interval<f64>,
    speed: f64,
}

#[derive(Clone, Debug)]
struct LineTrain {
    path: LinePath,
    /// The index of the current subroute.
    subroute: usize,
    /// The coordinate of the front of the train in m.
    front: f64,
    /// The length of the train in m.
    length: f64,
    /// The distance travelled at the last update in m.
    odometer: f64,
    /// The speed in m/s.
    speed: f64,
    out_of_control: bool,
    permission: bool,
}

impl LineTrain {
    fn bounds(&self) -> (f64, f64) {
        self.path.subroute(self.subroute).unwrap_or((self.front, self.front))
    }

    /// The direction of travel along the line.
    fn dir(&self) -> f64 {
        let (start, end) = self.bounds();
        if end >= start {
            1.0
        } else {
            -1.0
        }
    }

    fn rear(&self) -> f64 {
        self.front - self.dir() * self.length
    }

    fn is_last_subroute(&self) -> bool {
        self.subroute + 1 >= self.path.len()
    }

    /// The distance to the end of the current subroute.
    fn remaining(&self) -> f64 {
        (self.bounds().1 - self.front) * self.dir()
    }

    /// The distance along the line to `pos`, if it is ahead of the train.
    fn ahead_on_line(&self, pos: f64) -> Option<f64> {
        let dist = (pos - self.front) * self.dir();
        (dist >= 0.0).then(|| dist)
    }

    /// The distance to `pos`, if it is ahead of the train on the current subroute.
    fn ahead(&self, pos: f64) -> Option<f64> {
        self.ahead_on_line(pos)
            .filter(|dist| *dist <= f64::max(self.remaining(), 0.0))
    }
}

/// A straight line network implementing [Network].
#[derive(Clone, Debug)]
pub struct LineNetwork {
    /// The length of each track section in m.
    section_len: f64,
    /// The line speed in m/s.
    line_speed: f64,
    signals: SlotMap<SignalId, Signal>,
    /// The coordinates of the level crossings.
    crossings: SlotMap<CrossingId, f64>,
    restrictions: Vec<SpeedRestriction>,
    trains: SecondaryMap<TrainId, LineTrain>,
}

impl LineNetwork {
    /// Creates an empty line divided into sections of the given length.
    pub fn new(section_len: f64) -> Self {
        Self {
            section_len,
            line_speed: DEFAULT_LINE_SPEED,
            signals: SlotMap::with_key(),
            crossings: SlotMap::with_key(),
            restrictions: vec![],
            trains: SecondaryMap::new(),
        }
    }

    /// Sets the line speed in m/s.
    pub fn set_line_speed(&mut self, speed: f64) {
        self.line_speed = speed;
    }

    /// Adds a signal at coordinate `pos`.
    pub fn add_signal(&mut self, pos: f64, aspect: SignalAspect) -> SignalId {
        self.signals.insert(Signal {
            pos,
            aspect,
            speed_limit: None,
            locked_by: None,
        })
    }

    /// Sets the aspect a signal shows when it is not locked.
    pub fn set_signal_aspect(&mut self, id: SignalId, aspect: SignalAspect) {
        if let Some(signal) = self.signals.get_mut(id) {
            signal.aspect = aspect;
        }
    }

    /// Sets the speed limit imposed by a signal.
    pub fn set_signal_speed_limit(&mut self, id: SignalId, speed: Option<f64>) {
        if let Some(signal) = self.signals.get_mut(id) {
            signal.speed_limit = speed;
        }
    }

    /// The aspect shown by a signal.
    pub fn signal_aspect(&self, id: SignalId) -> Option<SignalAspect> {
        self.signals.get(id).map(|s| s.aspect())
    }

    /// Removes a signal.
    pub fn remove_signal(&mut self, id: SignalId) {
        self.signals.remove(id);
    }

    /// Adds a level crossing at coordinate `pos`.
    pub fn add_crossing(&mut self, pos: f64) -> CrossingId {
        self.crossings.insert(pos)
    }

    /// Restricts the speed between two coordinates.
    pub fn add_speed_restriction(&mut self, from: f64, to: f64, speed: f64) {
        self.restrictions.push(SpeedRestriction {
            range: Interval::new(f64::min(from, to), f64::max(from, to)),
            speed,
        });
    }

    /// Places a train at the start of its path.
    pub fn add_train(&mut self, id: TrainId, path: LinePath, length: f64) {
        let front = path.subroute(0).map_or(0.0, |s| s.0);
        self.trains.insert(
            id,
            LineTrain {
                path,
                subroute: 0,
                front,
                length,
                odometer: 0.0,
                speed: 0.0,
                out_of_control: false,
                permission: false,
            },
        );
    }

    /// Removes a train from the line.
    pub fn remove_train(&mut self, id: TrainId) {
        self.trains.remove(id);
    }

    /// Moves a train along its path.
    ///
    /// # Parameters
    /// * `odometer` - The total distance travelled by the train in m
    /// * `speed` - The speed of the train in m/s
    pub fn move_train(&mut self, id: TrainId, odometer: f64, speed: f64) {
        if let Some(train) = self.trains.get_mut(id) {
            let dir = train.dir();
            train.front += dir * (odometer - train.odometer);
            train.odometer = odometer;
            train.speed = speed;
        }
    }

    /// The coordinate of the front of a train.
    pub fn front(&self, id: TrainId) -> Option<f64> {
        self.trains.get(id).map(|t| t.front)
    }

    /// The current subroute of a train.
    pub fn subroute(&self, id: TrainId) -> Option<usize> {
        self.trains.get(id).map(|t| t.subroute)
    }

    /// Marks a train as having run out of control.
    pub fn set_out_of_control(&mut self, id: TrainId) {
        if let Some(train) = self.trains.get_mut(id) {
            train.out_of_control = true;
        }
    }

    /// Gives a train permission to pass signals at danger.
    pub fn grant_permission(&mut self, id: TrainId) {
        if let Some(train) = self.trains.get_mut(id) {
            train.permission = true;
        }
    }

    /// The location of coordinate `pos` on a subroute of a train's path.
    /// Returns `None` if the subroute does not cover `pos`.
    pub fn location(&self, id: TrainId, subroute: usize, pos: f64) -> Option<TrackLocation> {
        let (start, end) = self.trains.get(id)?.path.subroute(subroute)?;
        Interval::new(f64::min(start, end), f64::max(start, end))
            .contains(pos)
            .then(|| self.location_at(subroute, start, pos))
    }

    fn section_at(&self, pos: f64) -> u32 {
        f64::max(pos / self.section_len, 0.0).floor() as u32
    }

    fn location_at(&self, subroute: usize, start: f64, pos: f64) -> TrackLocation {
        let section = self.section_at(pos);
        let first = self.section_at(start);
        TrackLocation {
            subroute,
            route_index: (section as i64 - first as i64).unsigned_abs() as usize,
            section,
            offset: pos - section as f64 * self.section_len,
        }
    }

    fn train(&self, id: TrainId) -> Option<&LineTrain> {
        self.trains.get(id)
    }
}

impl Network for LineNetwork {
    fn position(&self, train: TrainId) -> Option<RoutePosition> {
        let t = self.train(train)?;
        if t.is_last_subroute() && t.remaining() < 0.0 {
            return None;
        }
        let (start, _) = t.bounds();
        Some(RoutePosition {
            front: self.location_at(t.subroute, start, t.front),
            rear_section: self.section_at(t.rear()),
        })
    }

    fn distance_to(&self, train: TrainId, location: &TrackLocation) -> Option<f64> {
        let t = self.train(train)?;
        if location.subroute != t.subroute {
            return None;
        }
        t.ahead(location.section as f64 * self.section_len + location.offset)
    }

    fn route_index_of(&self, train: TrainId, section: u32) -> Option<usize> {
        let t = self.train(train)?;
        let (start, end) = t.bounds();
        let (first, last) = (self.section_at(start), self.section_at(end));
        Interval::new(u32::min(first, last), u32::max(first, last))
            .contains(section)
            .then(|| (section as i64 - first as i64).unsigned_abs() as usize)
    }

    fn remaining_in_section(&self, train: TrainId) -> f64 {
        match self.train(train) {
            Some(t) => {
                let offset = t.front - self.section_at(t.front) as f64 * self.section_len;
                if t.dir() > 0.0 {
                    self.section_len - offset
                } else {
                    offset
                }
            }
            None => 0.0,
        }
    }

    fn authority(&self, train: TrainId) -> Authority {
        let t = match self.train(train) {
            Some(t) => t,
            None => {
                return Authority {
                    kind: AuthorityKind::EndOfPath,
                    distance: 0.0,
                }
            }
        };
        let mut authority = Authority {
            kind: AuthorityKind::MaxDistance,
            distance: MAX_AUTHORITY,
        };
        let end = f64::max(t.remaining(), 0.0);
        if end < authority.distance {
            authority = Authority {
                kind: AuthorityKind::EndOfPath,
                distance: end,
            };
        }
        if let Some(ahead) = self.train_ahead(train) {
            if ahead.distance < authority.distance {
                authority = Authority {
                    kind: AuthorityKind::TrainAhead,
                    distance: ahead.distance,
                };
            }
        }
        authority
    }

    fn next_signal(&self, train: TrainId, max_distance: f64) -> Option<SignalInfo> {
        let t = self.train(train)?;
        self.signals
            .iter()
            .filter_map(|(id, signal)| {
                let distance = t.ahead(signal.pos)?;
                (distance <= max_distance).then(|| SignalInfo {
                    id,
                    distance,
                    aspect: signal.aspect(),
                    speed_limit: signal.speed_limit,
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    fn signal(&self, train: TrainId, id: SignalId) -> Option<SignalInfo> {
        let signal = self.signals.get(id)?;
        let distance = self.train(train)?.ahead(signal.pos)?;
        Some(SignalInfo {
            id,
            distance,
            aspect: signal.aspect(),
            speed_limit: signal.speed_limit,
        })
    }

    fn is_signal_locked(&self, signal: SignalId, train: TrainId) -> bool {
        self.signals
            .get(signal)
            .map_or(false, |s| s.locked_by == Some(train))
    }

    fn lock_signal(&mut self, signal: SignalId, train: TrainId) {
        if let Some(signal) = self.signals.get_mut(signal) {
            signal.locked_by = Some(train);
        }
    }

    fn unlock_signal(&mut self, signal: SignalId, train: TrainId) {
        if let Some(signal) = self.signals.get_mut(signal) {
            if signal.locked_by == Some(train) {
                signal.locked_by = None;
            }
        }
    }

    fn request_clear(&mut self, signal: SignalId, _train: TrainId) -> bool {
        match self.signals.get_mut(signal) {
            Some(signal) if signal.locked_by.is_none() => {
                signal.aspect = SignalAspect::Clear;
                true
            }
            _ => false,
        }
    }

    fn current_speed_limit(&self, train: TrainId) -> f64 {
        let front = match self.train(train) {
            Some(t) => t.front,
            None => return self.line_speed,
        };
        self.restrictions
            .iter()
            .filter(|r| r.range.contains(front))
            .map(|r| r.speed)
            .fold(self.line_speed, f64::min)
    }

    fn next_speed_limit(&self, train: TrainId, max_distance: f64) -> Option<SpeedPost> {
        let t = self.train(train)?;
        self.restrictions
            .iter()
            .filter_map(|r| {
                let entry = if t.dir() > 0.0 { r.range.min } else { r.range.max };
                let distance = t.ahead(entry)?;
                (distance > 0.0 && distance <= max_distance).then(|| SpeedPost {
                    distance,
                    speed: r.speed,
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    fn train_ahead(&self, train: TrainId) -> Option<TrainAheadInfo> {
        let t = self.train(train)?;
        self.trains
            .iter()
            .filter(|(id, _)| *id != train)
            .filter_map(|(id, other)| {
                let distance = [other.front, other.rear()]
                    .into_iter()
                    .filter_map(|pos| t.ahead_on_line(pos))
                    .reduce(f64::min)?;
                Some(TrainAheadInfo {
                    id,
                    distance,
                    speed: other.speed,
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    fn level_crossings(&self, train: TrainId, max_distance: f64) -> SmallVec<[CrossingInfo; 4]> {
        let t = match self.train(train) {
            Some(t) => t,
            None => return SmallVec::new(),
        };
        self.crossings
            .iter()
            .filter_map(|(id, pos)| {
                let distance = t.ahead(*pos)?;
                (distance <= max_distance).then(|| CrossingInfo { id, distance })
            })
            .collect()
    }

    fn reversal_point(&self, train: TrainId) -> Option<f64> {
        let t = self.train(train)?;
        (!t.is_last_subroute()).then(|| t.remaining())
    }

    fn end_of_path(&self, train: TrainId) -> Option<f64> {
        let t = self.train(train)?;
        t.is_last_subroute().then(|| t.remaining())
    }

    fn advance_subroute(&mut self, train: TrainId) -> bool {
        match self.trains.get_mut(train) {
            Some(t) if !t.is_last_subroute() => {
                t.front = t.rear();
                t.subroute += 1;
                true
            }
            _ => false,
        }
    }

    fn request_permission(&mut self, train: TrainId) -> bool {
        self.train(train).map_or(false, |t| t.permission)
    }

    fn couple(&mut self, train: TrainId, ahead: TrainId) -> bool {
        if train == ahead || !self.trains.contains_key(ahead) {
            return false;
        }
        self.trains.remove(train).is_some()
    }

    fn is_out_of_control(&self, train: TrainId) -> bool {
        self.train(train).map_or(false, |t| t.out_of_control)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn two_trains() -> (LineNetwork, TrainId, TrainId) {
        let mut ids = SlotMap::<TrainId, ()>::with_key();
        let (a, b) = (ids.insert(()), ids.insert(()));
        let mut net = LineNetwork::new(100.0);
        net.add_train(a, LinePath::new(0.0, 2000.0), 200.0);
        net.add_train(b, LinePath::new(1000.0, 2000.0), 200.0);
        (net, a, b)
    }

    #[test]
    fn locations_and_distances() {
        let (mut net, a, _) = two_trains();
        net.move_train(a, 150.0, 10.0);
        let position = net.position(a).unwrap();
        assert_eq!(position.front.section, 1);
        assert_approx_eq!(position.front.offset, 50.0);
        assert_eq!(position.rear_section, 0);
        assert_approx_eq!(net.remaining_in_section(a), 50.0);

        let location = net.location(a, 0, 420.0).unwrap();
        assert_eq!(location.route_index, 4);
        assert_approx_eq!(net.distance_to(a, &location).unwrap(), 270.0);

        let behind = net.location(a, 0, 100.0).unwrap();
        assert_eq!(net.distance_to(a, &behind), None);
        assert_eq!(net.location(a, 0, 2500.0), None);
    }

    #[test]
    fn authority_ends_at_train_ahead() {
        let (net, a, b) = two_trains();
        // The rear of train b is at 800 m
        let authority = net.authority(a);
        assert_eq!(authority.kind, AuthorityKind::TrainAhead);
        assert_approx_eq!(authority.distance, 800.0);
        assert_eq!(net.train_ahead(a).unwrap().id, b);

        let authority = net.authority(b);
        assert_eq!(authority.kind, AuthorityKind::EndOfPath);
        assert_approx_eq!(authority.distance, 1000.0);
    }

    #[test]
    fn locked_signal_shows_stop() {
        let (mut net, a, _) = two_trains();
        let signal = net.add_signal(500.0, SignalAspect::Clear);
        net.lock_signal(signal, a);
        assert_eq!(net.signal(a, signal).unwrap().aspect, SignalAspect::Stop);
        assert!(!net.request_clear(signal, a));

        net.unlock_signal(signal, a);
        assert!(net.request_clear(signal, a));
        assert_eq!(net.signal_aspect(signal), Some(SignalAspect::Clear));

        net.move_train(a, 600.0, 10.0);
        assert_eq!(net.signal(a, signal), None);
    }

    #[test]
    fn speed_restrictions() {
        let (mut net, a, _) = two_trains();
        net.add_speed_restriction(300.0, 400.0, 10.0);
        let post = net.next_speed_limit(a, 1000.0).unwrap();
        assert_approx_eq!(post.distance, 300.0);
        assert_eq!(post.speed, 10.0);
        assert_eq!(net.current_speed_limit(a), DEFAULT_LINE_SPEED);

        net.move_train(a, 350.0, 10.0);
        assert_eq!(net.current_speed_limit(a), 10.0);
        assert_eq!(net.next_speed_limit(a, 1000.0), None);
    }

    #[test]
    fn reversal_moves_front_to_rear() {
        let mut ids = SlotMap::<TrainId, ()>::with_key();
        let a = ids.insert(());
        let mut net = LineNetwork::new(100.0);
        net.add_train(a, LinePath::new(0.0, 1000.0).then_reverse_to(0.0), 200.0);
        net.move_train(a, 1000.0, 0.0);
        assert_approx_eq!(net.reversal_point(a).unwrap(), 0.0);
        assert_eq!(net.end_of_path(a), None);

        assert!(net.advance_subroute(a));
        assert_approx_eq!(net.front(a).unwrap(), 800.0);
        assert_approx_eq!(net.end_of_path(a).unwrap(), 800.0);
        net.move_train(a, 1100.0, 5.0);
        assert_approx_eq!(net.front(a).unwrap(), 700.0);
        assert!(!net.advance_subroute(a));
    }

    #[test]
    fn off_the_end_of_the_path() {
        let (mut net, a, _) = two_trains();
        net.move_train(a, 2001.0, 1.0);
        assert!(net.position(a).is_none());
    }
}
