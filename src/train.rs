use crate::action::{ActionItem, ActionKind, ActionType};
use crate::auxiliary::{AuxActionsContainer, AuxContext, AuxEvent};
use crate::braking::lookahead_distance;
use crate::network::{ConsistControl, Network, TrackLocation};
use crate::params::{ControllerParams, TrainAttributes};
use crate::queue::ActionQueue;
use crate::{SignalId, StationId, TrainId};
use control::SpeedController;
use detect::Validity;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

pub use state::{MergeOutcome, MovementState, RemovalReason, UpdateOutcome};

pub(crate) mod control;
mod detect;
mod resolve;
mod state;

/// The timing of a single simulation frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickContext {
    /// The time elapsed since the previous frame in s.
    pub elapsed: f64,
    /// The simulation clock in s since midnight.
    pub clock: f64,
    /// Whether trains are being fast forwarded before the simulation starts.
    pub is_pre_update: bool,
}

impl TickContext {
    /// Creates the context of a regular frame.
    pub fn new(elapsed: f64, clock: f64) -> Self {
        Self {
            elapsed,
            clock,
            is_pre_update: false,
        }
    }

    /// Marks the frame as part of the pre-update.
    pub fn pre_update(mut self) -> Self {
        self.is_pre_update = true;
        self
    }
}

/// A scheduled stop at a station platform.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationStop {
    pub station: StationId,
    /// The stopping point on the train's path.
    pub location: TrackLocation,
    /// The scheduled departure time in s since midnight.
    pub departure: f64,
    /// The signal at the end of the platform.
    pub exit_signal: Option<SignalId>,
}

/// An ongoing stop at a station.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Dwell {
    pub station: StationId,
    /// The arrival time in s.
    pub arrived: f64,
    /// The departure time in s.
    pub depart: f64,
}

/// A speed limit imposed by a signal which has been passed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SignalLimit {
    /// The signal imposing the limit.
    pub signal: SignalId,
    /// The limit in m/s.
    pub speed: f64,
    /// The next signal, which lifts the limit once passed.
    pub until: Option<SignalId>,
}

/// An AI driven train.
#[derive(Clone, Debug)]
pub struct Train {
    pub(crate) id: TrainId,
    pub(crate) attribs: TrainAttributes,
    /// The movement state.
    pub(crate) state: MovementState,
    /// The state imposed by an executing auxiliary action,
    /// which takes priority over `state`.
    pub(crate) aux_state: Option<MovementState>,
    /// The scheduled actions, and the next action the train is reacting to.
    pub(crate) queue: ActionQueue<ActionItem>,
    /// Candidates which lost a merge, to be merged again next frame.
    pub(crate) deferred: SmallVec<[ActionItem; 4]>,
    pub(crate) aux: AuxActionsContainer,
    /// The remaining station stops, in path order.
    pub(crate) stations: VecDeque<StationStop>,
    pub(crate) dwell: Option<Dwell>,
    /// The time at which a stopped train may start again.
    pub(crate) restart_at: Option<f64>,
    pub(crate) controller: SpeedController,
    pub(crate) signal_limit: Option<SignalLimit>,
    /// The maximum speed allowed at the present location, in m/s.
    pub(crate) allowed_speed: f64,
    /// The type of the last action to complete.
    pub(crate) last_action: Option<ActionType>,
    /// The distance travelled at which the path ends, when last known.
    pub(crate) end_of_path_at: Option<f64>,
    /// The distance travelled at the last update, in m.
    pub(crate) distance: f64,
    /// The speed at the last update, in m/s.
    pub(crate) speed: f64,
}

impl Train {
    /// Creates a new train, which is validated on its first update.
    pub fn new(id: TrainId, attribs: TrainAttributes, params: &ControllerParams) -> Self {
        Self {
            id,
            attribs,
            state: MovementState::Init,
            aux_state: None,
            queue: ActionQueue::new(),
            deferred: SmallVec::new(),
            aux: AuxActionsContainer::new(),
            stations: VecDeque::new(),
            dwell: None,
            restart_at: None,
            controller: SpeedController::new(params.debounce_frames),
            signal_limit: None,
            allowed_speed: attribs.max_speed,
            last_action: None,
            end_of_path_at: None,
            distance: 0.0,
            speed: 0.0,
        }
    }

    /// Gets the train's ID.
    pub fn id(&self) -> TrainId {
        self.id
    }

    pub fn attributes(&self) -> &TrainAttributes {
        &self.attribs
    }

    /// The movement state.
    pub fn state(&self) -> MovementState {
        self.state
    }

    /// The state imposed by an executing auxiliary action.
    pub fn aux_state(&self) -> Option<MovementState> {
        self.aux_state
    }

    /// The state which drives the train this frame.
    pub fn effective_state(&self) -> MovementState {
        self.aux_state.unwrap_or(self.state)
    }

    /// The action the train is currently reacting to.
    pub fn next_action(&self) -> Option<&ActionItem> {
        self.queue.active()
    }

    /// The actions waiting for their trigger distance.
    pub fn pending_actions(&self) -> impl Iterator<Item = &ActionItem> + '_ {
        self.queue.iter().map(|(_, item)| item)
    }

    /// The candidates waiting to be merged again.
    pub fn deferred_actions(&self) -> &[ActionItem] {
        &self.deferred
    }

    /// The maximum speed allowed at the last update, in m/s.
    pub fn allowed_speed(&self) -> f64 {
        self.allowed_speed
    }

    /// The type of the last action to complete.
    pub fn last_action(&self) -> Option<ActionType> {
        self.last_action
    }

    /// The auxiliary actions of the train.
    pub fn aux(&self) -> &AuxActionsContainer {
        &self.aux
    }

    pub fn aux_mut(&mut self) -> &mut AuxActionsContainer {
        &mut self.aux
    }

    /// Appends a stop to the train's timetable.
    pub fn add_station_stop(&mut self, stop: StationStop) {
        self.stations.push_back(stop);
    }

    /// The remaining station stops.
    pub fn station_stops(&self) -> impl Iterator<Item = &StationStop> + '_ {
        self.stations.iter()
    }

    /// Parks the train, or hands it to a turntable, so that it is no longer driven.
    /// Any other state sets the train to be validated again on its next update.
    pub fn set_inactive(&mut self, state: MovementState) {
        let next = if state.is_inactive() {
            state
        } else {
            MovementState::Init
        };
        self.set_state(next);
    }

    /// Clears every action, and resets the auxiliary actions for a new route.
    pub fn reset_route<N: Network + ?Sized>(&mut self, net: &mut N) {
        self.queue.clear_pending(false);
        self.deferred.clear();
        self.aux.reset(net, self.id);
        self.aux_state = None;
        self.dwell = None;
        self.signal_limit = None;
        self.restart_at = None;
        self.end_of_path_at = None;
        debug!("Train {:?}: route reset", self.id);
    }

    pub(crate) fn set_state(&mut self, state: MovementState) {
        if state != self.state {
            debug!("Train {:?}: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn aux_context<'p>(
        &self,
        tick: &TickContext,
        params: &'p ControllerParams,
    ) -> AuxContext<'p> {
        AuxContext {
            train: self.id,
            distance: self.distance,
            speed: self.speed,
            max_speed: self.attribs.max_speed,
            max_decel: self.attribs.max_decel,
            clock: tick.clock,
            elapsed: tick.elapsed,
            stopped: self.speed <= params.stopped_tolerance,
            params,
        }
    }

    /// The speed allowed by the train, the line and any signal limit.
    fn speed_limit<N: Network + ?Sized>(&self, net: &N) -> f64 {
        let mut limit = f64::min(self.attribs.max_speed, net.current_speed_limit(self.id));
        if let Some(signal) = &self.signal_limit {
            limit = f64::min(limit, signal.speed);
        }
        limit
    }

    /// Updates the train for a single frame.
    ///
    /// Detects constraints ahead, merges them into the next action, runs the
    /// auxiliary actions and sets the throttle and brake of `consist`.
    pub fn update<N, C>(
        &mut self,
        tick: &TickContext,
        params: &ControllerParams,
        net: &mut N,
        consist: &mut C,
    ) -> UpdateOutcome
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        if self.state.is_inactive() {
            if self.state == MovementState::Frozen {
                self.controller.full_brake(consist);
            }
            return UpdateOutcome::Continue;
        }
        if net.is_out_of_control(self.id) {
            warn!("Train {:?} is out of control", self.id);
            return UpdateOutcome::Remove(RemovalReason::OutOfControl);
        }

        self.distance = consist.distance_travelled();
        self.speed = consist.speed();
        let position = match net.position(self.id) {
            Some(position) => position,
            None => return self.lost_position(params, consist),
        };
        if let Some(end) = net.end_of_path(self.id) {
            self.end_of_path_at = Some(self.distance + end);
        }

        if self.state == MovementState::Init {
            if !consist.has_power() {
                return UpdateOutcome::Continue;
            }
            let next = if self.speed > params.stopped_tolerance {
                MovementState::Running
            } else {
                MovementState::Stopped
            };
            self.set_state(next);
        }

        if let Some(outcome) = self.run_auxiliary(tick, params, net, consist) {
            return outcome;
        }

        let distance = self.distance;
        self.drop_missed_stations(&*net, position.subroute());
        self.update_signal_limit(&*net);
        self.allowed_speed = self.speed_limit(&*net);

        let plan_speed = f64::max(self.speed, self.allowed_speed);
        let lookahead = lookahead_distance(plan_speed, self.attribs.max_decel, params);
        self.detect_and_merge(distance, plan_speed, lookahead, &*net, params);
        self.complete_speed_action(distance);
        self.validate_active(distance, &*net, params);
        self.allowed_speed = self.speed_limit(&*net);

        match self.effective_state() {
            MovementState::InitAction => {
                self.controller.full_brake(consist);
                self.aux_state = Some(MovementState::HandleAction);
            }
            MovementState::HandleAction => {
                self.controller.full_brake(consist);
                if tick.is_pre_update {
                    consist.set_fixed_speed(0.0);
                }
            }
            MovementState::Stopped | MovementState::StoppedExisting => {
                self.wait_stopped(tick, params, net, consist)
            }
            MovementState::StationStop => self.dwell(tick, &*net, consist),
            state if state.is_running() => {
                return self.drive(tick, lookahead, params, net, consist)
            }
            _ => {}
        }
        UpdateOutcome::Continue
    }

    /// Detects constraints ahead, and merges those whose trigger has been reached.
    fn detect_and_merge<N: Network + ?Sized>(
        &mut self,
        distance: f64,
        plan_speed: f64,
        lookahead: f64,
        net: &N,
        params: &ControllerParams,
    ) {
        for candidate in self.detect(distance, plan_speed, lookahead, net, params) {
            let known = self
                .queue
                .iter_all()
                .any(|(_, item)| item.same_constraint(&candidate))
                || self.deferred.iter().any(|item| item.same_constraint(&candidate));
            if !known {
                self.queue.insert(candidate);
            }
        }
        for item in self.queue.pop_ready(distance) {
            if self.validity(&item, distance, net, params) == Validity::Valid {
                self.merge(item, params);
            }
        }
        self.prune_deferred(distance, net, params);
        self.retry_deferred(distance, params);
    }

    /// Runs the auxiliary actions, returning early if the train has been
    /// absorbed into another.
    fn run_auxiliary<N, C>(
        &mut self,
        tick: &TickContext,
        params: &ControllerParams,
        net: &mut N,
        consist: &mut C,
    ) -> Option<UpdateOutcome>
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        let ctx = self.aux_context(tick, params);
        self.aux.arm(&ctx, &*net);
        let horns = self
            .aux
            .tick_generic(&ctx, &*net, consist, &mut rand::thread_rng());
        let events = self.aux.tick_specific(&ctx, net, consist);

        for event in horns.into_iter().chain(events) {
            match event {
                AuxEvent::Candidate(item) => {
                    let outcome = self.merge(item, params);
                    debug!("Train {:?}: waiting point {:?}", self.id, outcome);
                }
                AuxEvent::InitAction(aux) => {
                    let holds = matches!(
                        self.queue.active().map(|a| a.kind),
                        Some(ActionKind::AuxiliaryWaitingPoint { aux: active, .. }) if active == aux
                    );
                    if holds {
                        self.queue.take_active();
                    }
                    self.last_action = Some(ActionType::AuxiliaryWaitingPoint);
                    self.aux_state = Some(MovementState::InitAction);
                    debug!("Train {:?}: held at waiting point {:?}", self.id, aux);
                }
                AuxEvent::Release(aux) => {
                    if self.aux_state.take().is_some() {
                        self.restart_at = None;
                        self.set_state(MovementState::Stopped);
                    }
                    debug!("Train {:?}: released by waiting point {:?}", self.id, aux);
                }
                AuxEvent::RequestAttach(aux) => match net.train_ahead(self.id) {
                    Some(ahead) if net.couple(self.id, ahead.id) => {
                        info!("Train {:?} attached to train {:?}", self.id, ahead.id);
                        self.aux_state = None;
                        self.set_state(MovementState::Suspended);
                        return Some(UpdateOutcome::Continue);
                    }
                    _ => debug!(
                        "Train {:?}: nothing to attach to at waiting point {:?}",
                        self.id, aux
                    ),
                },
                AuxEvent::Decoupled(aux) => {
                    info!("Train {:?} uncoupled cars at waiting point {:?}", self.id, aux);
                    self.aux.relocate_on_decouple(&ctx, &*net);
                }
                AuxEvent::HornStarted(crossing) => {
                    debug!("Train {:?}: sounding horn for crossing {:?}", self.id, crossing)
                }
            }
        }
        None
    }

    /// Handles a train which can no longer be found on its path.
    fn lost_position<C: ConsistControl + ?Sized>(
        &mut self,
        params: &ControllerParams,
        consist: &mut C,
    ) -> UpdateOutcome {
        let near_end = self
            .end_of_path_at
            .map_or(false, |end| (self.distance - end).abs() <= params.end_of_route_distance);
        if near_end {
            warn!("Train {:?} ran off the end of its path", self.id);
            self.controller.full_brake(consist);
            self.set_state(MovementState::Frozen);
            UpdateOutcome::Continue
        } else {
            warn!("Train {:?} is no longer on its path", self.id);
            UpdateOutcome::Remove(RemovalReason::OffRoute)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consist::PointMassConsist;
    use crate::network::SignalAspect;
    use crate::track::{LineNetwork, LinePath};
    use slotmap::SlotMap;

    struct Fixture {
        net: LineNetwork,
        train: Train,
        consist: PointMassConsist,
        params: ControllerParams,
        clock: f64,
    }

    impl Fixture {
        fn new(path: LinePath, speed: f64) -> Self {
            let params = ControllerParams {
                restart_delay: crate::Interval::new(1.0, 1.0),
                ..Default::default()
            };
            let attribs = TrainAttributes::default();
            let id = SlotMap::<TrainId, ()>::with_key().insert(());
            let mut net = LineNetwork::new(100.0);
            net.add_train(id, path, attribs.length);
            Self {
                net,
                train: Train::new(id, attribs, &params),
                consist: PointMassConsist::new(&attribs).with_speed(speed),
                params,
                clock: 0.0,
            }
        }

        fn step(&mut self, dt: f64) -> UpdateOutcome {
            let tick = TickContext::new(dt, self.clock);
            let outcome = self
                .train
                .update(&tick, &self.params, &mut self.net, &mut self.consist);
            self.consist.integrate(dt);
            self.net.move_train(
                self.train.id,
                self.consist.distance_travelled(),
                self.consist.speed(),
            );
            self.clock += dt;
            outcome
        }
    }

    #[test]
    fn init_without_power_waits() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0), 0.0);
        f.consist.set_power(false);
        assert_eq!(f.step(0.1), UpdateOutcome::Continue);
        assert_eq!(f.train.state(), MovementState::Init);
        f.consist.set_power(true);
        f.step(0.1);
        assert_eq!(f.train.state(), MovementState::Stopped);
    }

    #[test]
    fn starts_after_restart_delay() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0), 0.0);
        for _ in 0..5 {
            f.step(0.1);
        }
        assert_eq!(f.train.state(), MovementState::Stopped);
        for _ in 0..10 {
            f.step(0.1);
        }
        assert_eq!(f.train.state(), MovementState::Accelerating);
        for _ in 0..20 {
            f.step(0.1);
        }
        assert!(f.consist.speed() > 0.0);
    }

    #[test]
    fn stops_at_signal_and_restarts_when_cleared() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0), 8.0);
        let signal = f.net.add_signal(400.0, SignalAspect::Stop);
        for _ in 0..3000 {
            f.step(0.1);
        }
        assert_eq!(f.train.state(), MovementState::Stopped);
        assert!(f.consist.distance_travelled() <= 370.0);
        assert!(f.consist.distance_travelled() > 360.0);
        assert_eq!(
            f.train.next_action().map(|a| a.tag()),
            Some(ActionType::SignalAspectStop)
        );

        f.net.set_signal_aspect(signal, SignalAspect::Clear);
        f.step(0.1);
        assert_eq!(f.train.state(), MovementState::Running);
        assert!(f.train.next_action().is_none());
    }

    #[test]
    fn removed_at_end_of_path() {
        let mut f = Fixture::new(LinePath::new(0.0, 300.0), 8.0);
        let mut outcome = UpdateOutcome::Continue;
        for _ in 0..3000 {
            outcome = f.step(0.1);
            if outcome != UpdateOutcome::Continue {
                break;
            }
        }
        assert_eq!(outcome, UpdateOutcome::Remove(RemovalReason::EndOfPath));
        assert!(f.consist.distance_travelled() <= 300.0);
    }

    #[test]
    fn out_of_control_is_removed() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0), 8.0);
        f.net.set_out_of_control(f.train.id);
        assert_eq!(
            f.step(0.1),
            UpdateOutcome::Remove(RemovalReason::OutOfControl)
        );
    }

    #[test]
    fn frozen_near_end_of_path() {
        let mut f = Fixture::new(LinePath::new(0.0, 300.0), 8.0);
        f.step(0.1);
        // Overrun the end of the path
        f.consist = PointMassConsist::new(&TrainAttributes::default()).with_odometer(320.0);
        f.net.move_train(f.train.id, 320.0, 0.0);
        assert_eq!(f.step(0.1), UpdateOutcome::Continue);
        assert_eq!(f.train.state(), MovementState::Frozen);

        let mut g = Fixture::new(LinePath::new(0.0, 300.0), 8.0);
        g.consist = PointMassConsist::new(&TrainAttributes::default()).with_odometer(900.0);
        g.net.move_train(g.train.id, 900.0, 0.0);
        assert_eq!(g.step(0.1), UpdateOutcome::Remove(RemovalReason::OffRoute));
    }

    #[test]
    fn parked_train_is_not_driven() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0), 0.0);
        f.train.set_inactive(MovementState::Static);
        for _ in 0..50 {
            f.step(0.1);
        }
        assert_eq!(f.train.state(), MovementState::Static);
        assert_eq!(f.consist.speed(), 0.0);

        // Any other state is validated again
        f.train.set_inactive(MovementState::Running);
        assert_eq!(f.train.state(), MovementState::Init);
        f.step(0.1);
        assert_eq!(f.train.state(), MovementState::Stopped);
    }

    #[test]
    fn reverses_and_continues() {
        let mut f = Fixture::new(LinePath::new(0.0, 400.0).then_reverse_to(0.0), 8.0);
        let mut reversed = false;
        for _ in 0..5000 {
            if f.step(0.1) != UpdateOutcome::Continue {
                break;
            }
            if f.net.subroute(f.train.id) == Some(1) {
                reversed = true;
            }
        }
        assert!(reversed);
    }
}
