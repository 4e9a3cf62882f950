//! The per-state controllers which turn a train's next action into
//! throttle and brake settings.

use super::{Dwell, MovementState, Train, UpdateOutcome};
use crate::action::ActionKind;
use crate::braking::{ideal_band, ideal_speed, Approach};
use crate::network::{AuthorityKind, ConsistControl, Network, SignalAspect};
use crate::params::ControllerParams;
use crate::util::{Interval, RangedCounter};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::TickContext;

/// The direction of a control input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Control {
    Accelerate,
    Brake,
}

/// Adjusts the throttle and brake in bounded steps to keep the train's
/// speed within its ideal speed band.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SpeedController {
    /// The direction of the last adjustment.
    last: Option<Control>,
    /// Frames to wait before reversing the direction of adjustment.
    debounce: RangedCounter,
}

impl SpeedController {
    pub fn new(debounce_frames: u32) -> Self {
        Self {
            last: None,
            debounce: RangedCounter::new(debounce_frames),
        }
    }

    /// Adjusts the throttle or brake by one step towards the band.
    ///
    /// The opposite control is eased off first, at twice its normal rate.
    /// The brake is applied twice as fast when the train is more than one
    /// hysteresis width above the band.
    pub fn adjust<C: ConsistControl + ?Sized>(
        &mut self,
        speed: f64,
        band: Interval<f64>,
        dt: f64,
        params: &ControllerParams,
        consist: &mut C,
    ) {
        let want = if band.value_below(speed) {
            Control::Accelerate
        } else if band.value_above(speed) {
            Control::Brake
        } else {
            return;
        };

        if self.last != Some(want) {
            if !self.debounce.expired() {
                self.debounce.tick();
                return;
            }
            self.debounce.restart();
            self.last = Some(want);
        }

        let throttle = consist.throttle_percent();
        let brake = consist.brake_percent();
        match want {
            Control::Brake if throttle > 0.0 => {
                consist.set_throttle_percent(f64::max(throttle - 2.0 * params.throttle_rate * dt, 0.0))
            }
            Control::Brake => {
                let factor = if speed > band.max + params.hysteresis {
                    2.0
                } else {
                    1.0
                };
                consist.set_brake_percent(f64::min(brake + factor * params.brake_rate * dt, 100.0))
            }
            Control::Accelerate if brake > 0.0 => {
                consist.set_brake_percent(f64::max(brake - 2.0 * params.brake_rate * dt, 0.0))
            }
            Control::Accelerate => {
                consist.set_throttle_percent(f64::min(throttle + params.throttle_rate * dt, 100.0))
            }
        }
        self.debounce.tick();
    }

    /// Shuts off the throttle and applies full brake.
    pub fn full_brake<C: ConsistControl + ?Sized>(&mut self, consist: &mut C) {
        consist.set_throttle_percent(0.0);
        consist.set_brake_percent(100.0);
        self.last = Some(Control::Brake);
    }
}

impl Train {
    /// The train ahead to follow, as an approach to keep the following distance.
    fn following_target<N: Network + ?Sized>(
        &self,
        net: &N,
        lookahead: f64,
        params: &ControllerParams,
    ) -> Option<Approach> {
        if net.authority(self.id).kind != AuthorityKind::TrainAhead {
            return None;
        }
        let ahead = net.train_ahead(self.id)?;
        if ahead.distance > lookahead {
            return None;
        }
        Some(if ahead.speed > params.stopped_tolerance {
            Approach {
                distance: ahead.distance - params.keep_distance_moving,
                required_speed: ahead.speed,
            }
        } else {
            Approach {
                distance: ahead.distance - params.keep_distance_stationary(&self.attribs),
                required_speed: 0.0,
            }
        })
    }

    /// The most restrictive approach among the next action, the train
    /// ahead and, without a next action, the end of the movement authority.
    fn approach<N: Network + ?Sized>(
        &self,
        distance: f64,
        following: Option<Approach>,
        net: &N,
        lookahead: f64,
        params: &ControllerParams,
    ) -> Option<Approach> {
        let mut approaches = SmallVec::<[Approach; 3]>::new();
        approaches.extend(following);
        match self.queue.active() {
            Some(active) if active.required_speed >= 0.0 => approaches.push(Approach {
                distance: active.distance_to_go(distance),
                required_speed: active.required_speed,
            }),
            Some(_) => {}
            None => {
                let authority = net.authority(self.id);
                if authority.kind != AuthorityKind::TrainAhead && authority.distance <= lookahead {
                    approaches.push(Approach {
                        distance: authority.distance,
                        required_speed: 0.0,
                    });
                }
            }
        }
        let decel = self.attribs.max_decel;
        approaches.into_iter().min_by(|a, b| {
            let a = ideal_speed(a.distance, a.required_speed, decel, params.approach_margin);
            let b = ideal_speed(b.distance, b.required_speed, decel, params.approach_margin);
            a.total_cmp(&b)
        })
    }

    /// Picks the running state. `binding` is whether the approach holds the
    /// ideal speed below the allowed maximum.
    fn running_state(
        &self,
        following: bool,
        binding: bool,
        speed: f64,
        params: &ControllerParams,
    ) -> MovementState {
        if following {
            return MovementState::Following;
        }
        match self.queue.active() {
            Some(active) if binding && active.kind == ActionKind::EndOfRoute => {
                MovementState::ApproachingEndOfPath
            }
            Some(active) if binding && active.required_speed >= 0.0 => MovementState::Braking,
            _ if self.state == MovementState::Running => MovementState::Running,
            _ if speed >= self.allowed_speed - params.hysteresis => MovementState::Running,
            _ => MovementState::Accelerating,
        }
    }

    /// Drives the train in one of the running states.
    pub(crate) fn drive<N, C>(
        &mut self,
        tick: &TickContext,
        lookahead: f64,
        params: &ControllerParams,
        net: &mut N,
        consist: &mut C,
    ) -> UpdateOutcome
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        let speed = consist.speed();
        let distance = consist.distance_travelled();
        let stopped = speed <= params.stopped_tolerance;

        if let Some(active) = self.queue.active() {
            if active.is_stop() && stopped && active.distance_to_go(distance) <= params.arrival_distance
            {
                let kind = active.kind;
                return self.arrive(kind, tick, params, net, consist);
            }
        }

        let following = self.following_target(&*net, lookahead, params);
        let approach = self.approach(distance, following, &*net, lookahead, params);
        if let Some(approach) = approach {
            if approach.is_stop() && stopped && approach.distance <= params.arrival_distance {
                self.set_state(MovementState::Stopped);
                self.controller.full_brake(consist);
                return UpdateOutcome::Continue;
            }
        }

        let decel = self.attribs.max_decel;
        let binding = approach.map_or(false, |a| {
            ideal_speed(a.distance, a.required_speed, decel, params.approach_margin)
                < self.allowed_speed - params.hysteresis
        });
        let next = self.running_state(following.is_some(), binding, speed, params);
        self.set_state(next);

        let band = ideal_band(approach, self.allowed_speed, decel, params);
        if tick.is_pre_update {
            let arrived = approach.map_or(false, |a| {
                a.is_stop() && a.distance <= params.arrival_distance
            });
            consist.set_fixed_speed(if arrived { 0.0 } else { band.midpoint() });
        } else if approach.map_or(false, |a| a.needs_full_brake(speed, decel, params)) {
            self.controller.full_brake(consist);
        } else {
            self.controller
                .adjust(speed, band, tick.elapsed, params, consist);
        }
        UpdateOutcome::Continue
    }

    /// Handles arriving at a stop.
    fn arrive<N, C>(
        &mut self,
        kind: ActionKind,
        tick: &TickContext,
        params: &ControllerParams,
        net: &mut N,
        consist: &mut C,
    ) -> UpdateOutcome
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        self.controller.full_brake(consist);
        self.last_action = Some(kind.tag());
        match kind {
            ActionKind::StationStop { station, .. } => {
                let scheduled = self
                    .stations
                    .front()
                    .filter(|stop| stop.station == station)
                    .map_or(tick.clock, |stop| stop.departure);
                let depart = f64::max(scheduled, tick.clock + params.min_dwell);
                info!(
                    "Train {:?} arrived at station {:?}, departing at {:.0}",
                    self.id, station, depart
                );
                consist.set_doors_open(true);
                self.dwell = Some(Dwell {
                    station,
                    arrived: tick.clock,
                    depart,
                });
                self.set_state(MovementState::StationStop);
            }
            ActionKind::EndOfRoute => {
                info!("Train {:?} reached the end of its path", self.id);
                return UpdateOutcome::Remove(super::RemovalReason::EndOfPath);
            }
            ActionKind::Reversal => return self.reverse(tick, params, net),
            _ => self.set_state(MovementState::Stopped),
        }
        UpdateOutcome::Continue
    }

    /// Waits in one of the stopped states until the train may start.
    pub(crate) fn wait_stopped<N, C>(
        &mut self,
        tick: &TickContext,
        params: &ControllerParams,
        net: &mut N,
        consist: &mut C,
    ) where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        self.controller.full_brake(consist);
        if tick.is_pre_update {
            consist.set_fixed_speed(0.0);
        }
        let distance = consist.distance_travelled();

        // Still held by the next action
        if let Some(active) = self.queue.active() {
            if active.is_stop() && active.distance_to_go(distance) <= params.arrival_distance {
                return;
            }
        }

        let authority = net.authority(self.id);
        let mut follow = false;
        if authority.kind == AuthorityKind::TrainAhead {
            if let Some(ahead) = net.train_ahead(self.id) {
                let margin = ahead.distance - params.keep_distance_stationary(&self.attribs);
                let room = if ahead.speed > params.stopped_tolerance {
                    params.follow_distance_stationary
                } else {
                    params.arrival_distance
                };
                if margin <= room {
                    return;
                }
                follow = true;
            }
        } else if authority.distance <= params.arrival_distance {
            return;
        }

        let restart_at = match self.restart_at {
            Some(time) => time,
            None => {
                let delay = params.restart_delay.sample(&mut rand::thread_rng());
                let time = tick.clock + delay;
                self.restart_at = Some(time);
                time
            }
        };
        if tick.clock < restart_at {
            return;
        }
        self.restart_at = None;

        let next = if follow {
            MovementState::Following
        } else if self.queue.active().is_some() {
            MovementState::Braking
        } else {
            MovementState::Accelerating
        };
        self.set_state(next);
    }

    /// Dwells at a station until departure time, and until the exit signal is off.
    pub(crate) fn dwell<N, C>(&mut self, tick: &TickContext, net: &N, consist: &mut C)
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        self.controller.full_brake(consist);
        if tick.is_pre_update {
            consist.set_fixed_speed(0.0);
        }
        let dwell = match self.dwell {
            Some(dwell) => dwell,
            None => {
                self.set_state(MovementState::Stopped);
                return;
            }
        };
        // The route beyond the platform must still be known
        if tick.clock < dwell.depart || net.position(self.id).is_none() {
            return;
        }
        let exit_signal = self.queue.active().and_then(|active| match active.kind {
            ActionKind::StationStop { exit_signal, .. } => exit_signal,
            _ => None,
        });
        if let Some(signal) = exit_signal {
            let at_stop = net
                .signal(self.id, signal)
                .map_or(false, |info| info.aspect == SignalAspect::Stop);
            if at_stop {
                return;
            }
        }

        consist.set_doors_open(false);
        if matches!(
            self.queue.active().map(|a| a.kind),
            Some(ActionKind::StationStop { .. })
        ) {
            self.queue.take_active();
        }
        if self.stations.front().map(|s| s.station) == Some(dwell.station) {
            self.stations.pop_front();
        }
        self.dwell = None;
        info!(
            "Train {:?} departing station {:?} after {:.0} s",
            self.id,
            dwell.station,
            tick.clock - dwell.arrived
        );
        self.set_state(MovementState::StoppedExisting);
    }

    /// Moves the train onto the next subroute of its path.
    fn reverse<N: Network + ?Sized>(
        &mut self,
        tick: &TickContext,
        params: &ControllerParams,
        net: &mut N,
    ) -> UpdateOutcome {
        if !net.advance_subroute(self.id) {
            debug!("Train {:?} cannot reverse", self.id);
            return UpdateOutcome::Remove(super::RemovalReason::EndOfPath);
        }
        self.queue.clear_pending(false);
        self.deferred.clear();
        let ctx = self.aux_context(tick, params);
        self.aux.relocate_on_reversal(&ctx, net);
        self.restart_at = None;
        debug!("Train {:?} reversed", self.id);
        self.set_state(MovementState::Stopped);
        UpdateOutcome::Continue
    }
}
