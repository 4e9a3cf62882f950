//! Detecting constraints ahead of a train, and checking that known
//! constraints still hold.

use super::{MovementState, SignalLimit, Train};
use crate::action::{ActionItem, ActionKind};
use crate::braking::trigger_distance;
use crate::network::{AuthorityKind, Network, SignalAspect};
use crate::params::ControllerParams;
use log::{debug, warn};
use smallvec::SmallVec;

/// Whether a known action still describes the network ahead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Validity {
    Valid,
    /// The constraint no longer exists as described.
    Stale,
    /// The constraint has been lifted, so the train may proceed at line speed.
    Cleared,
}

impl Train {
    /// Scans the network ahead of the train for constraints within `lookahead`.
    ///
    /// Triggers are planned from `plan_speed`, so that an accelerating train
    /// does not detect constraints too late.
    pub(crate) fn detect<N: Network + ?Sized>(
        &self,
        distance: f64,
        plan_speed: f64,
        lookahead: f64,
        net: &N,
        params: &ControllerParams,
    ) -> SmallVec<[ActionItem; 8]> {
        let decel = self.attribs.max_decel;
        let mut found = SmallVec::new();
        let mut push = |kind: ActionKind, ahead: f64, required: f64| {
            let activation = distance + f64::max(ahead, 0.0);
            let trigger =
                trigger_distance(activation, plan_speed, required, decel, params.approach_margin);
            found.push(ActionItem::new(kind, trigger, activation, required, distance));
        };

        if let Some(info) = net.next_signal(self.id, lookahead) {
            match info.aspect {
                SignalAspect::Stop => push(
                    ActionKind::SignalAspectStop { signal: info.id },
                    info.distance - params.clearing_distance,
                    0.0,
                ),
                SignalAspect::Restricted if params.restricted_speed < self.allowed_speed => push(
                    ActionKind::SignalAspectRestricted { signal: info.id },
                    info.distance,
                    params.restricted_speed,
                ),
                SignalAspect::Restricted => {}
                SignalAspect::Approach | SignalAspect::Clear => match info.speed_limit {
                    Some(limit) if limit < self.allowed_speed => push(
                        ActionKind::SpeedSignal { signal: info.id },
                        info.distance,
                        limit,
                    ),
                    _ => {}
                },
            }
        }

        if let Some(post) = net.next_speed_limit(self.id, lookahead) {
            if post.speed < self.allowed_speed {
                push(ActionKind::SpeedLimit, post.distance, post.speed);
            }
        }

        if let Some(stop) = self.stations.front() {
            if let Some(ahead) = net.distance_to(self.id, &stop.location) {
                if ahead <= lookahead {
                    push(
                        ActionKind::StationStop {
                            station: stop.station,
                            exit_signal: stop.exit_signal,
                        },
                        ahead,
                        0.0,
                    );
                }
            }
        }

        if let Some(ahead) = net.reversal_point(self.id).filter(|d| *d <= lookahead) {
            push(ActionKind::Reversal, ahead, 0.0);
        }
        if let Some(ahead) = net.end_of_path(self.id).filter(|d| *d <= lookahead) {
            push(ActionKind::EndOfRoute, ahead, 0.0);
        }

        let authority = net.authority(self.id);
        match authority.kind {
            AuthorityKind::TrainAhead => {
                if let Some(ahead) = net.train_ahead(self.id) {
                    if ahead.speed <= params.stopped_tolerance && ahead.distance <= lookahead {
                        push(
                            ActionKind::TrainAhead { train: ahead.id },
                            ahead.distance - params.keep_distance_stationary(&self.attribs),
                            0.0,
                        );
                    }
                }
            }
            AuthorityKind::ReservedSwitch | AuthorityKind::Loop => {
                if authority.distance <= lookahead {
                    push(
                        ActionKind::EndOfAuthority,
                        authority.distance - params.clearing_distance,
                        0.0,
                    );
                }
            }
            // The authority horizon moves with the train
            AuthorityKind::MaxDistance | AuthorityKind::EndOfPath => {}
        }

        found
    }

    /// Checks whether a known action still holds.
    pub(crate) fn validity<N: Network + ?Sized>(
        &self,
        item: &ActionItem,
        distance: f64,
        net: &N,
        params: &ControllerParams,
    ) -> Validity {
        match item.kind {
            ActionKind::SignalAspectStop { signal } => match net.signal(self.id, signal) {
                Some(info) if info.aspect == SignalAspect::Stop => Validity::Valid,
                Some(_) => Validity::Cleared,
                None => Validity::Stale,
            },
            ActionKind::SignalAspectRestricted { signal } => match net.signal(self.id, signal) {
                Some(info) if info.aspect <= SignalAspect::Restricted => Validity::Valid,
                Some(_) => Validity::Cleared,
                None => Validity::Stale,
            },
            ActionKind::SpeedSignal { signal } => match net.signal(self.id, signal) {
                Some(info) if info.speed_limit.is_some() => Validity::Valid,
                Some(_) => Validity::Cleared,
                None => Validity::Stale,
            },
            ActionKind::TrainAhead { train } => match net.train_ahead(self.id) {
                Some(ahead) if ahead.id == train && ahead.speed <= params.stopped_tolerance => {
                    Validity::Valid
                }
                _ => Validity::Stale,
            },
            ActionKind::EndOfAuthority => {
                let authority = net.authority(self.id);
                let end = distance + authority.distance - params.clearing_distance;
                match authority.kind {
                    AuthorityKind::TrainAhead | AuthorityKind::EndOfPath => Validity::Stale,
                    _ if end > item.activation_distance + 1.0 => Validity::Cleared,
                    _ => Validity::Valid,
                }
            }
            ActionKind::AuxiliaryWaitingPoint { aux, .. } => match self.aux.live_state(aux) {
                Some(_) => Validity::Valid,
                None => Validity::Stale,
            },
            ActionKind::StationStop { station, .. } => {
                if self.stations.front().map(|s| s.station) == Some(station) {
                    Validity::Valid
                } else {
                    Validity::Stale
                }
            }
            _ => Validity::Valid,
        }
    }

    /// Drops deferred actions which no longer hold.
    pub(crate) fn prune_deferred<N: Network + ?Sized>(
        &mut self,
        distance: f64,
        net: &N,
        params: &ControllerParams,
    ) {
        let mut deferred = std::mem::take(&mut self.deferred);
        deferred.retain(|item| self.validity(item, distance, net, params) == Validity::Valid);
        self.deferred = deferred;
    }

    /// Checks the active action, discarding it if it no longer holds.
    ///
    /// A constraint which has been lifted discards every pending action,
    /// and sets the train running again.
    pub(crate) fn validate_active<N: Network + ?Sized>(
        &mut self,
        distance: f64,
        net: &N,
        params: &ControllerParams,
    ) {
        let validity = match self.queue.active() {
            Some(active) => self.validity(active, distance, net, params),
            None => return,
        };
        match validity {
            Validity::Valid => {}
            Validity::Stale => {
                if let Some(item) = self.queue.take_active() {
                    debug!("Train {:?}: discarded stale {:?}", self.id, item.tag());
                }
            }
            Validity::Cleared => {
                if let Some(item) = self.queue.take_active() {
                    debug!("Train {:?}: {:?} lifted", self.id, item.tag());
                }
                self.queue.clear_pending(false);
                self.deferred.clear();
                if self.state.is_running() || self.state.is_stopped() {
                    self.set_state(MovementState::Running);
                }
            }
        }
    }

    /// Completes a speed action once the train reaches it.
    pub(crate) fn complete_speed_action(&mut self, distance: f64) {
        let reached = self.queue.active().map_or(false, |active| {
            active.required_speed > 0.0 && distance >= active.activation_distance
        });
        if !reached {
            return;
        }
        if let Some(item) = self.queue.take_active() {
            match item.kind {
                ActionKind::SpeedSignal { signal } | ActionKind::SignalAspectRestricted { signal } => {
                    self.signal_limit = Some(SignalLimit {
                        signal,
                        speed: item.required_speed,
                        until: None,
                    });
                }
                _ => {}
            }
            self.last_action = Some(item.tag());
        }
    }

    /// Lifts a signal speed limit once the train passes the next signal.
    pub(crate) fn update_signal_limit<N: Network + ?Sized>(&mut self, net: &N) {
        let lifted = match &mut self.signal_limit {
            Some(limit) => match limit.until {
                Some(until) => net.signal(self.id, until).is_none(),
                None => {
                    if let Some(next) = net.next_signal(self.id, f64::INFINITY) {
                        if next.id != limit.signal {
                            limit.until = Some(next.id);
                        }
                    }
                    false
                }
            },
            None => false,
        };
        if lifted {
            debug!("Train {:?}: signal speed limit lifted", self.id);
            self.signal_limit = None;
        }
    }

    /// Drops station stops which are no longer ahead of the train.
    pub(crate) fn drop_missed_stations<N: Network + ?Sized>(&mut self, net: &N, subroute: usize) {
        if self.state == MovementState::StationStop {
            return;
        }
        while let Some(stop) = self.stations.front() {
            let missed = stop.location.subroute < subroute
                || (stop.location.subroute == subroute
                    && net.distance_to(self.id, &stop.location).is_none());
            if !missed {
                break;
            }
            warn!("Train {:?} missed station {:?}", self.id, stop.station);
            self.stations.pop_front();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::TrainAttributes;
    use crate::track::{LineNetwork, LinePath};
    use crate::{SignalId, TrainId};
    use slotmap::KeyData;

    fn setup() -> (LineNetwork, Train, ControllerParams) {
        let params = ControllerParams::default();
        let id = TrainId::from(KeyData::from_ffi(1));
        let mut net = LineNetwork::new(100.0);
        net.add_train(id, LinePath::new(0.0, 5000.0), 100.0);
        let mut train = Train::new(id, TrainAttributes::default(), &params);
        train.allowed_speed = 30.0;
        (net, train, params)
    }

    fn kinds(found: &[ActionItem]) -> Vec<crate::ActionType> {
        found.iter().map(|i| i.tag()).collect()
    }

    #[test]
    fn detects_signal_at_danger() {
        let (mut net, train, params) = setup();
        net.add_signal(800.0, SignalAspect::Stop);
        let found = train.detect(0.0, 20.0, 1000.0, &net, &params);
        assert_eq!(kinds(&found), vec![crate::ActionType::SignalAspectStop]);
        assert_eq!(found[0].activation_distance, 770.0);
        assert_eq!(found[0].required_speed, 0.0);
        assert!(found[0].trigger_distance < found[0].activation_distance);
    }

    #[test]
    fn ignores_constraints_beyond_lookahead() {
        let (mut net, train, params) = setup();
        net.add_signal(1800.0, SignalAspect::Stop);
        net.add_speed_restriction(1500.0, 2000.0, 10.0);
        assert!(train.detect(0.0, 20.0, 1000.0, &net, &params).is_empty());
    }

    #[test]
    fn lower_speed_limit_only() {
        let (mut net, train, params) = setup();
        net.add_speed_restriction(500.0, 600.0, 10.0);
        let found = train.detect(0.0, 20.0, 1000.0, &net, &params);
        assert_eq!(kinds(&found), vec![crate::ActionType::SpeedLimit]);

        let (mut net, train, params) = setup();
        net.add_speed_restriction(500.0, 600.0, 40.0);
        assert!(train.detect(0.0, 20.0, 1000.0, &net, &params).is_empty());
    }

    #[test]
    fn cleared_signal_lifts_stop() {
        let (mut net, train, params) = setup();
        let signal: SignalId = net.add_signal(800.0, SignalAspect::Stop);
        let found = train.detect(0.0, 20.0, 1000.0, &net, &params);
        assert_eq!(train.validity(&found[0], 0.0, &net, &params), Validity::Valid);
        net.set_signal_aspect(signal, SignalAspect::Clear);
        assert_eq!(train.validity(&found[0], 0.0, &net, &params), Validity::Cleared);
        net.remove_signal(signal);
        assert_eq!(train.validity(&found[0], 0.0, &net, &params), Validity::Stale);
    }

    #[test]
    fn signal_limit_lifted_past_next_signal() {
        let (mut net, mut train, params) = setup();
        let first = net.add_signal(200.0, SignalAspect::Restricted);
        net.add_signal(900.0, SignalAspect::Clear);
        let found = train.detect(0.0, 20.0, 1000.0, &net, &params);
        assert_eq!(found[0].required_speed, params.restricted_speed);
        train.queue.set_active(found[0]);

        net.move_train(train.id, 210.0, 4.0);
        train.complete_speed_action(210.0);
        assert_eq!(train.signal_limit.map(|l| l.signal), Some(first));
        train.update_signal_limit(&net);
        assert!(train.signal_limit.is_some());

        net.move_train(train.id, 950.0, 4.0);
        train.update_signal_limit(&net);
        assert!(train.signal_limit.is_none());
    }
}
