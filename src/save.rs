//! Saving and restoring the state of a train.

use crate::action::{ActionItem, ActionType};
use crate::auxiliary::AuxActionsContainer;
use crate::error::StateError;
use crate::params::{ControllerParams, TrainAttributes};
use crate::queue::ActionQueue;
use crate::train::control::SpeedController;
use crate::train::{Dwell, MovementState, SignalLimit, StationStop, Train};
use crate::TrainId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// The saved state of a train's controller.
///
/// Times are saved as clock values along with the clock at which the
/// snapshot was taken, so that pending delays resume on restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainSnapshot {
    id: TrainId,
    /// The clock when the snapshot was taken, in s.
    clock: f64,
    state: MovementState,
    aux_state: Option<MovementState>,
    queue: ActionQueue<ActionItem>,
    deferred: SmallVec<[ActionItem; 4]>,
    aux: AuxActionsContainer,
    stations: VecDeque<StationStop>,
    dwell: Option<Dwell>,
    restart_at: Option<f64>,
    controller: SpeedController,
    signal_limit: Option<SignalLimit>,
    last_action: Option<ActionType>,
    end_of_path_at: Option<f64>,
    distance: f64,
    speed: f64,
}

impl TrainSnapshot {
    /// The ID of the saved train.
    pub fn id(&self) -> TrainId {
        self.id
    }

    /// The clock when the snapshot was taken, in s.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StateError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Train {
    /// Takes a snapshot of the train's state at the given clock time.
    pub fn snapshot(&self, clock: f64) -> TrainSnapshot {
        TrainSnapshot {
            id: self.id,
            clock,
            state: self.state,
            aux_state: self.aux_state,
            queue: self.queue.clone(),
            deferred: self.deferred.clone(),
            aux: self.aux.clone(),
            stations: self.stations.clone(),
            dwell: self.dwell,
            restart_at: self.restart_at,
            controller: self.controller.clone(),
            signal_limit: self.signal_limit,
            last_action: self.last_action,
            end_of_path_at: self.end_of_path_at,
            distance: self.distance,
            speed: self.speed,
        }
    }

    /// Restores a train from a snapshot.
    ///
    /// Dwell and restart times keep their remaining time relative to `clock`.
    /// Absolute waiting point departures are recomputed from `clock`.
    ///
    /// # Errors
    /// Fails if the snapshot's queues or auxiliary references are inconsistent.
    pub fn restore(
        snapshot: TrainSnapshot,
        attribs: TrainAttributes,
        params: &ControllerParams,
        clock: f64,
    ) -> Result<Train, StateError> {
        snapshot
            .queue
            .is_consistent()
            .map_err(StateError::UnknownAction)?;
        snapshot.aux.validate()?;

        let shift = clock - snapshot.clock;
        let mut aux = snapshot.aux;
        aux.restore_clock(snapshot.clock, clock, params);

        let mut train = Train::new(snapshot.id, attribs, params);
        train.state = snapshot.state;
        train.aux_state = snapshot.aux_state;
        train.queue = snapshot.queue;
        train.deferred = snapshot.deferred;
        train.aux = aux;
        train.stations = snapshot.stations;
        train.dwell = snapshot.dwell.map(|dwell| Dwell {
            arrived: dwell.arrived + shift,
            depart: dwell.depart + shift,
            ..dwell
        });
        train.restart_at = snapshot.restart_at.map(|time| time + shift);
        train.controller = snapshot.controller;
        train.signal_limit = snapshot.signal_limit;
        train.last_action = snapshot.last_action;
        train.end_of_path_at = snapshot.end_of_path_at;
        train.distance = snapshot.distance;
        train.speed = snapshot.speed;
        Ok(train)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::ActionKind;
    use crate::auxiliary::{AuxActionRef, WaitingDelay};
    use crate::network::TrackLocation;
    use slotmap::SlotMap;

    fn train() -> (Train, ControllerParams) {
        let params = ControllerParams::default();
        let id = SlotMap::<TrainId, ()>::with_key().insert(());
        (Train::new(id, TrainAttributes::default(), &params), params)
    }

    fn location(offset: f64) -> TrackLocation {
        TrackLocation {
            subroute: 0,
            route_index: 5,
            section: 5,
            offset,
        }
    }

    #[test]
    fn json_round_trip() {
        let (mut train, params) = train();
        train.queue.insert(ActionItem::new(ActionKind::SpeedLimit, 100.0, 400.0, 10.0, 0.0));
        train.merge(
            ActionItem::new(ActionKind::EndOfRoute, 0.0, 900.0, 0.0, 0.0),
            &params,
        );
        train.set_state(MovementState::Braking);
        train.restart_at = Some(120.0);
        let wp = train.aux_mut().add(AuxActionRef::waiting_point(
            location(10.0),
            WaitingDelay::Seconds(30),
        ));

        let json = train.snapshot(100.0).to_json().unwrap();
        let snapshot = TrainSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot.clock(), 100.0);
        let restored = Train::restore(snapshot, TrainAttributes::default(), &params, 200.0).unwrap();

        assert_eq!(restored.id(), train.id());
        assert_eq!(restored.state(), MovementState::Braking);
        assert_eq!(restored.next_action(), train.next_action());
        assert_eq!(restored.pending_actions().count(), 1);
        assert_eq!(restored.restart_at, Some(220.0));
        assert!(restored.aux().get(wp).is_some());
    }

    #[test]
    fn rejects_dangling_pair() {
        let (mut train, params) = train();
        let wp = train.aux_mut().add(AuxActionRef::waiting_point(
            location(10.0),
            WaitingDelay::Seconds(30),
        ));
        let delegate = train.aux_mut().add(AuxActionRef::signal_delegate(
            location(20.0),
            crate::SignalId::default(),
        ));
        assert!(train.aux_mut().pair(wp, delegate));
        let json = train.snapshot(0.0).to_json().unwrap();
        let broken = corrupt_partner(serde_json::from_str(&json).unwrap());
        let snapshot = TrainSnapshot::from_json(&broken).unwrap();
        let err = Train::restore(snapshot, TrainAttributes::default(), &params, 0.0).unwrap_err();
        assert!(matches!(err, StateError::DanglingPair(_)));
    }

    /// Points every partner link at a reference which does not exist.
    fn corrupt_partner(mut value: serde_json::Value) -> String {
        fn walk(value: &mut serde_json::Value) {
            match value {
                serde_json::Value::Object(map) => {
                    for (key, field) in map.iter_mut() {
                        if (key == "delegate" || key == "waiting_point") && !field.is_null() {
                            *field = serde_json::json!({ "idx": 4000, "version": 1 });
                        } else {
                            walk(field);
                        }
                    }
                }
                serde_json::Value::Array(items) => items.iter_mut().for_each(walk),
                _ => {}
            }
        }
        walk(&mut value);
        value.to_string()
    }

    #[test]
    fn malformed_snapshot() {
        let err = TrainSnapshot::from_json("{\"id\": ").unwrap_err();
        assert!(matches!(err, StateError::Json { .. }));
    }
}
