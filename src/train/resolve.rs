//! Merging newly detected constraints into a train's next action.

use super::{MergeOutcome, Train};
use crate::action::{ActionItem, ActionKind};
use crate::braking::braking_distance;
use crate::params::ControllerParams;
use log::debug;

/// The decision on a candidate action.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Verdict {
    /// Replace the current action, stopping at `activation` if given.
    Accept { activation: Option<f64> },
    /// The candidate is the current action.
    Same,
    Reject,
}

/// Decides whether `new` should replace `cur` as the next action.
///
/// The candidate is first tested on distance and speed: a closer candidate
/// wins unless its higher required speed cannot be shed before `cur`; a further,
/// slower candidate wins only if there is not enough room between the two to
/// shed the difference after passing `cur`. Precedence rules between specific
/// kinds of action then override the result.
///
/// # Parameters
/// * `cur` - The action currently held
/// * `new` - The candidate action
/// * `aux_busy` - Whether an auxiliary action has taken control of the train
/// * `max_decel` - The train's maximum deceleration
/// * `clearing_distance` - The tolerance within which a waiting point supersedes a signal stop
pub(crate) fn resolve(
    cur: Option<&ActionItem>,
    new: &ActionItem,
    aux_busy: bool,
    max_decel: f64,
    clearing_distance: f64,
) -> Verdict {
    if aux_busy {
        return Verdict::Reject;
    }
    let cur = match cur {
        Some(cur) => cur,
        None => return Verdict::Accept { activation: None },
    };
    if cur.same_constraint(new) {
        return Verdict::Same;
    }

    let gap = new.activation_distance - cur.activation_distance;
    let accept = if gap < 0.0 {
        new.required_speed <= cur.required_speed
            || braking_distance(new.required_speed, cur.required_speed, max_decel) <= -gap
    } else if new.required_speed < cur.required_speed {
        // The further action binds when the train, slowed to the current
        // requirement, can no longer shed the rest in the gap between them
        braking_distance(cur.required_speed, new.required_speed, max_decel) > gap
    } else {
        false
    };

    match (cur.kind, new.kind) {
        // A station stop in front of its exit signal holds the train at the platform
        (
            ActionKind::SignalAspectStop { signal },
            ActionKind::StationStop {
                exit_signal: Some(exit),
                ..
            },
        ) if signal == exit => Verdict::Accept {
            activation: Some(f64::min(cur.activation_distance, new.activation_distance)),
        },
        (
            ActionKind::StationStop {
                exit_signal: Some(exit),
                ..
            },
            ActionKind::SignalAspectStop { signal },
        ) if signal == exit => Verdict::Reject,
        (ActionKind::StationStop { .. }, ActionKind::EndOfRoute) => Verdict::Reject,
        (
            ActionKind::SignalAspectStop { .. },
            ActionKind::AuxiliaryWaitingPoint {
                locked_signal: Some(_),
                ..
            },
        ) if gap.abs() <= clearing_distance => Verdict::Accept { activation: None },
        (
            ActionKind::AuxiliaryWaitingPoint {
                locked_signal: Some(_),
                ..
            },
            ActionKind::SignalAspectStop { .. },
        ) if gap.abs() <= clearing_distance => Verdict::Reject,
        _ if accept => Verdict::Accept { activation: None },
        _ => Verdict::Reject,
    }
}

impl Train {
    /// Merges a candidate action into the train's next action.
    ///
    /// Rejected candidates are deferred and merged again on the next frame,
    /// until their activation point has been passed.
    pub fn merge(&mut self, candidate: ActionItem, params: &ControllerParams) -> MergeOutcome {
        let verdict = resolve(
            self.queue.active(),
            &candidate,
            self.aux_state.is_some(),
            self.attribs.max_decel,
            params.clearing_distance,
        );
        match verdict {
            Verdict::Accept { activation } => {
                let mut item = candidate;
                if let Some(activation) = activation {
                    item.activation_distance = activation;
                    item.trigger_distance = f64::min(item.trigger_distance, activation);
                }
                if let Some(prev) = self.queue.take_active() {
                    debug!(
                        "Train {:?}: {:?} superseded by {:?}",
                        self.id,
                        prev.tag(),
                        item.tag()
                    );
                    // Waiting points are not detected again
                    if matches!(prev.kind, ActionKind::AuxiliaryWaitingPoint { .. }) {
                        self.deferred.push(prev);
                    }
                }
                self.deferred.retain(|d| !d.same_constraint(&candidate));
                self.queue.set_active(item);
                MergeOutcome::Accepted
            }
            Verdict::Same => MergeOutcome::Unchanged,
            Verdict::Reject => {
                if !self.deferred.iter().any(|d| d.same_constraint(&candidate)) {
                    self.deferred.push(candidate);
                }
                MergeOutcome::Deferred
            }
        }
    }

    /// Merges the deferred candidates again, dropping those already passed.
    pub(crate) fn retry_deferred(&mut self, distance: f64, params: &ControllerParams) {
        self.deferred
            .retain(|item| item.activation_distance >= distance);
        let deferred = std::mem::take(&mut self.deferred);
        for item in deferred {
            self.merge(item, params);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{SignalId, StationId};
    use slotmap::KeyData;

    const DECEL: f64 = 0.5;
    const CLEARING: f64 = 30.0;

    fn signal() -> SignalId {
        SignalId::from(KeyData::from_ffi(1))
    }

    fn item(kind: ActionKind, activation: f64, required: f64) -> ActionItem {
        ActionItem::new(kind, activation - 200.0, activation, required, 0.0)
    }

    fn merge(cur: &ActionItem, new: &ActionItem) -> Verdict {
        resolve(Some(cur), new, false, DECEL, CLEARING)
    }

    #[test]
    fn accept_without_current() {
        let new = item(ActionKind::SpeedLimit, 500.0, 10.0);
        assert_eq!(
            resolve(None, &new, false, DECEL, CLEARING),
            Verdict::Accept { activation: None }
        );
    }

    #[test]
    fn merging_twice_is_a_no_op() {
        let new = item(ActionKind::SpeedLimit, 500.0, 10.0);
        assert_eq!(merge(&new, &new), Verdict::Same);
    }

    #[test]
    fn closer_and_slower_wins() {
        let cur = item(ActionKind::SpeedLimit, 800.0, 15.0);
        let new = item(ActionKind::EndOfAuthority, 500.0, 0.0);
        assert_eq!(merge(&cur, &new), Verdict::Accept { activation: None });
    }

    #[test]
    fn closer_and_faster_needs_room() {
        let cur = item(ActionKind::EndOfRoute, 600.0, 0.0);
        // Shedding 10 m/s at 0.5 m/s^2 takes 100 m
        let roomy = item(ActionKind::SpeedLimit, 450.0, 10.0);
        assert_eq!(merge(&cur, &roomy), Verdict::Accept { activation: None });
        let cramped = item(ActionKind::SpeedLimit, 550.0, 10.0);
        assert_eq!(merge(&cur, &cramped), Verdict::Reject);
    }

    #[test]
    fn further_and_slower_binds_without_room() {
        let cur = item(ActionKind::SpeedLimit, 500.0, 10.0);
        let near = item(ActionKind::EndOfRoute, 550.0, 0.0);
        assert_eq!(merge(&cur, &near), Verdict::Accept { activation: None });
        let far = item(ActionKind::EndOfRoute, 700.0, 0.0);
        assert_eq!(merge(&cur, &far), Verdict::Reject);
        let faster = item(ActionKind::SpeedLimit, 520.0, 20.0);
        assert_eq!(merge(&cur, &faster), Verdict::Reject);
    }

    #[test]
    fn station_before_exit_signal() {
        let station = StationId::from(KeyData::from_ffi(2));
        let cur = item(ActionKind::SignalAspectStop { signal: signal() }, 520.0, 0.0);
        let new = item(
            ActionKind::StationStop {
                station,
                exit_signal: Some(signal()),
            },
            530.0,
            0.0,
        );
        assert_eq!(
            merge(&cur, &new),
            Verdict::Accept {
                activation: Some(520.0)
            }
        );
        assert_eq!(merge(&new, &cur), Verdict::Reject);
    }

    #[test]
    fn end_of_route_never_preempts_station() {
        let station = StationId::from(KeyData::from_ffi(2));
        let cur = item(
            ActionKind::StationStop {
                station,
                exit_signal: None,
            },
            500.0,
            0.0,
        );
        let new = item(ActionKind::EndOfRoute, 450.0, 0.0);
        assert_eq!(merge(&cur, &new), Verdict::Reject);
    }

    #[test]
    fn waiting_point_with_locked_signal() {
        let aux = crate::AuxRefId::from(KeyData::from_ffi(3));
        let wp = item(
            ActionKind::AuxiliaryWaitingPoint {
                aux,
                locked_signal: Some(signal()),
            },
            490.0,
            0.0,
        );
        let stop = item(ActionKind::SignalAspectStop { signal: signal() }, 470.0, 0.0);
        assert_eq!(merge(&stop, &wp), Verdict::Accept { activation: None });
        assert_eq!(merge(&wp, &stop), Verdict::Reject);

        let far_stop = item(ActionKind::SignalAspectStop { signal: signal() }, 400.0, 0.0);
        assert_eq!(merge(&wp, &far_stop), Verdict::Accept { activation: None });
    }

    #[test]
    fn aux_action_blocks_replacement() {
        let cur = item(ActionKind::SpeedLimit, 800.0, 15.0);
        let new = item(ActionKind::EndOfAuthority, 500.0, 0.0);
        assert_eq!(
            resolve(Some(&cur), &new, true, DECEL, CLEARING),
            Verdict::Reject
        );
    }
}
