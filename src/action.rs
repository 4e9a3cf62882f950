use crate::queue::Scheduled;
use crate::{AuxRefId, SignalId, StationId, TrainId};
use serde::{Deserialize, Serialize};

/// The type of an [ActionItem], without any payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    SpeedLimit,
    SpeedSignal,
    SignalAspectStop,
    SignalAspectRestricted,
    EndOfAuthority,
    EndOfRoute,
    Reversal,
    StationStop,
    TrainAhead,
    AuxiliaryWaitingPoint,
    AuxiliaryHorn,
    AuxiliarySignalDelegate,
}

/// What an [ActionItem] represents, along with references to the objects it concerns.
/// The references are only ever used as query targets.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    /// A lower speed limit ahead.
    SpeedLimit,
    /// A speed limit imposed by a signal.
    SpeedSignal { signal: SignalId },
    /// A signal at danger.
    SignalAspectStop { signal: SignalId },
    /// A signal showing a restricted aspect.
    SignalAspectRestricted { signal: SignalId },
    /// The end of the train's movement authority.
    EndOfAuthority,
    /// The end of the train's path.
    EndOfRoute,
    /// A reversal point on the train's path.
    Reversal,
    /// A scheduled stop at a station platform.
    StationStop {
        station: StationId,
        /// The signal at the end of the platform, if there is one.
        exit_signal: Option<SignalId>,
    },
    /// Another train ahead on the same track.
    TrainAhead { train: TrainId },
    /// An auxiliary waiting point.
    AuxiliaryWaitingPoint {
        aux: AuxRefId,
        /// The signal held locked until the waiting point is released.
        locked_signal: Option<SignalId>,
    },
    /// An auxiliary horn sequence.
    AuxiliaryHorn { aux: AuxRefId },
    /// An auxiliary signal release, delegated from a waiting point.
    AuxiliarySignalDelegate { aux: AuxRefId, signal: SignalId },
}

impl ActionKind {
    /// Gets the type of the action.
    pub fn tag(&self) -> ActionType {
        match self {
            ActionKind::SpeedLimit => ActionType::SpeedLimit,
            ActionKind::SpeedSignal { .. } => ActionType::SpeedSignal,
            ActionKind::SignalAspectStop { .. } => ActionType::SignalAspectStop,
            ActionKind::SignalAspectRestricted { .. } => ActionType::SignalAspectRestricted,
            ActionKind::EndOfAuthority => ActionType::EndOfAuthority,
            ActionKind::EndOfRoute => ActionType::EndOfRoute,
            ActionKind::Reversal => ActionType::Reversal,
            ActionKind::StationStop { .. } => ActionType::StationStop,
            ActionKind::TrainAhead { .. } => ActionType::TrainAhead,
            ActionKind::AuxiliaryWaitingPoint { .. } => ActionType::AuxiliaryWaitingPoint,
            ActionKind::AuxiliaryHorn { .. } => ActionType::AuxiliaryHorn,
            ActionKind::AuxiliarySignalDelegate { .. } => ActionType::AuxiliarySignalDelegate,
        }
    }

    /// The signal the action refers to, if any.
    pub fn signal(&self) -> Option<SignalId> {
        match *self {
            ActionKind::SpeedSignal { signal }
            | ActionKind::SignalAspectStop { signal }
            | ActionKind::SignalAspectRestricted { signal }
            | ActionKind::AuxiliarySignalDelegate { signal, .. } => Some(signal),
            ActionKind::AuxiliaryWaitingPoint { locked_signal, .. } => locked_signal,
            ActionKind::StationStop { exit_signal, .. } => exit_signal,
            _ => None,
        }
    }

    /// The auxiliary reference the action was materialized from, if any.
    pub fn aux(&self) -> Option<AuxRefId> {
        match *self {
            ActionKind::AuxiliaryWaitingPoint { aux, .. }
            | ActionKind::AuxiliaryHorn { aux }
            | ActionKind::AuxiliarySignalDelegate { aux, .. } => Some(aux),
            _ => None,
        }
    }
}

/// A pending constraint on the movement of a train.
///
/// All distances are measured in "distance travelled", which increases
/// monotonically along the train's path.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    /// The distance travelled at which the train starts to react to the action, in m.
    pub trigger_distance: f64,
    /// The distance travelled at which the action's condition is reached, in m.
    pub activation_distance: f64,
    /// The speed to hold once the action is reached, in m/s.
    /// Zero is a full stop, [ActionItem::SPEED_IRRELEVANT] a purely behavioural action.
    pub required_speed: f64,
    /// The distance travelled when the action was created, in m.
    pub inserted_at: f64,
    /// What the action represents.
    pub kind: ActionKind,
}

impl ActionItem {
    /// Sentinel required speed of actions which do not constrain speed.
    pub const SPEED_IRRELEVANT: f64 = -1.0;

    /// Creates a new action item.
    pub fn new(
        kind: ActionKind,
        trigger_distance: f64,
        activation_distance: f64,
        required_speed: f64,
        inserted_at: f64,
    ) -> Self {
        Self {
            trigger_distance: f64::min(trigger_distance, activation_distance),
            activation_distance,
            required_speed,
            inserted_at,
            kind,
        }
    }

    /// Gets the type of the action.
    pub fn tag(&self) -> ActionType {
        self.kind.tag()
    }

    /// Whether the action requires the train to stop.
    pub fn is_stop(&self) -> bool {
        self.required_speed == 0.0
    }

    /// Whether the action only triggers behaviour and does not constrain speed.
    pub fn is_behavioural(&self) -> bool {
        self.required_speed < 0.0
    }

    /// The remaining distance until the action is reached, in m.
    pub fn distance_to_go(&self, distance_travelled: f64) -> f64 {
        self.activation_distance - distance_travelled
    }

    /// Whether `other` describes the same constraint at approximately the same place.
    pub fn same_constraint(&self, other: &ActionItem) -> bool {
        const TOLERANCE: f64 = 1.0; // m
        self.kind == other.kind
            && (self.activation_distance - other.activation_distance).abs() < TOLERANCE
            && (self.required_speed - other.required_speed).abs() < 0.01
    }
}

impl Scheduled for ActionItem {
    fn trigger_distance(&self) -> f64 {
        self.trigger_distance
    }
}
