use serde::{Deserialize, Serialize};

/// The control mode of a train.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementState {
    /// Placed but not yet validated.
    Init,
    /// Not driven: a parked train.
    Static,
    Stopped,
    /// Stopped, and about to leave a station.
    StoppedExisting,
    /// Dwelling at a station platform.
    StationStop,
    Turntable,
    Accelerating,
    Braking,
    Running,
    /// Following another train on the same track.
    Following,
    /// Braking for the end of the path.
    ApproachingEndOfPath,
    /// An auxiliary action is taking control.
    InitAction,
    /// An auxiliary action is holding the train.
    HandleAction,
    /// Incorporated into another train's consist.
    Suspended,
    /// Held in place after running off the end of its path.
    Frozen,
}

impl MovementState {
    /// Whether the speed controller drives the train in this state.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            MovementState::Accelerating
                | MovementState::Braking
                | MovementState::Running
                | MovementState::Following
                | MovementState::ApproachingEndOfPath
        )
    }

    /// Whether the train is standing and waiting to start.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            MovementState::Stopped | MovementState::StoppedExisting | MovementState::StationStop
        )
    }

    /// Whether the train is not driven at all.
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            MovementState::Static
                | MovementState::Turntable
                | MovementState::Suspended
                | MovementState::Frozen
        )
    }

    /// Whether this is one of the states of an executing auxiliary action.
    pub fn is_aux(&self) -> bool {
        matches!(self, MovementState::InitAction | MovementState::HandleAction)
    }
}

/// Why a train was taken out of the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    /// The train's position could no longer be resolved on its path.
    OffRoute,
    /// The network found the train's authority contradicting track occupancy.
    OutOfControl,
    /// The train reached the end of its path.
    EndOfPath,
}

/// The result of updating a train for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Continue,
    /// The train must be removed from the simulation.
    Remove(RemovalReason),
}

/// The result of merging a candidate action into a train's next action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The candidate replaced the next action.
    Accepted,
    /// The candidate describes the next action already held.
    Unchanged,
    /// The candidate was kept back, to be re-evaluated on the next frame.
    Deferred,
}
