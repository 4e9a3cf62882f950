pub use action::{ActionItem, ActionKind, ActionType};
pub use auxiliary::{
    AuxActionRef, AuxActionsContainer, AuxEvent, AuxRefKind, AuxState, WaitingDelay,
};
pub use consist::PointMassConsist;
pub use error::StateError;
pub use horn::{HornPattern, HornSequence, HornSignal, HornStep};
pub use network::{
    Authority, AuthorityKind, ConsistControl, CrossingInfo, Network, RoutePosition, SignalAspect,
    SignalInfo, SpeedPost, TrackLocation, TrainAheadInfo,
};
pub use params::{ControllerParams, TrainAttributes};
pub use queue::{ActionQueue, Scheduled};
pub use save::TrainSnapshot;
pub use simulation::Simulation;
pub use slotmap::{Key, KeyData};
use slotmap::new_key_type;
pub use track::{LineNetwork, LinePath};
pub use train::{
    MergeOutcome, MovementState, RemovalReason, StationStop, TickContext, Train, UpdateOutcome,
};
pub use util::Interval;

mod action;
mod auxiliary;
pub mod braking;
mod consist;
mod error;
mod horn;
mod network;
mod params;
mod queue;
mod save;
mod simulation;
mod track;
mod train;
mod util;

new_key_type! {
    /// Unique ID of an [ActionItem] within a train's queue.
    pub struct ActionId;
    /// Unique ID of a [Train].
    pub struct TrainId;
    /// Unique ID of a signal known to the [Network].
    pub struct SignalId;
    /// Unique ID of a station platform.
    pub struct StationId;
    /// Unique ID of a level crossing.
    pub struct CrossingId;
    /// Unique ID of an [AuxActionRef] within a train's auxiliary container.
    pub struct AuxRefId;
}
