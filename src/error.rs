use crate::{ActionId, AuxRefId, TrainId};

/// Errors raised when loading parameters or restoring a saved train.
///
/// Control flow inside a simulation frame never produces these;
/// trains which can no longer be driven are reported through
/// [UpdateOutcome](crate::UpdateOutcome) instead.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The JSON representation could not be parsed.
    #[error("malformed state: {source}")]
    Json {
        /// The underlying parse error.
        #[from]
        source: serde_json::Error,
    },

    /// A controller parameter is out of range.
    #[error("invalid parameter {field}: {value}")]
    InvalidParam {
        /// The offending field.
        field: &'static str,
        /// The value it was given.
        value: f64,
    },

    /// An auxiliary action is paired with a reference which does not exist.
    #[error("auxiliary action {0:?} is paired with a missing reference")]
    DanglingPair(AuxRefId),

    /// An auxiliary reference or instance refers to a reference which does not exist.
    #[error("unknown auxiliary reference {0:?}")]
    UnknownReference(AuxRefId),

    /// A saved action is not present in the queue which should hold it.
    #[error("action {0:?} is not in the queue")]
    UnknownAction(ActionId),

    /// A snapshot was restored for a train which is not part of the simulation.
    #[error("train {0:?} is not in the simulation")]
    UnknownTrain(TrainId),
}
