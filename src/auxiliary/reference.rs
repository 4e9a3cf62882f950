use super::delay::WaitingDelay;
use super::AuxContext;
use crate::action::{ActionItem, ActionKind};
use crate::braking::trigger_distance;
use crate::horn::HornPattern;
use crate::network::{Network, TrackLocation};
use crate::{ActionId, AuxRefId, CrossingId, SignalId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// What an auxiliary action reference does.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuxRefKind {
    /// Halts the train for a delay.
    WaitingPoint {
        delay: WaitingDelay,
        /// The signal delegate paired with this waiting point.
        delegate: Option<AuxRefId>,
    },
    /// Holds a signal locked until the paired waiting point is released.
    SignalDelegate {
        signal: SignalId,
        /// The waiting point this delegate is paired with.
        waiting_point: Option<AuxRefId>,
    },
    /// Sounds the horn ahead of every level crossing.
    Horn {
        pattern: HornPattern,
        /// The duration of a single blast in s, random if not given.
        duration: Option<u32>,
    },
}

/// A template from which runtime auxiliary actions are materialized.
///
/// Route bound references are tied to a location on the train's path and
/// produce a single one-shot action. Generic references are not bound to a
/// location and produce an action wherever their condition recurs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxActionRef {
    /// The location the reference is bound to; `None` for generic references.
    pub(crate) location: Option<TrackLocation>,
    pub(crate) kind: AuxRefKind,
    /// The distance travelled at which the reference's action is reached,
    /// once it has been anchored to the train's position.
    pub(crate) required_distance: Option<f64>,
    /// The live runtime instance.
    pub(crate) live: Option<ActionId>,
    /// Whether the reference has completed during the current subroute pass.
    pub(crate) done: bool,
    /// The level crossings already sounded for.
    pub(crate) sounded: SmallVec<[CrossingId; 4]>,
}

impl AuxActionRef {
    fn new(location: Option<TrackLocation>, kind: AuxRefKind) -> Self {
        Self {
            location,
            kind,
            required_distance: None,
            live: None,
            done: false,
            sounded: SmallVec::new(),
        }
    }

    /// Creates a waiting point at `location`.
    pub fn waiting_point(location: TrackLocation, delay: WaitingDelay) -> Self {
        Self::new(
            Some(location),
            AuxRefKind::WaitingPoint {
                delay,
                delegate: None,
            },
        )
    }

    /// Creates a signal delegate for `signal`, bound to `location`.
    pub fn signal_delegate(location: TrackLocation, signal: SignalId) -> Self {
        Self::new(
            Some(location),
            AuxRefKind::SignalDelegate {
                signal,
                waiting_point: None,
            },
        )
    }

    /// Creates a generic horn reference.
    pub fn horn(pattern: HornPattern, duration: Option<u32>) -> Self {
        Self::new(None, AuxRefKind::Horn { pattern, duration })
    }

    pub fn kind(&self) -> &AuxRefKind {
        &self.kind
    }

    pub fn location(&self) -> Option<&TrackLocation> {
        self.location.as_ref()
    }

    /// The distance travelled at which the action is reached, once anchored.
    pub fn required_distance(&self) -> Option<f64> {
        self.required_distance
    }

    /// Whether a runtime instance of the reference is live.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Whether the reference is generic (recurring).
    pub fn is_generic(&self) -> bool {
        self.location.is_none()
    }

    /// Whether the reference gates every reference after it on the route.
    pub fn is_gate(&self) -> bool {
        matches!(
            self.kind,
            AuxRefKind::WaitingPoint { .. } | AuxRefKind::SignalDelegate { .. }
        )
    }

    /// The reference this one is paired with.
    pub fn partner(&self) -> Option<AuxRefId> {
        match self.kind {
            AuxRefKind::WaitingPoint { delegate, .. } => delegate,
            AuxRefKind::SignalDelegate { waiting_point, .. } => waiting_point,
            AuxRefKind::Horn { .. } => None,
        }
    }

    pub(crate) fn set_partner(&mut self, partner: Option<AuxRefId>) {
        match &mut self.kind {
            AuxRefKind::WaitingPoint { delegate, .. } => *delegate = partner,
            AuxRefKind::SignalDelegate { waiting_point, .. } => *waiting_point = partner,
            AuxRefKind::Horn { .. } => {}
        }
    }

    /// The waiting point's delay.
    pub fn delay(&self) -> Option<WaitingDelay> {
        match self.kind {
            AuxRefKind::WaitingPoint { delay, .. } => Some(delay),
            _ => None,
        }
    }

    /// The signal held by a signal delegate.
    pub fn signal(&self) -> Option<SignalId> {
        match self.kind {
            AuxRefKind::SignalDelegate { signal, .. } => Some(signal),
            _ => None,
        }
    }

    /// Computes the activation and trigger distance of the reference's action.
    ///
    /// Triggers are planned from the faster of the train's present and
    /// maximum speed, so a train armed from rest still has room to brake.
    /// Returns `None` for generic references and for
    /// locations no longer ahead of the train.
    pub(crate) fn distances<N: Network + ?Sized>(
        &self,
        ctx: &AuxContext,
        net: &N,
    ) -> Option<(f64, f64)> {
        let location = self.location.as_ref()?;
        let activation = ctx.distance + net.distance_to(ctx.train, location)?;
        let trigger = match self.kind {
            AuxRefKind::WaitingPoint { .. } => {
                let speed = f64::max(ctx.speed, ctx.max_speed);
                trigger_distance(activation, speed, 0.0, ctx.max_decel, ctx.params.approach_margin)
            }
            _ => activation,
        };
        Some((activation, trigger))
    }

    /// Builds the action item for an instance of this reference.
    pub(crate) fn action(
        &self,
        id: AuxRefId,
        locked_signal: Option<SignalId>,
        activation: f64,
        trigger: f64,
        inserted_at: f64,
    ) -> ActionItem {
        let (kind, required_speed) = match self.kind {
            AuxRefKind::WaitingPoint { .. } => (
                ActionKind::AuxiliaryWaitingPoint {
                    aux: id,
                    locked_signal,
                },
                0.0,
            ),
            AuxRefKind::SignalDelegate { signal, .. } => (
                ActionKind::AuxiliarySignalDelegate { aux: id, signal },
                ActionItem::SPEED_IRRELEVANT,
            ),
            AuxRefKind::Horn { .. } => (
                ActionKind::AuxiliaryHorn { aux: id },
                ActionItem::SPEED_IRRELEVANT,
            ),
        };
        ActionItem::new(kind, trigger, activation, required_speed, inserted_at)
    }
}
