//! Auxiliary behaviours layered onto a train's scheduled actions: waiting
//! points, signal delegates and horn sequences.

use crate::action::{ActionItem, ActionKind};
use crate::error::StateError;
use crate::horn::HornSequence;
use crate::network::{ConsistControl, Network};
use crate::params::ControllerParams;
use crate::queue::{ActionQueue, Scheduled};
use crate::{ActionId, AuxRefId, CrossingId, SignalId, TrainId};
use itertools::Itertools;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use smallvec::SmallVec;

pub use delay::WaitingDelay;
pub use reference::{AuxActionRef, AuxRefKind};

mod delay;
mod reference;

/// The state of a train as seen by its auxiliary actions in a frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AuxContext<'a> {
    pub train: TrainId,
    /// The distance travelled in m.
    pub distance: f64,
    /// The speed in m/s.
    pub speed: f64,
    /// The maximum speed of the train in m/s.
    pub max_speed: f64,
    /// The maximum deceleration of the train in m/s<sup>2</sup>.
    pub max_decel: f64,
    /// The simulation clock in s.
    pub clock: f64,
    /// The time elapsed since the previous frame in s.
    pub elapsed: f64,
    pub stopped: bool,
    pub params: &'a ControllerParams,
}

/// The progress of a runtime auxiliary action.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuxState {
    /// Waiting for the trigger distance to be reached.
    Armed,
    /// A waiting point the train is braking for.
    Approaching,
    /// A waiting point holding the train until `depart`,
    /// or until permission is granted if there is no departure time.
    Holding { depart: Option<f64> },
    /// A signal delegate holding its signal locked, which is not
    /// released before `release_after`.
    Locking { release_after: Option<f64> },
    /// A horn sequence is sounding.
    Sounding,
    Completed,
}

/// A runtime instance of an auxiliary reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct AuxInstance {
    pub reference: AuxRefId,
    pub action: ActionItem,
    pub state: AuxState,
    pub horn: Option<HornSequence>,
    pub crossing: Option<CrossingId>,
}

impl AuxInstance {
    fn new(reference: AuxRefId, action: ActionItem, state: AuxState) -> Self {
        Self {
            reference,
            action,
            state,
            horn: None,
            crossing: None,
        }
    }

    fn can_remove<N: Network + ?Sized>(&self, net: &N, train: TrainId) -> bool {
        match (self.state, self.action.kind) {
            (AuxState::Completed, _) => true,
            (_, ActionKind::AuxiliarySignalDelegate { signal, .. }) => {
                net.signal(train, signal).is_none()
            }
            _ => false,
        }
    }
}

impl Scheduled for AuxInstance {
    fn trigger_distance(&self) -> f64 {
        self.action.trigger_distance
    }
}

/// Something an auxiliary action asks of its train.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AuxEvent {
    /// A waiting point the train must stop at.
    Candidate(ActionItem),
    /// The train has stopped at a waiting point, which now holds it.
    InitAction(AuxRefId),
    /// A waiting point has released the train.
    Release(AuxRefId),
    /// The waiting point asks the train to attach to the train ahead.
    RequestAttach(AuxRefId),
    /// Cars were detached at the waiting point.
    Decoupled(AuxRefId),
    /// A horn sequence has started ahead of a level crossing.
    HornStarted(CrossingId),
}

/// The auxiliary actions of a single train.
///
/// Route bound references produce one-shot actions in the specific queue.
/// Generic references produce recurring actions in the generic queue.
/// A reference has at most one live runtime instance at a time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuxActionsContainer {
    refs: SlotMap<AuxRefId, AuxActionRef>,
    /// The route bound references, ordered by location along the path.
    route_bound: Vec<AuxRefId>,
    /// The generic references.
    generic_refs: Vec<AuxRefId>,
    generic: ActionQueue<AuxInstance>,
    specific: ActionQueue<AuxInstance>,
}

impl AuxActionsContainer {
    /// Creates an empty container.
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds an auxiliary action reference.
    pub fn add(&mut self, reference: AuxActionRef) -> AuxRefId {
        let generic = reference.is_generic();
        let id = self.refs.insert(reference);
        if generic {
            self.generic_refs.push(id);
        } else {
            self.route_bound.push(id);
            self.sort_route_bound();
        }
        id
    }

    /// Pairs a waiting point with a signal delegate, which then holds
    /// its signal locked until the waiting point releases the train.
    /// Returns `false` if the references are not a waiting point and a signal delegate.
    pub fn pair(&mut self, waiting_point: AuxRefId, delegate: AuxRefId) -> bool {
        let valid = matches!(
            self.refs.get(waiting_point).map(|r| &r.kind),
            Some(AuxRefKind::WaitingPoint { .. })
        ) && matches!(
            self.refs.get(delegate).map(|r| &r.kind),
            Some(AuxRefKind::SignalDelegate { .. })
        );
        if valid {
            self.unlink(waiting_point);
            self.unlink(delegate);
            self.refs[waiting_point].set_partner(Some(delegate));
            self.refs[delegate].set_partner(Some(waiting_point));
        }
        valid
    }

    /// Dissolves the pairing of a reference, from both sides.
    pub fn unlink(&mut self, id: AuxRefId) {
        let partner = match self.refs.get_mut(id) {
            Some(reference) => {
                let partner = reference.partner();
                reference.set_partner(None);
                partner
            }
            None => return,
        };
        let partner = match partner {
            Some(partner) => partner,
            None => return,
        };
        if let Some(reference) = self.refs.get_mut(partner) {
            reference.set_partner(None);
        }
        // A live waiting point no longer holds a locked signal
        for wp in [id, partner] {
            if let Some(instance) = self.live_instance_mut(wp) {
                if let ActionKind::AuxiliaryWaitingPoint { locked_signal, .. } =
                    &mut instance.action.kind
                {
                    *locked_signal = None;
                }
            }
        }
    }

    /// Gets a reference by ID.
    pub fn get(&self, id: AuxRefId) -> Option<&AuxActionRef> {
        self.refs.get(id)
    }

    /// Iterates over the route bound references in route order.
    pub fn iter_route_bound(&self) -> impl Iterator<Item = (AuxRefId, &AuxActionRef)> + '_ {
        self.route_bound.iter().map(move |id| (*id, &self.refs[*id]))
    }

    /// The number of live runtime instances.
    pub fn live_count(&self) -> usize {
        self.generic.len() + self.specific.len()
    }

    /// The state of a reference's live instance.
    pub fn live_state(&self, id: AuxRefId) -> Option<AuxState> {
        let live = self.refs.get(id)?.live?;
        self.specific
            .get(live)
            .or_else(|| self.generic.get(live))
            .map(|instance| instance.state)
    }

    /// Whether a horn sequence is sounding.
    pub fn horn_active(&self) -> bool {
        !self.generic.is_empty()
    }

    /// Materializes the route bound references on the train's current subroute.
    ///
    /// References are visited in route order. Arming stops at the first
    /// waiting point or signal delegate which is live or has just been
    /// materialized. Returns the number of instances materialized.
    pub(crate) fn arm<N: Network + ?Sized>(&mut self, ctx: &AuxContext, net: &N) -> usize {
        let subroute = match net.position(ctx.train) {
            Some(position) => position.subroute(),
            None => return 0,
        };
        let mut armed = 0;
        for idx in 0..self.route_bound.len() {
            let id = self.route_bound[idx];
            let reference = &self.refs[id];
            match reference.location {
                Some(location) if location.subroute == subroute => {}
                _ => continue,
            }
            if reference.done {
                continue;
            }
            if reference.is_live() {
                if reference.is_gate() {
                    break;
                }
                continue;
            }
            let delegate = match reference.kind {
                AuxRefKind::WaitingPoint { delegate, .. } => delegate,
                // Paired delegates are armed along with their waiting point
                AuxRefKind::SignalDelegate {
                    waiting_point: Some(_),
                    ..
                } => continue,
                _ => None,
            };
            let distances = reference.distances(ctx, net);
            let (activation, trigger) = match distances {
                Some(distances) => distances,
                None => {
                    debug!("Auxiliary action {:?} already passed", id);
                    self.refs[id].done = true;
                    self.unlink(id);
                    continue;
                }
            };
            let locked_signal = delegate.and_then(|d| self.refs.get(d)).and_then(|d| d.signal());
            self.materialize(id, locked_signal, activation, trigger, ctx.distance);
            armed += 1;
            if let Some(delegate) = delegate {
                let (activation, trigger) = self.refs[delegate]
                    .distances(ctx, net)
                    .unwrap_or((activation, activation));
                self.materialize(delegate, None, activation, trigger, ctx.distance);
                armed += 1;
            }
            if self.refs[id].is_gate() {
                break;
            }
        }
        armed
    }

    fn materialize(
        &mut self,
        id: AuxRefId,
        locked_signal: Option<SignalId>,
        activation: f64,
        trigger: f64,
        inserted_at: f64,
    ) {
        let reference = &self.refs[id];
        let action = reference.action(id, locked_signal, activation, trigger, inserted_at);
        let live = self
            .specific
            .insert(AuxInstance::new(id, action, AuxState::Armed));
        let reference = &mut self.refs[id];
        reference.live = Some(live);
        reference.required_distance = Some(activation);
        debug!(
            "Armed auxiliary action {:?} at {:.1} m, trigger {:.1} m",
            action.kind, activation, action.trigger_distance
        );
    }

    /// Runs the generic auxiliary actions.
    ///
    /// Each horn reference starts a sequence for every level crossing
    /// which comes within its activation window, and advances the
    /// sequences already sounding.
    pub(crate) fn tick_generic<N, C>(
        &mut self,
        ctx: &AuxContext,
        net: &N,
        consist: &mut C,
        rng: &mut impl Rng,
    ) -> SmallVec<[AuxEvent; 2]>
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        let mut events = SmallVec::new();
        let refs = &mut self.refs;
        let generic = &mut self.generic;

        for &id in &self.generic_refs {
            let reference = &mut refs[id];
            let (pattern, duration) = match reference.kind {
                AuxRefKind::Horn { pattern, duration } => (pattern, duration),
                _ => continue,
            };
            let window = ctx.speed * pattern.activation_window();
            let crossings =
                net.level_crossings(ctx.train, f64::max(window, ctx.params.min_check_distance));
            reference
                .sounded
                .retain(|sounded| crossings.iter().any(|c| c.id == *sounded));

            if reference.is_live() || ctx.speed <= ctx.params.stopped_tolerance {
                continue;
            }
            let crossing = crossings
                .iter()
                .filter(|c| c.distance <= window && !reference.sounded.contains(&c.id))
                .min_by(|a, b| a.distance.total_cmp(&b.distance));
            if let Some(crossing) = crossing {
                let horn = HornSequence::new(pattern, duration, consist.horn_rings_bell(), rng);
                let action = reference.action(
                    id,
                    None,
                    ctx.distance + crossing.distance,
                    ctx.distance,
                    ctx.distance,
                );
                let mut instance = AuxInstance::new(id, action, AuxState::Sounding);
                instance.horn = Some(horn);
                instance.crossing = Some(crossing.id);
                reference.sounded.push(crossing.id);
                reference.live = Some(generic.insert(instance));
                debug!("Sounding horn for crossing {:?}", crossing.id);
                events.push(AuxEvent::HornStarted(crossing.id));
            }
        }

        let ready = self
            .generic
            .iter()
            .filter(|(_, instance)| instance.action.trigger_distance <= ctx.distance)
            .map(|(live, _)| live)
            .collect::<SmallVec<[ActionId; 4]>>();
        for live in ready {
            if let Some(instance) = self.generic.get_mut(live) {
                let running = match &mut instance.horn {
                    Some(horn) => horn.advance(ctx.elapsed, consist),
                    None => false,
                };
                if !running {
                    instance.state = AuxState::Completed;
                }
            }
        }

        let finished = self
            .generic
            .iter()
            .filter(|(_, instance)| instance.state == AuxState::Completed)
            .map(|(live, _)| live)
            .collect::<SmallVec<[ActionId; 4]>>();
        for live in finished {
            if let Some(instance) = self.generic.remove(live) {
                if let Some(reference) = self.refs.get_mut(instance.reference) {
                    reference.live = None;
                }
            }
        }
        events
    }

    /// Runs the route bound auxiliary actions.
    ///
    /// A signal delegate bound to an absolute-time waiting point is skipped
    /// until the waiting point's departure time, so it is not released early.
    pub(crate) fn tick_specific<N, C>(
        &mut self,
        ctx: &AuxContext,
        net: &mut N,
        consist: &mut C,
    ) -> SmallVec<[AuxEvent; 4]>
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        let mut events = SmallVec::new();
        let ids = self
            .specific
            .iter()
            .map(|(live, _)| live)
            .collect::<SmallVec<[ActionId; 8]>>();

        for live in ids {
            let (id, action, state) = match self.specific.get(live) {
                Some(instance) => (instance.reference, instance.action, instance.state),
                None => continue,
            };
            let kind = match self.refs.get(id) {
                Some(reference) => reference.kind,
                None => continue,
            };
            let next = match kind {
                AuxRefKind::WaitingPoint { delay, delegate } => self.tick_waiting_point(
                    ctx,
                    net,
                    consist,
                    (id, delay, delegate),
                    &action,
                    state,
                    &mut events,
                ),
                AuxRefKind::SignalDelegate {
                    signal,
                    waiting_point,
                } => {
                    let wp_live = waiting_point
                        .and_then(|wp| self.refs.get(wp))
                        .map_or(false, |wp| wp.is_live());
                    match state {
                        AuxState::Locking {
                            release_after: Some(time),
                        } if ctx.clock < time => state,
                        AuxState::Armed | AuxState::Locking { .. } if wp_live => state,
                        AuxState::Locking { .. } => {
                            Self::release_signal(net, signal, ctx.train);
                            AuxState::Completed
                        }
                        AuxState::Armed if ctx.distance >= action.trigger_distance => {
                            Self::release_signal(net, signal, ctx.train);
                            AuxState::Completed
                        }
                        _ => state,
                    }
                }
                AuxRefKind::Horn { .. } => state,
            };
            if let Some(instance) = self.specific.get_mut(live) {
                instance.state = next;
            }
        }

        self.retire_removable(ctx.train, net);
        events
    }

    #[allow(clippy::too_many_arguments)]
    fn tick_waiting_point<N, C>(
        &mut self,
        ctx: &AuxContext,
        net: &mut N,
        consist: &mut C,
        (id, delay, delegate): (AuxRefId, WaitingDelay, Option<AuxRefId>),
        action: &ActionItem,
        state: AuxState,
        events: &mut SmallVec<[AuxEvent; 4]>,
    ) -> AuxState
    where
        N: Network + ?Sized,
        C: ConsistControl + ?Sized,
    {
        let distance_to_go = action.distance_to_go(ctx.distance);
        match state {
            AuxState::Armed if ctx.distance >= action.trigger_distance => {
                // The paired delegate locks its signal as the train approaches
                if let Some((delegate, signal)) = self.delegate_signal(delegate) {
                    net.lock_signal(signal, ctx.train);
                    if let Some(instance) = self.live_instance_mut(delegate) {
                        instance.state = AuxState::Locking {
                            release_after: None,
                        };
                    }
                }
                events.push(AuxEvent::Candidate(*action));
                AuxState::Approaching
            }
            AuxState::Approaching
                if ctx.stopped && distance_to_go <= ctx.params.arrival_distance =>
            {
                match delay {
                    WaitingDelay::Uncouple { keep, from_front } => {
                        if consist.detach_cars(keep, from_front) {
                            events.push(AuxEvent::Decoupled(id));
                        } else {
                            debug!("Cannot keep {} cars at waiting point {:?}", keep, id);
                        }
                    }
                    WaitingDelay::Attach => events.push(AuxEvent::RequestAttach(id)),
                    _ => {}
                }
                let depart = delay.departure(ctx.clock, ctx.params.uncouple_hold);
                if delay.is_absolute() {
                    if let Some(instance) = delegate.and_then(|d| self.live_instance_mut(d)) {
                        instance.state = AuxState::Locking {
                            release_after: depart,
                        };
                    }
                }
                debug!("Holding at waiting point {:?} until {:?}", id, depart);
                events.push(AuxEvent::InitAction(id));
                AuxState::Holding { depart }
            }
            AuxState::Approaching if distance_to_go < -ctx.params.arrival_distance => {
                debug!("Waiting point {:?} passed without stopping", id);
                if let Some((delegate, signal)) = self.delegate_signal(delegate) {
                    Self::release_signal(net, signal, ctx.train);
                    if let Some(instance) = self.live_instance_mut(delegate) {
                        instance.state = AuxState::Completed;
                    }
                }
                AuxState::Completed
            }
            AuxState::Holding { depart } => {
                let released = match depart {
                    Some(time) => ctx.clock >= time,
                    None => net.request_permission(ctx.train),
                };
                if !released {
                    return state;
                }
                if let Some((delegate, signal)) = self.delegate_signal(delegate) {
                    Self::release_signal(net, signal, ctx.train);
                    if let Some(instance) = self.live_instance_mut(delegate) {
                        instance.state = AuxState::Completed;
                    }
                }
                events.push(AuxEvent::Release(id));
                AuxState::Completed
            }
            _ => state,
        }
    }

    fn delegate_signal(&self, delegate: Option<AuxRefId>) -> Option<(AuxRefId, SignalId)> {
        let delegate = delegate?;
        let signal = self.refs.get(delegate)?.signal()?;
        Some((delegate, signal))
    }

    fn release_signal<N: Network + ?Sized>(net: &mut N, signal: SignalId, train: TrainId) {
        net.unlock_signal(signal, train);
        if !net.request_clear(signal, train) {
            debug!("Signal {:?} did not clear after release", signal);
        }
    }

    fn live_instance_mut(&mut self, id: AuxRefId) -> Option<&mut AuxInstance> {
        let live = self.refs.get(id)?.live?;
        match self.specific.get_mut(live) {
            Some(instance) => Some(instance),
            None => self.generic.get_mut(live),
        }
    }

    /// Removes the live instance of a reference, if it is ready to be removed.
    pub fn remove<N: Network + ?Sized>(&mut self, id: AuxRefId, net: &mut N, train: TrainId) -> bool {
        let live = match self.refs.get(id).and_then(|r| r.live) {
            Some(live) => live,
            None => return false,
        };
        let (generic, removable) = match (self.specific.get(live), self.generic.get(live)) {
            (Some(instance), _) => (false, instance.can_remove(&*net, train)),
            (None, Some(instance)) => (true, instance.can_remove(&*net, train)),
            (None, None) => return false,
        };
        if removable {
            self.retire(live, generic, net, train);
        }
        removable
    }

    fn retire_removable<N: Network + ?Sized>(&mut self, train: TrainId, net: &mut N) {
        let refs = &self.refs;
        let removable = self
            .specific
            .iter()
            .filter(|(_, instance)| {
                instance.can_remove(&*net, train) && !Self::held_by_waiting_point(refs, instance)
            })
            .map(|(live, _)| live)
            .collect::<SmallVec<[ActionId; 4]>>();
        for live in removable {
            self.retire(live, false, net, train);
        }
    }

    /// Whether an unfinished instance is paired with a live waiting point,
    /// which releases it.
    fn held_by_waiting_point(refs: &SlotMap<AuxRefId, AuxActionRef>, instance: &AuxInstance) -> bool {
        instance.state != AuxState::Completed
            && refs
                .get(instance.reference)
                .and_then(|reference| reference.partner())
                .and_then(|partner| refs.get(partner))
                .map_or(false, |partner| partner.is_live())
    }

    fn retire<N: Network + ?Sized>(&mut self, live: ActionId, generic: bool, net: &mut N, train: TrainId) {
        let queue = if generic {
            &mut self.generic
        } else {
            &mut self.specific
        };
        let instance = match queue.remove(live) {
            Some(instance) => instance,
            None => return,
        };
        if let (AuxState::Locking { .. }, Some(signal)) = (instance.state, instance.action.kind.signal()) {
            net.unlock_signal(signal, train);
        }
        if let Some(reference) = self.refs.get_mut(instance.reference) {
            if reference.live == Some(live) {
                reference.live = None;
            }
            if !reference.is_generic() {
                reference.done = true;
                if reference.is_gate() {
                    self.unlink(instance.reference);
                }
            }
        }
        debug!("Removed auxiliary action {:?}", instance.action.kind);
    }

    /// Re-anchors the waiting points coinciding with the train after it
    /// has reversed onto a new subroute, along with their paired signal
    /// delegates. Other live instances are dropped.
    pub(crate) fn relocate_on_reversal<N: Network + ?Sized>(&mut self, ctx: &AuxContext, net: &mut N) {
        let position = match net.position(ctx.train) {
            Some(position) => position,
            None => return,
        };
        let subroute = position.subroute();
        let mut anchored = SmallVec::<[AuxRefId; 4]>::new();
        for &id in &self.route_bound {
            let reference = &mut self.refs[id];
            let is_wp = matches!(reference.kind, AuxRefKind::WaitingPoint { .. });
            let location = match reference.location.as_mut() {
                Some(location) if is_wp && location.subroute < subroute => location,
                _ => continue,
            };
            if location.section != position.front.section
                && location.section != position.rear_section
            {
                continue;
            }
            if let Some(route_index) = net.route_index_of(ctx.train, location.section) {
                location.subroute = subroute;
                location.route_index = route_index;
                if net.distance_to(ctx.train, location).is_none() {
                    *location = position.front;
                }
                reference.done = false;
                anchored.push(id);
                debug!("Waiting point {:?} moved to subroute {}", id, subroute);
            }
        }
        let delegates = anchored
            .iter()
            .filter_map(|id| self.refs[*id].partner())
            .collect::<SmallVec<[AuxRefId; 4]>>();
        for id in delegates {
            let reference = match self.refs.get_mut(id) {
                Some(reference) => reference,
                None => continue,
            };
            if let Some(location) = reference.location.as_mut() {
                if let Some(route_index) = net.route_index_of(ctx.train, location.section) {
                    location.subroute = subroute;
                    location.route_index = route_index;
                }
            }
            reference.done = false;
            anchored.push(id);
        }

        let stale = self
            .specific
            .iter()
            .filter(|(_, instance)| !anchored.contains(&instance.reference))
            .map(|(live, _)| live)
            .collect::<SmallVec<[ActionId; 4]>>();
        for live in stale {
            self.retire(live, false, net, ctx.train);
        }
        for id in anchored {
            self.reanchor(id, ctx, net);
        }
        self.sort_route_bound();
    }

    /// Re-anchors the live waiting points after cars have been detached.
    pub(crate) fn relocate_on_decouple<N: Network + ?Sized>(&mut self, ctx: &AuxContext, net: &N) {
        let live = self
            .route_bound
            .iter()
            .copied()
            .filter(|id| {
                let reference = &self.refs[*id];
                reference.is_live() && matches!(reference.kind, AuxRefKind::WaitingPoint { .. })
            })
            .collect::<SmallVec<[AuxRefId; 4]>>();
        for id in live {
            self.reanchor(id, ctx, net);
        }
    }

    /// Recomputes the required distance of a reference from the train's position.
    /// References no longer ahead of the train are anchored at its present position.
    fn reanchor<N: Network + ?Sized>(&mut self, id: AuxRefId, ctx: &AuxContext, net: &N) {
        let reference = &mut self.refs[id];
        let (activation, trigger) = reference
            .distances(ctx, net)
            .unwrap_or((ctx.distance, ctx.distance));
        reference.required_distance = Some(activation);
        if let Some(live) = reference.live {
            if let Some(instance) = self.specific.get_mut(live) {
                instance.action.activation_distance = activation;
                instance.action.trigger_distance = f64::min(trigger, activation);
            }
            self.specific.reschedule(live);
        }
    }

    /// Drops every runtime instance, releasing any locked signals,
    /// so that the references are armed afresh on a new route.
    pub(crate) fn reset<N: Network + ?Sized>(&mut self, net: &mut N, train: TrainId) {
        for (_, instance) in self.specific.iter_all() {
            if let (AuxState::Locking { .. }, Some(signal)) =
                (instance.state, instance.action.kind.signal())
            {
                net.unlock_signal(signal, train);
            }
        }
        self.specific.clear_pending(false);
        self.generic.clear_pending(false);
        for reference in self.refs.values_mut() {
            reference.live = None;
            reference.done = false;
            reference.sounded.clear();
        }
    }

    /// Adjusts the departure times of held waiting points after a restore.
    ///
    /// Relative delays keep their remaining time. Absolute delays are
    /// recomputed from the clock.
    pub(crate) fn restore_clock(&mut self, saved_clock: f64, clock: f64, params: &ControllerParams) {
        let shift = clock - saved_clock;
        let live = self
            .specific
            .iter()
            .map(|(live, instance)| (live, instance.reference))
            .collect::<SmallVec<[(ActionId, AuxRefId); 8]>>();
        for (live, id) in live {
            let reference = &self.refs[id];
            let absolute_depart = reference
                .delay()
                .or_else(|| reference.partner().and_then(|p| self.refs.get(p)?.delay()))
                .filter(|delay| delay.is_absolute())
                .and_then(|delay| delay.departure(clock, params.uncouple_hold));
            if let Some(instance) = self.specific.get_mut(live) {
                match &mut instance.state {
                    AuxState::Holding {
                        depart: Some(time),
                    }
                    | AuxState::Locking {
                        release_after: Some(time),
                    } => *time = absolute_depart.unwrap_or(*time + shift),
                    _ => {}
                }
            }
        }
    }

    /// Checks the references and queues of a restored container.
    pub(crate) fn validate(&self) -> Result<(), StateError> {
        for &id in self.route_bound.iter().chain(&self.generic_refs) {
            if !self.refs.contains_key(id) {
                return Err(StateError::UnknownReference(id));
            }
        }
        for (id, reference) in &self.refs {
            if let Some(partner) = reference.partner() {
                let back = self.refs.get(partner).and_then(|p| p.partner());
                if back != Some(id) {
                    return Err(StateError::DanglingPair(id));
                }
            }
            if let Some(live) = reference.live {
                if self.specific.get(live).is_none() && self.generic.get(live).is_none() {
                    return Err(StateError::UnknownAction(live));
                }
            }
        }
        for (_, instance) in self.specific.iter_all().chain(self.generic.iter_all()) {
            if !self.refs.contains_key(instance.reference) {
                return Err(StateError::UnknownReference(instance.reference));
            }
        }
        self.specific
            .is_consistent()
            .and(self.generic.is_consistent())
            .map_err(StateError::UnknownAction)
    }

    fn sort_route_bound(&mut self) {
        let refs = &self.refs;
        self.route_bound = self
            .route_bound
            .iter()
            .copied()
            .sorted_by(|a, b| match (&refs[*a].location, &refs[*b].location) {
                (Some(a), Some(b)) => a.route_cmp(b),
                _ => std::cmp::Ordering::Equal,
            })
            .collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consist::PointMassConsist;
    use crate::horn::HornPattern;
    use crate::network::SignalAspect;
    use crate::params::TrainAttributes;
    use crate::track::{LineNetwork, LinePath};
    use assert_approx_eq::assert_approx_eq;

    fn context(
        train: TrainId,
        params: &ControllerParams,
        distance: f64,
        speed: f64,
        clock: f64,
    ) -> AuxContext<'_> {
        AuxContext {
            train,
            distance,
            speed,
            max_speed: 30.0,
            max_decel: 0.5,
            clock,
            elapsed: 0.5,
            stopped: speed <= params.stopped_tolerance,
            params,
        }
    }

    struct Fixture {
        net: LineNetwork,
        train: TrainId,
        params: ControllerParams,
        consist: PointMassConsist,
        aux: AuxActionsContainer,
    }

    impl Fixture {
        fn new(path: LinePath) -> Self {
            let mut trains = SlotMap::<TrainId, ()>::with_key();
            let train = trains.insert(());
            let mut net = LineNetwork::new(100.0);
            net.add_train(train, path, 200.0);
            Self {
                net,
                train,
                params: ControllerParams::default(),
                consist: PointMassConsist::new(&TrainAttributes::default()),
                aux: AuxActionsContainer::new(),
            }
        }

        fn waiting_point(&mut self, x: f64, code: u32) -> AuxRefId {
            let location = self.net.location(self.train, 0, x).unwrap();
            let delay = WaitingDelay::decode(code).unwrap();
            self.aux.add(AuxActionRef::waiting_point(location, delay))
        }

        /// Moves the train and runs the specific actions.
        fn tick(&mut self, distance: f64, speed: f64, clock: f64) -> SmallVec<[AuxEvent; 4]> {
            self.net.move_train(self.train, distance, speed);
            let ctx = context(self.train, &self.params, distance, speed, clock);
            self.aux.arm(&ctx, &self.net);
            self.aux.tick_specific(&ctx, &mut self.net, &mut self.consist)
        }
    }

    #[test]
    fn arming_does_not_duplicate() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let wp = f.waiting_point(1000.0, 30);
        let ctx = context(f.train, &f.params, 0.0, 10.0, 0.0);
        assert_eq!(f.aux.arm(&ctx, &f.net), 1);
        assert_eq!(f.aux.arm(&ctx, &f.net), 0);
        assert_eq!(f.aux.live_count(), 1);
        assert_approx_eq!(f.aux.get(wp).unwrap().required_distance().unwrap(), 1000.0);
    }

    #[test]
    fn arming_stops_at_waiting_point() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let second = f.waiting_point(2000.0, 30);
        let first = f.waiting_point(1000.0, 30);
        let order = f.aux.iter_route_bound().map(|(id, _)| id).collect::<Vec<_>>();
        assert_eq!(order, vec![first, second]);
        let ctx = context(f.train, &f.params, 0.0, 10.0, 0.0);
        assert_eq!(f.aux.arm(&ctx, &f.net), 1);
        assert!(f.aux.get(first).unwrap().is_live());
    }

    #[test]
    fn waiting_point_holds_and_releases() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let wp = f.waiting_point(1000.0, 30);

        let events = f.tick(995.0, 1.0, 100.0);
        assert!(matches!(
            events.as_slice(),
            [AuxEvent::Candidate(item)] if item.is_stop() && item.activation_distance == 1000.0
        ));
        let events = f.tick(999.0, 0.0, 110.0);
        assert_eq!(events.as_slice(), &[AuxEvent::InitAction(wp)]);
        assert!(f.tick(999.0, 0.0, 139.0).is_empty());
        let events = f.tick(999.0, 0.0, 140.0);
        assert_eq!(events.as_slice(), &[AuxEvent::Release(wp)]);

        // Completed and retired: re-arming produces nothing for the same pass
        assert_eq!(f.aux.live_count(), 0);
        let ctx = context(f.train, &f.params, 999.0, 0.0, 141.0);
        assert_eq!(f.aux.arm(&ctx, &f.net), 0);
        assert!(!f.aux.get(wp).unwrap().is_live());
    }

    #[test]
    fn absolute_delegate_waits_for_departure() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let signal = f.net.add_signal(1100.0, SignalAspect::Stop);
        let wp = f.waiting_point(1000.0, 30130);
        let location = f.net.location(f.train, 0, 1100.0).unwrap();
        let delegate = f.aux.add(AuxActionRef::signal_delegate(location, signal));
        assert!(f.aux.pair(wp, delegate));

        f.tick(995.0, 1.0, 3590.0);
        assert!(f.net.is_signal_locked(signal, f.train));
        f.tick(999.0, 0.0, 3600.0);
        assert_eq!(
            f.aux.live_state(delegate),
            Some(AuxState::Locking {
                release_after: Some(5400.0)
            })
        );
        assert_eq!(
            f.aux.live_state(wp),
            Some(AuxState::Holding {
                depart: Some(5400.0)
            })
        );

        assert!(f.tick(999.0, 0.0, 4000.0).is_empty());
        assert!(f.net.is_signal_locked(signal, f.train));

        let events = f.tick(999.0, 0.0, 5400.0);
        assert_eq!(events.as_slice(), &[AuxEvent::Release(wp)]);
        assert!(!f.net.is_signal_locked(signal, f.train));
        assert_eq!(f.net.signal_aspect(signal), Some(SignalAspect::Clear));
        assert_eq!(f.aux.get(wp).unwrap().partner(), None);
        assert_eq!(f.aux.live_count(), 0);
    }

    #[test]
    fn permission_waiting_point() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let wp = f.waiting_point(1000.0, 60002);
        f.tick(995.0, 1.0, 0.0);
        f.tick(999.0, 0.0, 1.0);
        assert!(f.tick(999.0, 0.0, 2.0).is_empty());
        f.net.grant_permission(f.train);
        assert_eq!(f.tick(999.0, 0.0, 3.0).as_slice(), &[AuxEvent::Release(wp)]);
    }

    #[test]
    fn uncouple_detaches_cars() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let wp = f.waiting_point(1000.0, 40004);
        f.tick(995.0, 1.0, 0.0);
        let events = f.tick(999.0, 0.0, 1.0);
        assert!(events.contains(&AuxEvent::Decoupled(wp)));
        assert_eq!(f.consist.car_count(), 4);
    }

    #[test]
    fn horn_sounds_once_per_crossing() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        f.net.add_crossing(500.0);
        f.aux.add(AuxActionRef::horn(HornPattern::SingleBlast, Some(2)));
        let mut rng = rand::thread_rng();

        let mut started = 0;
        let mut distance = 0.0;
        while distance < 600.0 {
            f.net.move_train(f.train, distance, 20.0);
            let ctx = context(f.train, &f.params, distance, 20.0, 0.0);
            let events = f.aux.tick_generic(&ctx, &f.net, &mut f.consist, &mut rng);
            started += events.len();
            // Not started before the 6 s window
            if !events.is_empty() {
                assert!(500.0 - distance <= 120.0);
            }
            distance += 10.0;
        }
        assert_eq!(started, 1);
        assert!(!f.consist.horn());
    }

    #[test]
    fn waiting_point_relocated_on_reversal() {
        let mut f = Fixture::new(LinePath::new(0.0, 1000.0).then_reverse_to(0.0));
        let wp = f.waiting_point(850.0, 30);
        f.net.move_train(f.train, 1000.0, 0.0);
        assert!(f.net.advance_subroute(f.train));

        let ctx = context(f.train, &f.params, 1000.0, 0.0, 0.0);
        f.aux.relocate_on_reversal(&ctx, &mut f.net);
        let location = f.aux.get(wp).unwrap().location().copied().unwrap();
        assert_eq!(location.subroute, 1);
        assert_eq!(location.section, 8);
        assert_eq!(f.aux.arm(&ctx, &f.net), 1);
    }

    #[test]
    fn validate_detects_dangling_pair() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let signal = f.net.add_signal(1100.0, SignalAspect::Stop);
        let wp = f.waiting_point(1000.0, 30);
        let location = f.net.location(f.train, 0, 1100.0).unwrap();
        let delegate = f.aux.add(AuxActionRef::signal_delegate(location, signal));
        assert!(f.aux.pair(wp, delegate));
        assert!(f.aux.validate().is_ok());

        f.aux.refs[delegate].set_partner(None);
        assert!(matches!(f.aux.validate(), Err(StateError::DanglingPair(id)) if id == wp));
    }

    #[test]
    fn pairing_survives_reversal() {
        let mut f = Fixture::new(LinePath::new(0.0, 1000.0).then_reverse_to(0.0));
        let signal = f.net.add_signal(900.0, SignalAspect::Stop);
        let wp = f.waiting_point(850.0, 30);
        let location = f.net.location(f.train, 0, 900.0).unwrap();
        let delegate = f.aux.add(AuxActionRef::signal_delegate(location, signal));
        assert!(f.aux.pair(wp, delegate));
        f.net.move_train(f.train, 700.0, 10.0);
        let ctx = context(f.train, &f.params, 700.0, 10.0, 0.0);
        assert_eq!(f.aux.arm(&ctx, &f.net), 2);

        f.net.move_train(f.train, 1000.0, 0.0);
        assert!(f.net.advance_subroute(f.train));
        let ctx = context(f.train, &f.params, 1000.0, 0.0, 0.0);
        f.aux.relocate_on_reversal(&ctx, &mut f.net);
        f.aux.tick_specific(&ctx, &mut f.net, &mut f.consist);

        assert_eq!(f.aux.get(wp).unwrap().partner(), Some(delegate));
        assert_eq!(f.aux.get(delegate).unwrap().partner(), Some(wp));
        assert!(f.aux.get(wp).unwrap().is_live());
        assert!(f.aux.get(delegate).unwrap().is_live());
        assert!(f.aux.validate().is_ok());
    }

    /// Round trips the container through JSON, as a saved train does.
    fn reload(aux: &AuxActionsContainer) -> AuxActionsContainer {
        serde_json::from_str(&serde_json::to_string(aux).unwrap()).unwrap()
    }

    #[test]
    fn held_delay_resumes_after_restore() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let wp = f.waiting_point(1000.0, 30);
        f.tick(995.0, 1.0, 100.0);
        f.tick(999.0, 0.0, 110.0);
        assert_eq!(
            f.aux.live_state(wp),
            Some(AuxState::Holding { depart: Some(140.0) })
        );

        let mut aux = reload(&f.aux);
        aux.restore_clock(110.0, 500.0, &f.params);
        assert_eq!(aux.live_state(wp), Some(AuxState::Holding { depart: Some(530.0) }));
    }

    #[test]
    fn absolute_departure_recomputed_after_restore() {
        let mut f = Fixture::new(LinePath::new(0.0, 5000.0));
        let signal = f.net.add_signal(1100.0, SignalAspect::Stop);
        let wp = f.waiting_point(1000.0, 30130);
        let location = f.net.location(f.train, 0, 1100.0).unwrap();
        let delegate = f.aux.add(AuxActionRef::signal_delegate(location, signal));
        assert!(f.aux.pair(wp, delegate));
        f.tick(995.0, 1.0, 3590.0);
        f.tick(999.0, 0.0, 3600.0);

        // Restored earlier in the day, the departure stays at 01:30
        let mut aux = reload(&f.aux);
        aux.restore_clock(3600.0, 1800.0, &f.params);
        assert_eq!(aux.live_state(wp), Some(AuxState::Holding { depart: Some(5400.0) }));
        assert_eq!(
            aux.live_state(delegate),
            Some(AuxState::Locking {
                release_after: Some(5400.0)
            })
        );

        // Restored after it, the train departs at once
        let mut aux = reload(&f.aux);
        aux.restore_clock(3600.0, 6000.0, &f.params);
        assert_eq!(aux.live_state(wp), Some(AuxState::Holding { depart: Some(6000.0) }));
        assert_eq!(
            aux.live_state(delegate),
            Some(AuxState::Locking {
                release_after: Some(6000.0)
            })
        );
    }
}
