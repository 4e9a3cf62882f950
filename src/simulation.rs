use crate::consist::PointMassConsist;
use crate::error::StateError;
use crate::network::ConsistControl;
use crate::params::{ControllerParams, TrainAttributes};
use crate::save::TrainSnapshot;
use crate::track::{LineNetwork, LinePath};
use crate::train::{RemovalReason, TickContext, Train, UpdateOutcome};
use crate::TrainId;
use log::info;
use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

/// A rail traffic simulation of AI driven trains on a single line.
pub struct Simulation {
    /// The line the trains run on.
    net: LineNetwork,
    /// The controller parameters shared by all trains.
    params: ControllerParams,
    /// The trains being simulated.
    trains: SlotMap<TrainId, Train>,
    /// The vehicles of each train.
    consists: SecondaryMap<TrainId, PointMassConsist>,
    /// The simulation clock in s since midnight.
    clock: f64,
    /// The current frame of simulation.
    frame: usize,
    /// The trains removed so far, and why.
    removed: Vec<(TrainId, RemovalReason)>,
}

impl Simulation {
    /// Creates a new simulation starting at the given clock time.
    pub fn new(net: LineNetwork, params: ControllerParams, clock: f64) -> Self {
        Self {
            net,
            params,
            trains: SlotMap::with_key(),
            consists: SecondaryMap::new(),
            clock,
            frame: 0,
            removed: vec![],
        }
    }

    /// Adds a train at the start of its path, moving at `speed`.
    pub fn add_train(&mut self, attributes: TrainAttributes, path: LinePath, speed: f64) -> TrainId {
        let params = &self.params;
        let id = self
            .trains
            .insert_with_key(|id| Train::new(id, attributes, params));
        self.net.add_train(id, path, attributes.length);
        self.consists
            .insert(id, PointMassConsist::new(&attributes).with_speed(speed));
        id
    }

    /// Removes a train from the simulation, releasing any signals it holds.
    pub fn remove_train(&mut self, id: TrainId, reason: RemovalReason) {
        if let Some(mut train) = self.trains.remove(id) {
            info!("Removing train {:?}: {:?}", id, reason);
            train.reset_route(&mut self.net);
            self.removed.push((id, reason));
        }
        self.consists.remove(id);
        self.net.remove_train(id);
    }

    /// Advances the simulation by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.tick(TickContext::new(dt, self.clock));
    }

    /// Fast forwards the trains for `frames` frames of `dt` seconds,
    /// moving them at fixed speeds instead of through the physics model.
    pub fn pre_update(&mut self, dt: f64, frames: usize) {
        for _ in 0..frames {
            self.tick(TickContext::new(dt, self.clock).pre_update());
        }
    }

    fn tick(&mut self, tick: TickContext) {
        let mut removed = SmallVec::<[(TrainId, RemovalReason); 4]>::new();
        for (id, train) in &mut self.trains {
            let consist = match self.consists.get_mut(id) {
                Some(consist) => consist,
                None => continue,
            };
            if let UpdateOutcome::Remove(reason) =
                train.update(&tick, &self.params, &mut self.net, consist)
            {
                removed.push((id, reason));
            }
        }
        for (id, reason) in removed {
            self.remove_train(id, reason);
        }
        self.integrate(tick.elapsed);
        self.clock += tick.elapsed;
        self.frame += 1;
    }

    /// Integrates the consists, and moves the trains along the line.
    fn integrate(&mut self, dt: f64) {
        for (id, consist) in &mut self.consists {
            consist.integrate(dt);
            self.net
                .move_train(id, consist.distance_travelled(), consist.speed());
        }
    }

    /// Gets the current simulation frame index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// The simulation clock in s since midnight.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn params(&self) -> &ControllerParams {
        &self.params
    }

    pub fn network(&self) -> &LineNetwork {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut LineNetwork {
        &mut self.net
    }

    /// Returns an iterator over all the trains in the simulation.
    pub fn iter_trains(&self) -> impl Iterator<Item = &Train> {
        self.trains.values()
    }

    /// Gets a reference to the train with the given ID.
    pub fn get_train(&self, id: TrainId) -> Option<&Train> {
        self.trains.get(id)
    }

    pub fn get_train_mut(&mut self, id: TrainId) -> Option<&mut Train> {
        self.trains.get_mut(id)
    }

    /// Gets the vehicles of the train with the given ID.
    pub fn get_consist(&self, id: TrainId) -> Option<&PointMassConsist> {
        self.consists.get(id)
    }

    pub fn get_consist_mut(&mut self, id: TrainId) -> Option<&mut PointMassConsist> {
        self.consists.get_mut(id)
    }

    /// The trains removed so far, and why.
    pub fn removed(&self) -> &[(TrainId, RemovalReason)] {
        &self.removed
    }

    /// Takes a snapshot of a train's controller.
    pub fn snapshot(&self, id: TrainId) -> Option<TrainSnapshot> {
        self.trains.get(id).map(|train| train.snapshot(self.clock))
    }

    /// Restores a train's controller from a snapshot.
    /// The train must still be part of the simulation.
    pub fn restore(&mut self, snapshot: TrainSnapshot) -> Result<(), StateError> {
        let id = snapshot.id();
        let attribs = match self.trains.get(id) {
            Some(train) => *train.attributes(),
            None => return Err(StateError::UnknownTrain(id)),
        };
        let train = Train::restore(snapshot, attribs, &self.params, self.clock)?;
        self.trains[id] = train;
        Ok(())
    }
}
