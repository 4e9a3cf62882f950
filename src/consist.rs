use crate::network::ConsistControl;
use crate::params::TrainAttributes;

/// The length of a single car in m.
const CAR_LENGTH: f64 = 20.0; // m

/// A simple point mass model of a train, used to drive the controller
/// without a full vehicle physics model.
///
/// The throttle accelerates the train at up to its maximum acceleration,
/// and the brake decelerates it at up to its maximum deceleration.
#[derive(Clone, Debug)]
pub struct PointMassConsist {
    /// The maximum acceleration in m/s<sup>2</sup>.
    max_accel: f64,
    /// The maximum braking deceleration in m/s<sup>2</sup>.
    max_decel: f64,
    /// The velocity in m/s.
    vel: f64,
    /// The distance travelled in m.
    odometer: f64,
    /// The throttle setting in %.
    throttle: f64,
    /// The brake setting in %.
    brake: f64,
    /// A speed which overrides the physics model for the next frame.
    fixed_speed: Option<f64>,
    doors_open: bool,
    horn: bool,
    bell: bool,
    horn_rings_bell: bool,
    /// Whether the locomotive has power.
    power: bool,
    /// The number of cars in the train.
    cars: usize,
}

impl PointMassConsist {
    /// Creates a stationary consist.
    pub fn new(attributes: &TrainAttributes) -> Self {
        Self {
            max_accel: attributes.max_accel,
            max_decel: attributes.max_decel,
            vel: 0.0,
            odometer: 0.0,
            throttle: 0.0,
            brake: 0.0,
            fixed_speed: None,
            doors_open: false,
            horn: false,
            bell: false,
            horn_rings_bell: false,
            power: true,
            cars: usize::max((attributes.length / CAR_LENGTH).round() as usize, 1),
        }
    }

    /// Sets the initial speed of the consist.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.vel = speed;
        self
    }

    /// Sets the initial distance travelled.
    pub fn with_odometer(mut self, distance: f64) -> Self {
        self.odometer = distance;
        self
    }

    /// Makes the horn ring the bell.
    pub fn with_horn_bell(mut self) -> Self {
        self.horn_rings_bell = true;
        self
    }

    /// Turns the locomotive's power on or off.
    pub fn set_power(&mut self, power: bool) {
        self.power = power;
    }

    /// Whether the horn is sounding.
    pub fn horn(&self) -> bool {
        self.horn
    }

    /// Whether the bell is ringing.
    pub fn bell(&self) -> bool {
        self.bell
    }

    /// Whether the doors are open.
    pub fn doors_open(&self) -> bool {
        self.doors_open
    }

    /// The current acceleration in m/s<sup>2</sup>.
    pub fn acc(&self) -> f64 {
        let acc = if self.power {
            0.01 * self.throttle * self.max_accel
        } else {
            0.0
        };
        acc - 0.01 * self.brake * self.max_decel
    }

    /// Integrates the consist's velocity and position.
    ///
    /// # Parameters
    /// * `dt` - The time step in seconds
    pub fn integrate(&mut self, dt: f64) {
        let vel = match self.fixed_speed.take() {
            Some(speed) => speed,
            None => f64::max(self.vel + dt * self.acc(), 0.0),
        };
        self.odometer += 0.5 * (self.vel + vel) * dt;
        self.vel = vel;
    }
}

impl ConsistControl for PointMassConsist {
    fn speed(&self) -> f64 {
        self.vel
    }

    fn distance_travelled(&self) -> f64 {
        self.odometer
    }

    fn has_power(&self) -> bool {
        self.power
    }

    fn throttle_percent(&self) -> f64 {
        self.throttle
    }

    fn brake_percent(&self) -> f64 {
        self.brake
    }

    fn set_throttle_percent(&mut self, percent: f64) {
        self.throttle = percent.clamp(0.0, 100.0);
    }

    fn set_brake_percent(&mut self, percent: f64) {
        self.brake = percent.clamp(0.0, 100.0);
    }

    fn set_fixed_speed(&mut self, speed: f64) {
        self.fixed_speed = Some(f64::max(speed, 0.0));
    }

    fn set_doors_open(&mut self, open: bool) {
        self.doors_open = open;
    }

    fn set_horn(&mut self, on: bool) {
        self.horn = on;
        if on && self.horn_rings_bell {
            self.bell = true;
        }
    }

    fn set_bell(&mut self, on: bool) {
        self.bell = on;
    }

    fn horn_rings_bell(&self) -> bool {
        self.horn_rings_bell
    }

    fn car_count(&self) -> usize {
        self.cars
    }

    fn detach_cars(&mut self, keep: usize, _from_front: bool) -> bool {
        if keep == 0 || keep >= self.cars {
            return false;
        }
        self.cars = keep;
        true
    }
}
