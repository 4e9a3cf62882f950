use rail_ai::{
    ConsistControl, ControllerParams, LineNetwork, LinePath, SignalAspect, Simulation, StationId,
    StationStop, TrainAttributes,
};
use serde::Deserialize;
use slotmap::SlotMap;
use std::error::Error;

/// The scenario run when no file is given.
const DEFAULT_SCENARIO: &str = r#"{
    "section_length": 100.0,
    "line_speed": 25.0,
    "signals": [{ "pos": 2600.0, "aspect": "Stop", "clear_at": 420.0 }],
    "restrictions": [{ "from": 1200.0, "to": 1500.0, "speed": 12.0 }],
    "trains": [{
        "path": [0.0, 4000.0],
        "speed": 15.0,
        "stations": [{ "pos": 800.0, "departure": 28860.0 }]
    }],
    "start": 28800.0,
    "duration": 900.0,
    "dt": 0.1
}"#;

#[derive(Deserialize)]
struct Scenario {
    section_length: f64,
    line_speed: f64,
    #[serde(default)]
    params: ControllerParams,
    #[serde(default)]
    signals: Vec<SignalConfig>,
    #[serde(default)]
    restrictions: Vec<RestrictionConfig>,
    trains: Vec<TrainConfig>,
    /// The clock at the start in s since midnight.
    start: f64,
    duration: f64,
    dt: f64,
}

#[derive(Deserialize)]
struct SignalConfig {
    pos: f64,
    aspect: SignalAspect,
    /// The time after the start at which the signal clears.
    clear_at: Option<f64>,
}

#[derive(Deserialize)]
struct RestrictionConfig {
    from: f64,
    to: f64,
    speed: f64,
}

#[derive(Deserialize)]
struct TrainConfig {
    #[serde(default)]
    attributes: TrainAttributes,
    /// The start of the path, followed by each reversal point and the end.
    path: Vec<f64>,
    speed: f64,
    #[serde(default)]
    stations: Vec<StationConfig>,
}

#[derive(Deserialize)]
struct StationConfig {
    pos: f64,
    departure: f64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scenario: Scenario = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_json::from_str(DEFAULT_SCENARIO)?,
    };
    scenario.params.validate()?;

    let mut net = LineNetwork::new(scenario.section_length);
    net.set_line_speed(scenario.line_speed);
    let mut clearances = vec![];
    for signal in &scenario.signals {
        let id = net.add_signal(signal.pos, signal.aspect);
        if let Some(time) = signal.clear_at {
            clearances.push((time, id));
        }
    }
    for restriction in &scenario.restrictions {
        net.add_speed_restriction(restriction.from, restriction.to, restriction.speed);
    }

    let mut sim = Simulation::new(net, scenario.params, scenario.start);
    let mut stations = SlotMap::<StationId, ()>::with_key();
    for config in &scenario.trains {
        let (start, rest) = match config.path.split_first() {
            Some((start, rest)) if !rest.is_empty() => (*start, rest),
            _ => return Err("a path needs a start and an end".into()),
        };
        let mut path = LinePath::new(start, rest[0]);
        for end in &rest[1..] {
            path = path.then_reverse_to(*end);
        }
        let id = sim.add_train(config.attributes, path, config.speed);
        for station in &config.stations {
            let location = sim
                .network()
                .location(id, 0, station.pos)
                .ok_or("station is not on the first subroute")?;
            let stop = StationStop {
                station: stations.insert(()),
                location,
                departure: station.departure,
                exit_signal: None,
            };
            if let Some(train) = sim.get_train_mut(id) {
                train.add_station_stop(stop);
            }
        }
    }

    let frames = (scenario.duration / scenario.dt).ceil() as usize;
    for frame in 0..frames {
        let elapsed = frame as f64 * scenario.dt;
        for (time, signal) in &clearances {
            if elapsed >= *time {
                sim.network_mut().set_signal_aspect(*signal, SignalAspect::Clear);
            }
        }
        sim.step(scenario.dt);
        if frame % (10.0 / scenario.dt).round().max(1.0) as usize == 0 {
            for train in sim.iter_trains() {
                if let Some(consist) = sim.get_consist(train.id()) {
                    println!(
                        "{:>7.1} s  {:?}  {:>7.1} m  {:>5.1} m/s  {:?}",
                        elapsed,
                        train.id(),
                        consist.distance_travelled(),
                        consist.speed(),
                        train.effective_state()
                    );
                }
            }
        }
        if sim.iter_trains().next().is_none() {
            break;
        }
    }

    for (id, reason) in sim.removed() {
        println!("{:?} removed: {:?}", id, reason);
    }
    Ok(())
}
