use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time::{interval, Duration, MissedTickBehavior};

use tdoa_nav_rs::config::NavConfig;
use tdoa_nav_rs::control::{BicycleModel, HeadingTracker, TrajectoryController, WaypointPath};
use tdoa_nav_rs::filters::{TdoaEkf, TdoaEkfState};
use tdoa_nav_rs::live_status::{current_timestamp, LiveStatus};
use tdoa_nav_rs::measurement::{PairScheme, TdoaSimulator};
use tdoa_nav_rs::shared::SharedEstimate;
use tdoa_nav_rs::types::{ControlCommand, Position3, TdoaObservation, VehicleState};

/// Speed used until the heading tracker has seen enough motion [m/s]
const CREEP_SPEED: f64 = 0.5;
const PLANT_PERIOD_MS: u64 = 10;
const STATUS_PERIOD_SECS: u64 = 2;

#[derive(Parser, Debug)]
#[command(name = "tdoa_nav")]
#[command(about = "Closed-loop TDOA localization + MPC path tracking simulation", long_about = None)]
struct Args {
    /// Duration in seconds
    #[arg(value_name = "SECONDS", default_value = "30")]
    duration: u64,

    /// Configuration file (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "tdoa_nav_sessions")]
    output_dir: String,

    /// Simulated range-difference noise [m]
    #[arg(long, default_value = "0.05")]
    sim_noise: f64,

    /// Observation cycles per second
    #[arg(long, default_value = "60.0")]
    sensor_hz: f64,

    /// Circle path center and radius [m]
    #[arg(long, default_value = "2.3")]
    center_x: f64,
    #[arg(long, default_value = "2.4")]
    center_y: f64,
    #[arg(long, default_value = "1.0")]
    radius: f64,

    /// Tag height above the floor [m]
    #[arg(long, default_value = "0.0")]
    tag_height: f64,

    #[arg(long, default_value = "0")]
    seed: u64,
}

/// Simulated ground truth shared by the plant, sensor and control tasks
struct World {
    pose: VehicleState,
    command: ControlCommand,
    sim_time: f64,
}

#[derive(Default)]
struct EstimatorReport {
    observations: u64,
    state: Option<TdoaEkfState>,
}

#[derive(Default)]
struct ControlReport {
    solves: u64,
    failures: u64,
    last_solve_ms: f64,
    heading: Option<f64>,
}

#[derive(Serialize)]
struct SessionOutput {
    config: NavConfig,
    status: LiveStatus,
    truth: VehicleState,
}

async fn plant_loop(world: Arc<Mutex<World>>, model: BicycleModel) {
    let period = Duration::from_millis(PLANT_PERIOD_MS);
    let dt = period.as_secs_f64();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Ok(mut w) = world.lock() else {
            log::error!("[plant] world lock poisoned");
            return;
        };
        w.pose = model.step(&w.pose, &w.command, dt);
        w.sim_time += dt;
    }
}

async fn sensor_loop(
    world: Arc<Mutex<World>>,
    mut sim: TdoaSimulator,
    tx: mpsc::Sender<TdoaObservation>,
    period: Duration,
    tag_height: f64,
) {
    let mut ticker = interval(period);
    let mut sample_count = 0u64;

    loop {
        ticker.tick().await;
        let (pose, t) = match world.lock() {
            Ok(w) => (w.pose, w.sim_time),
            Err(_) => return,
        };
        let truth = Position3::new(pose.x, pose.y, tag_height);

        for obs in sim.observe(&truth, t) {
            match tx.try_send(obs) {
                Ok(_) => {
                    sample_count += 1;
                    if sample_count % 6000 == 0 {
                        log::debug!("[sensor] {} observations", sample_count);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    log::info!("[sensor] Channel closed after {} observations", sample_count);
                    return;
                }
                Err(TrySendError::Full(_)) => {
                    // Estimator is behind, drop this observation
                }
            }
        }
    }
}

async fn estimator_loop(
    mut ekf: TdoaEkf,
    mut rx: mpsc::Receiver<TdoaObservation>,
    shared: SharedEstimate,
    report: Arc<Mutex<EstimatorReport>>,
) {
    let mut ticker = interval(Duration::from_secs_f64(ekf.config().timestep));
    let mut observations = 0u64;

    loop {
        ticker.tick().await;
        ekf.predict();

        loop {
            match rx.try_recv() {
                Ok(obs) => {
                    observations += 1;
                    if let Err(e) = ekf.scalar_range_difference_update(
                        obs.reference,
                        obs.other,
                        obs.range_difference,
                    ) {
                        if e.is_recoverable() {
                            log::debug!("[estimator] {e}");
                        } else {
                            log::warn!("[estimator] {e}");
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::info!("[estimator] Observation channel closed");
                    return;
                }
            }
        }

        shared.publish(ekf.snapshot(current_timestamp()));
        if let Ok(mut r) = report.lock() {
            r.observations = observations;
            r.state = Some(ekf.get_state());
        }
    }
}

async fn control_loop(
    shared: SharedEstimate,
    controller: Arc<TrajectoryController>,
    path: Arc<WaypointPath>,
    world: Arc<Mutex<World>>,
    report: Arc<Mutex<ControlReport>>,
) {
    let mut ticker = interval(Duration::from_secs_f64(controller.config().timestep));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tracker = HeadingTracker::new(0.05);

    loop {
        ticker.tick().await;
        // Stale-but-available: whatever the estimator published last
        let Some(snapshot) = shared.latest() else {
            continue;
        };
        let position = snapshot.position();
        let heading = tracker.update(position.x, position.y);

        let command = match heading {
            None => ControlCommand {
                steering: 0.0,
                speed: CREEP_SPEED,
            },
            Some(heading) => {
                let pose = VehicleState {
                    x: position.x,
                    y: position.y,
                    heading,
                };
                match path.reference_for(&pose) {
                    Ok((poly, local)) => {
                        let solver = controller.clone();
                        let started = Instant::now();
                        let result =
                            tokio::task::spawn_blocking(move || solver.solve(&local, &poly)).await;
                        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

                        let mut r = match report.lock() {
                            Ok(r) => r,
                            Err(_) => return,
                        };
                        r.last_solve_ms = elapsed_ms;
                        r.heading = Some(heading);
                        match result {
                            Ok(Ok(solution)) => {
                                r.solves += 1;
                                solution.command
                            }
                            Ok(Err(e)) => {
                                r.failures += 1;
                                log::warn!("[control] {e}, stopping");
                                ControlCommand::default()
                            }
                            Err(e) => {
                                r.failures += 1;
                                log::error!("[control] solve task failed: {e}");
                                ControlCommand::default()
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[control] no reference path: {e}");
                        ControlCommand::default()
                    }
                }
            }
        };

        match world.lock() {
            Ok(mut w) => w.command = command,
            Err(_) => return,
        }
    }
}

fn build_status(
    start: Instant,
    estimator: &Arc<Mutex<EstimatorReport>>,
    control: &Arc<Mutex<ControlReport>>,
    world: &Arc<Mutex<World>>,
    tag_height: f64,
) -> (LiveStatus, VehicleState) {
    let mut status = LiveStatus::new();
    status.uptime_seconds = start.elapsed().as_secs_f64();

    let (truth, command) = match world.lock() {
        Ok(w) => (w.pose, w.command),
        Err(_) => (VehicleState::default(), ControlCommand::default()),
    };
    status.last_command = command;

    if let Ok(r) = estimator.lock() {
        status.observations = r.observations;
        if let Some(state) = r.state.as_ref() {
            let (x, y, z) = state.position;
            status.position = [x, y, z];
            status.position_std = state.position_std;
            status.tdoa_updates = state.tdoa_updates;
            status.rejected_updates = state.rejected_updates;
            status.predictions = state.predictions;
            let err = Position3::new(x, y, z) - Position3::new(truth.x, truth.y, tag_height);
            status.position_error = Some(err.norm());
        }
    }
    if let Ok(r) = control.lock() {
        status.control_solves = r.solves;
        status.control_failures = r.failures;
        status.last_solve_ms = r.last_solve_ms;
        status.heading_deg = r.heading.map(f64::to_degrees);
    }
    (status, truth)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match args.config.as_ref() {
        Some(path) => NavConfig::load(path)?,
        None => NavConfig::default(),
    };
    config.validate()?;

    println!("[{}] TDOA Nav Starting", ts_now());
    println!("  Duration: {} seconds", args.duration);
    println!("  Anchors: {}", config.anchors.len());
    println!("  Path: circle r={:.2} m around ({:.2}, {:.2})", args.radius, args.center_x, args.center_y);
    println!("  Output Dir: {}", args.output_dir);
    if cfg!(debug_assertions) {
        log::warn!(
            "debug build: MPC solves will likely exceed the {:.0} ms budget, run with --release",
            config.solver.max_solve_time * 1000.0
        );
    }

    std::fs::create_dir_all(&args.output_dir)?;

    let ekf = TdoaEkf::new(config.estimator.clone(), &config.anchors)?;
    let sim = TdoaSimulator::new(ekf.anchors().clone(), PairScheme::AllPairs, args.sim_noise, args.seed)?;
    let controller = Arc::new(TrajectoryController::with_solver_config(
        config.controller.clone(),
        config.solver.clone(),
    )?);
    let model = BicycleModel::new(config.controller.rear_axle_length)?;
    let path = Arc::new(WaypointPath::circle((args.center_x, args.center_y), args.radius, 24)?);

    if !(args.sensor_hz.is_finite() && args.sensor_hz > 0.0) {
        anyhow::bail!("sensor rate must be positive, got {}", args.sensor_hz);
    }

    let world = Arc::new(Mutex::new(World {
        pose: VehicleState {
            x: args.center_x + args.radius,
            y: args.center_y,
            heading: std::f64::consts::FRAC_PI_2,
        },
        command: ControlCommand::default(),
        sim_time: 0.0,
    }));
    let shared = SharedEstimate::new();
    let estimator_report = Arc::new(Mutex::new(EstimatorReport::default()));
    let control_report = Arc::new(Mutex::new(ControlReport::default()));
    let (obs_tx, obs_rx) = mpsc::channel::<TdoaObservation>(500);

    // Hold handles to keep tasks alive
    let handles = vec![
        tokio::spawn(plant_loop(world.clone(), model)),
        tokio::spawn(sensor_loop(
            world.clone(),
            sim,
            obs_tx,
            Duration::from_secs_f64(1.0 / args.sensor_hz),
            args.tag_height,
        )),
        tokio::spawn(estimator_loop(
            ekf,
            obs_rx,
            shared.clone(),
            estimator_report.clone(),
        )),
        tokio::spawn(control_loop(
            shared.clone(),
            controller.clone(),
            path.clone(),
            world.clone(),
            control_report.clone(),
        )),
    ];

    let start = Instant::now();
    let mut status_ticker = interval(Duration::from_secs(STATUS_PERIOD_SECS));
    let status_path = format!("{}/live_status.json", args.output_dir);

    loop {
        status_ticker.tick().await;
        let (status, truth) = build_status(
            start,
            &estimator_report,
            &control_report,
            &world,
            args.tag_height,
        );
        println!(
            "[{}] est ({:.2}, {:.2}, {:.2}) err {} | truth ({:.2}, {:.2}) | cmd steer {:.3} speed {:.2} | solves {} fails {}",
            ts_now(),
            status.position[0],
            status.position[1],
            status.position[2],
            status
                .position_error
                .map(|e| format!("{e:.3} m"))
                .unwrap_or_else(|| "n/a".into()),
            truth.x,
            truth.y,
            status.last_command.steering,
            status.last_command.speed,
            status.control_solves,
            status.control_failures,
        );
        if let Err(e) = status.save(&status_path) {
            log::warn!("failed to write {status_path}: {e}");
        }

        if start.elapsed().as_secs() >= args.duration {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }
    }

    for handle in &handles {
        handle.abort();
    }

    let (status, truth) = build_status(
        start,
        &estimator_report,
        &control_report,
        &world,
        args.tag_height,
    );
    let output = SessionOutput {
        config,
        status,
        truth,
    };
    let filename = format!("{}/session_{}.json", args.output_dir, ts_now_clean());
    std::fs::write(&filename, serde_json::to_string_pretty(&output)?)?;
    println!("[{}] Final save to {}", ts_now(), filename);

    println!("\n=== Final Stats ===");
    println!("Observations: {}", output.status.observations);
    println!("Rejected updates: {}", output.status.rejected_updates);
    if let Some(err) = output.status.position_error {
        println!("Position error: {:.3} m", err);
    }
    println!(
        "Control solves: {} ({} failed, last {:.1} ms)",
        output.status.control_solves, output.status.control_failures, output.status.last_solve_ms
    );

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
