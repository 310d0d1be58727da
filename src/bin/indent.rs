//! Run one indentation test against the simulated indenter and print the Oliver-Pharr results.
//!
//! By default the test runs in real time on the tokio runtime, with the sampler and control loop
//! as separate periodic tasks.  `--fast` runs the same test synchronously on a virtual clock.

use std::path::PathBuf;

use clap::{ArgEnum, Parser};
use env_logger::Env;
use futures::StreamExt;
use futures_signals::signal::SignalExt;

use nanoindent::calibration::CalibrationData;
use nanoindent::controller_config::ControllerConfig;
use nanoindent::indenter_hal_sim::{SimulatedIndenter, SimulatedIndenterConfig, SimulatedMaterial};
use nanoindent::test_parameters::{ControlMode, TestParameters};
use nanoindent::test_runner::RunningTest;
use nanoindent::test_sequencer::Termination;
use nanoindent::test_session::{save_samples, IndentationSession, TestOutcome};

#[derive(ArgEnum, Clone, Copy, Debug)]
enum Material {
    Linear,
    ElasticPlastic,
}

#[derive(Parser, Debug)]
#[clap(name = "indent")]
struct Opts {
    /// TestParameters JSON; defaults are used for anything missing.
    #[clap(long)]
    params: Option<PathBuf>,

    #[clap(long)]
    calibration: Option<PathBuf>,

    /// ControllerConfig JSON.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Peak force in µN.
    #[clap(long)]
    max_load: Option<f64>,

    /// Peak depth in nm.
    #[clap(long)]
    max_displacement: Option<f64>,

    #[clap(long)]
    loading_rate: Option<f64>,

    #[clap(long)]
    unloading_rate: Option<f64>,

    /// Hold time in seconds.
    #[clap(long)]
    hold: Option<f64>,

    #[clap(long)]
    mode: Option<ControlMode>,

    #[clap(long, arg_enum, default_value = "elastic-plastic")]
    material: Material,

    /// Spring stiffness for `--material linear`, µN/nm.
    #[clap(long, default_value = "0.05")]
    stiffness: f64,

    /// Sample hardness in GPa.
    #[clap(long, default_value = "9.0")]
    hardness: f64,

    /// Sample Young's modulus in GPa.
    #[clap(long, default_value = "72.0")]
    modulus: f64,

    /// Distance from the stage home position to the sample surface, nm.
    #[clap(long, default_value = "200.0")]
    surface: f64,

    /// Stage speed at full drive, nm/s.
    #[clap(long, default_value = "500.0")]
    stage_speed: f64,

    /// Uniform force noise amplitude in µN.
    #[clap(long, default_value = "0.0")]
    noise: f64,

    /// Uniform displacement noise amplitude in nm.
    #[clap(long, default_value = "0.0")]
    displacement_noise: f64,

    #[clap(long, default_value = "0")]
    seed: u64,

    /// Run on a virtual clock instead of in real time.
    #[clap(long)]
    fast: bool,

    #[clap(long)]
    result_out: Option<PathBuf>,

    #[clap(long)]
    samples_out: Option<PathBuf>,
}

impl Opts {
    fn test_parameters(&self) -> anyhow::Result<TestParameters> {
        let mut params = match &self.params {
            Some(path) => TestParameters::load(path)?,
            None => TestParameters::default(),
        };
        if let Some(max_load) = self.max_load {
            params.max_load = max_load;
        }
        if let Some(max_displacement) = self.max_displacement {
            params.max_displacement = max_displacement;
        }
        if let Some(loading_rate) = self.loading_rate {
            params.loading_rate = loading_rate;
        }
        if let Some(unloading_rate) = self.unloading_rate {
            params.unloading_rate = unloading_rate;
        }
        if let Some(hold) = self.hold {
            params.hold_duration_secs = hold;
        }
        if let Some(mode) = self.mode {
            params.control_mode = mode;
        }
        params.validate()?;
        Ok(params)
    }

    fn simulator(&self, params: &TestParameters, config: &ControllerConfig, calibration: &CalibrationData) -> SimulatedIndenter {
        let material = match self.material {
            Material::Linear => SimulatedMaterial::LinearElastic { stiffness: self.stiffness },
            Material::ElasticPlastic => {
                let reduced_modulus =
                    SimulatedMaterial::reduced_modulus_for(self.modulus, params.sample_poisson_ratio, &params.indenter);
                SimulatedMaterial::elastic_plastic(self.hardness, reduced_modulus, &params.indenter)
            }
        };
        let mut sim_config = SimulatedIndenterConfig::new(material, config);
        sim_config.surface_position = self.surface;
        sim_config.max_speed = self.stage_speed;
        sim_config.force_noise = self.noise;
        sim_config.displacement_noise = self.displacement_noise;
        sim_config.seed = self.seed;
        sim_config.force_calibration = calibration.force;
        sim_config.displacement_calibration = calibration.displacement;
        SimulatedIndenter::new(sim_config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();

    let params = opts.test_parameters()?;
    let calibration = match &opts.calibration {
        Some(path) => CalibrationData::load(path)?,
        None => CalibrationData::default(),
    };
    let config = match &opts.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    let sim = opts.simulator(&params, &config, &calibration);

    let outcome = if opts.fast {
        let session = IndentationSession::new(sim.hal(), params, &calibration, &config)?;
        let (outcome, _hal) = session.run();
        for change in &outcome.trace {
            println!("{:>10.3} s  {:?}", change.elapsed.as_secs_f64(), change.phase);
        }
        outcome
    } else {
        run_realtime(&sim, params, &calibration, &config).await?
    };

    print_outcome(&outcome);
    if let Some(path) = &opts.result_out {
        outcome.report().save(path)?;
    }
    if let Some(path) = &opts.samples_out {
        save_samples(&outcome.samples, path)?;
    }
    Ok(())
}

async fn run_realtime(
    sim: &SimulatedIndenter,
    params: TestParameters,
    calibration: &CalibrationData,
    config: &ControllerConfig,
) -> anyhow::Result<TestOutcome> {
    let test = RunningTest::start(sim.hal(), params, calibration, config)?;
    let mut phases = test.status.signal_ref(|state| (state.phase, state.elapsed)).to_stream();
    let watch_phases = async move {
        let mut last = None;
        while let Some((phase, elapsed)) = phases.next().await {
            if last != Some(phase) {
                println!("{:>10.3} s  {phase:?}", elapsed.as_secs_f64());
                last = Some(phase);
            }
            if phase.is_terminal() {
                break;
            }
        }
    };
    let (_, finished) = tokio::join!(watch_phases, test.finish());
    let (outcome, _hal) = finished?;
    Ok(outcome)
}

fn print_outcome(outcome: &TestOutcome) {
    match &outcome.termination {
        Termination::Complete => println!("Test complete, {} samples", outcome.samples.len()),
        Termination::Aborted(e) => println!("Test aborted: {e}"),
    }
    if outcome.sensor_faults.total() > 0 {
        println!("Sensor faults: {:?}", outcome.sensor_faults);
    }
    match &outcome.properties {
        Some(Ok(p)) => {
            println!("  hardness          {:>12.4} GPa", p.hardness);
            println!("  elastic modulus   {:>12.4} GPa", p.elastic_modulus);
            println!("  reduced modulus   {:>12.4} GPa", p.reduced_modulus);
            println!("  contact stiffness {:>12.4} µN/nm", p.contact_stiffness);
            println!("  contact depth     {:>12.4} nm", p.contact_depth);
            println!("  plastic depth     {:>12.4} nm", p.plastic_depth);
            println!("  total work        {:>12.4} µN·nm", p.total_work);
            println!("  elastic work      {:>12.4} µN·nm", p.elastic_work);
            println!("  plastic work      {:>12.4} µN·nm", p.plastic_work);
        }
        Some(Err(e)) => println!("Properties not computable: {e}"),
        None => {}
    }
}
