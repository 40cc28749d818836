use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use ndarray::ArrayD;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::Level;

use sd_app::{
    AppError, AppResult, DatabaseConfig, DerivativeSettings, FileJobBackend, Model, check_integrity,
    load_config, option_sets,
};
use sd_core::{Combination, SpinupOptions, TIME_STEPS};
use sd_spinup::RunRecord;

#[derive(Parser)]
#[command(name = "sd-cli")]
#[command(about = "Simulation run database - spinup runs and model derivatives", long_about = None)]
struct Cli {
    /// Path to the database configuration YAML file
    #[arg(long, global = true, default_value = "spindb.yaml")]
    config: PathBuf,
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the integrity of the stored database
    Check {
        /// Models to check (all configured models if omitted)
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
    },
    /// List stored (model, concentration, time step, parameters) identities
    List {
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        /// Skip unreadable entries instead of failing
        #[arg(long)]
        best_effort: bool,
    },
    /// Show the spinup runs of every stored parameter set of a model
    Chain {
        model: String,
        /// Only this time step
        #[arg(long)]
        time_step: Option<u32>,
        /// Skip unreadable entries instead of failing
        #[arg(long)]
        best_effort: bool,
    },
    /// Evaluate the model and write the values as JSON
    F {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Evaluate the model derivative and write it as JSON
    Df {
        #[command(flatten)]
        model: ModelArgs,
        /// Derivative order (1 or 2)
        #[arg(long, default_value_t = 1)]
        order: u8,
        /// Finite difference accuracy order (1 or 2)
        #[arg(long)]
        accuracy_order: Option<u8>,
        /// Also differentiate with respect to the total concentration
        #[arg(long)]
        include_total_concentration: bool,
    },
}

#[derive(clap::Args)]
struct ModelArgs {
    model: String,
    /// Model parameters (model defaults if omitted)
    #[arg(long, value_delimiter = ',')]
    parameters: Option<Vec<f64>>,
    #[arg(long, default_value_t = 1)]
    time_step: u32,
    /// Spinup years
    #[arg(long)]
    years: Option<u32>,
    /// Spinup tolerance
    #[arg(long, default_value_t = 0.0)]
    tolerance: f64,
    /// How years and tolerance combine: "and" or "or"
    #[arg(long, default_value = "or")]
    combination: String,
    /// Number of time steps of the returned values
    #[arg(long, default_value_t = 12)]
    time_dim: usize,
    /// Tracers (all model tracers if omitted)
    #[arg(long, value_delimiter = ',')]
    tracers: Option<Vec<String>>,
    /// Output JSON file (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Check { models } => cmd_check(&config, &model_names(&config, models)),
        Commands::List {
            models,
            best_effort,
        } => cmd_list(&config, &model_names(&config, models), best_effort),
        Commands::Chain {
            model,
            time_step,
            best_effort,
        } => cmd_chain(&config, &model, time_step, best_effort),
        Commands::F { model } => cmd_f(&config, &model),
        Commands::Df {
            model,
            order,
            accuracy_order,
            include_total_concentration,
        } => cmd_df(
            &config,
            &model,
            DerivativeSettings {
                order,
                accuracy_order,
                include_total_concentration,
            },
        ),
    }
}

fn model_names(config: &DatabaseConfig, requested: Vec<String>) -> Vec<String> {
    if requested.is_empty() {
        config.model_names()
    } else {
        requested
    }
}

fn cmd_check(config: &DatabaseConfig, models: &[String]) -> AppResult<()> {
    println!("Checking database: {}", config.root.display());
    check_integrity(config, models)?;
    println!("✓ Database is consistent");
    Ok(())
}

fn cmd_list(config: &DatabaseConfig, models: &[String], best_effort: bool) -> AppResult<()> {
    let sets = option_sets(config, models, &TIME_STEPS, best_effort)?;
    if sets.is_empty() {
        println!("No parameter sets stored");
        return Ok(());
    }
    for set in sets {
        let runs = set.run_chain(best_effort)?.len();
        let concentration_kind = if set.use_constant_concentrations {
            "constant"
        } else {
            "vector"
        };
        println!(
            "  {} concentration {} #{} time step {} parameter set #{} ({} runs): {:?}",
            set.model_name,
            concentration_kind,
            set.concentration_index,
            set.time_step,
            set.parameter_set_index,
            runs,
            set.parameters
        );
    }
    Ok(())
}

fn cmd_chain(
    config: &DatabaseConfig,
    model: &str,
    time_step: Option<u32>,
    best_effort: bool,
) -> AppResult<()> {
    config.model(model)?;
    let backend = config.command_backend()?;
    let time_steps: Vec<u32> = match time_step {
        Some(ts) => vec![ts],
        None => TIME_STEPS.to_vec(),
    };

    for set in option_sets(config, &[model.to_string()], &time_steps, best_effort)? {
        println!(
            "{} (time step {}): {:?}",
            set.parameter_set_dir.display(),
            set.time_step,
            set.parameters
        );
        let chain = set.run_chain(best_effort)?;
        if chain.is_empty() {
            println!("  no runs");
        }
        for run_dir in chain.runs() {
            let name = run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match RunRecord::load(&backend, run_dir) {
                Ok(run) => println!(
                    "  {}: {} years ({} total), tolerance {:e}",
                    name, run.achieved_years, run.total_years, run.achieved_tolerance
                ),
                Err(e) => println!("  {}: unfinished ({})", name, e),
            }
        }
    }
    Ok(())
}

fn build_model(
    config: &DatabaseConfig,
    args: &ModelArgs,
) -> AppResult<Model<FileJobBackend>> {
    let mut options = config.model_options(&args.model)?;
    if let Some(parameters) = &args.parameters {
        options.parameters = parameters.clone();
    }
    options.time_step = args.time_step;
    let combination: Combination = args.combination.parse()?;
    let years = args.years.unwrap_or(options.spinup_options.years);
    options.spinup_options = SpinupOptions::new(years, args.tolerance, combination);
    Model::new(config, options, config.command_backend()?)
}

/// JSON form of an array.
#[derive(Serialize)]
struct JsonArray {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl From<&ArrayD<f64>> for JsonArray {
    fn from(array: &ArrayD<f64>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            values: array.iter().copied().collect(),
        }
    }
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> AppResult<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    };
    serde_json::to_writer_pretty(&mut writer, value).map_err(io::Error::from)?;
    writeln!(writer)?;
    writer.flush()?;
    if let Some(path) = output {
        eprintln!("✓ Written to {}", path.display());
    }
    Ok(())
}

fn to_json(values: &IndexMap<String, ArrayD<f64>>) -> IndexMap<&str, JsonArray> {
    values
        .iter()
        .map(|(tracer, array)| (tracer.as_str(), JsonArray::from(array)))
        .collect()
}

fn cmd_f(config: &DatabaseConfig, args: &ModelArgs) -> AppResult<()> {
    let mut model = build_model(config, args)?;
    let values = model.f_all(args.time_dim, args.tracers.as_deref())?;
    write_json(&to_json(&values), args.output.as_deref())
}

fn cmd_df(config: &DatabaseConfig, args: &ModelArgs, settings: DerivativeSettings) -> AppResult<()> {
    if !matches!(settings.order, 1 | 2) {
        return Err(AppError::InvalidInput(format!(
            "derivative order must be 1 or 2, got {}",
            settings.order
        )));
    }
    let mut model = build_model(config, args)?;
    let values = model.df_all(args.time_dim, args.tracers.as_deref(), settings)?;
    write_json(&to_json(&values), args.output.as_deref())
}
