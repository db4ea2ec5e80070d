use anyhow::{Context, Result};
use clap::Parser;
use sward_core::{DAYS_PER_YEAR, Diet, PlotConfig, PlotWorld};
use sward_storage::Storage;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "sward",
    version,
    about = "Simulate a grazed vegetation plot over the years"
)]
struct Cli {
    /// Simulated years, spin-up included.
    #[arg(long)]
    years: Option<u32>,

    /// Years of plant-only growth before herbivores are released.
    #[arg(long)]
    spin_up: Option<u32>,

    /// Plot side length in metres; the plot wraps toroidally.
    #[arg(long)]
    side: Option<f64>,

    /// Plant grid columns.
    #[arg(long)]
    plants_x: Option<u32>,

    /// Plant grid rows.
    #[arg(long)]
    plants_y: Option<u32>,

    /// Herbivores released after spin-up; 0 leaves the plot ungrazed.
    #[arg(long)]
    herbivores: Option<u32>,

    /// Herbivore body mass in kg.
    #[arg(long)]
    herbivore_mass: Option<f64>,

    /// Herbivore diet: grazer, browser or mixed.
    #[arg(long, value_parser = parse_diet)]
    diet: Option<Diet>,

    /// Seed for the world RNG; a random seed is drawn when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// DuckDB file to record the run into.
    #[arg(long)]
    db: Option<String>,

    /// Log warnings and errors only.
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    let config = build_config(&cli);

    match cli.db.as_deref() {
        Some(path) => run_recorded(config, path),
        None => run_unrecorded(config),
    }
}

fn init_tracing(quiet: bool) {
    let fallback = if quiet { "warn" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Overlay the command-line flags on the reference parameterisation.
fn build_config(cli: &Cli) -> PlotConfig {
    let mut config = PlotConfig::default();
    if let Some(years) = cli.years {
        config.years = years;
    }
    if let Some(spin_up) = cli.spin_up {
        config.spin_up_years = spin_up;
    }
    if let Some(side) = cli.side {
        config.side_m = side;
    }
    if let Some(cols) = cli.plants_x {
        config.plants_x = cols;
    }
    if let Some(rows) = cli.plants_y {
        config.plants_y = rows;
    }
    if let Some(count) = cli.herbivores {
        config.herbivore_count = count;
    }
    if let Some(mass) = cli.herbivore_mass {
        config.herbivore_mass_kg = mass;
    }
    if let Some(diet) = cli.diet {
        config.herbivore_diet = diet;
    }
    if cli.seed.is_some() {
        config.rng_seed = cli.seed;
    }
    config
}

fn run_recorded(config: PlotConfig, path: &str) -> Result<()> {
    let mut storage =
        Storage::open(path).with_context(|| format!("failed to open database {path}"))?;
    let run_id = storage.begin_run(&config)?;
    info!(run_id, db = path, "recording run");

    let mut world = PlotWorld::with_persistence(config, Box::new(storage))?;
    run_world(&mut world)?;
    report_last_day(&world);
    drop(world);

    // Reopen after the world has flushed and released the file.
    let mut storage = Storage::open(path)?;
    storage.optimize()?;
    let days = storage.recorded_days(run_id)?;
    info!(run_id, days, "run recorded");
    for totals in storage.herbivore_totals(run_id)? {
        info!(
            herbivore = totals.herbivore,
            intake_kg = totals.intake_kg,
            distance_m = totals.distance_m,
            energy_balance_kj = totals.final_energy_balance_kj,
            "herbivore lifetime totals"
        );
    }
    Ok(())
}

fn run_unrecorded(config: PlotConfig) -> Result<()> {
    let mut world = PlotWorld::new(config)?;
    run_world(&mut world)?;
    report_last_day(&world);
    Ok(())
}

fn run_world(world: &mut PlotWorld) -> Result<()> {
    let total_days = world.config().total_days();
    info!(
        days = total_days,
        plants = world.plants().len(),
        herbivores = world.herbivores().len(),
        spin_up_years = world.config().spin_up_years,
        "starting run"
    );
    for _ in 0..total_days {
        let summary = world.advance_day()?;
        if summary.day.day_of_year() == DAYS_PER_YEAR - 1 {
            info!(
                year = summary.year,
                shoot_total_kg = summary.shoot_total_kg,
                living_plants = summary.living_plants,
                "year complete"
            );
        }
    }
    Ok(())
}

fn report_last_day(world: &PlotWorld) {
    if let Some(last) = world.history().back() {
        info!(
            day = last.day.0,
            shoot_total_kg = last.shoot_total_kg,
            shoot_mean_kg = last.shoot_mean_kg,
            living_plants = last.living_plants,
            "final plot state"
        );
        for (slot, herbivore) in last.herbivores.iter().enumerate() {
            info!(
                herbivore = slot,
                intake_kg = herbivore.intake_kg,
                energy_balance_kj = herbivore.energy_balance_kj,
                water_balance_kg = herbivore.water_balance_kg,
                "final herbivore day"
            );
        }
    } else {
        warn!("run finished without a day summary");
    }
}

fn parse_diet(raw: &str) -> Result<Diet, String> {
    match raw.to_ascii_lowercase().as_str() {
        "grazer" => Ok(Diet::Grazer),
        "browser" => Ok(Diet::Browser),
        "mixed" => Ok(Diet::Mixed),
        other => Err(format!(
            "unknown diet '{other}' (expected grazer, browser or mixed)"
        )),
    }
}
