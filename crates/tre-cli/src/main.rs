use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tre_core::{GeoidInput, StabilityMetrics, TensionEngine, VaultId, export_json};
use tre_store::{DB_FILE, Store, render_config, resolve_config, resolve_data_dir};

#[derive(Parser)]
#[command(name = "tre", about = "Semantic tension resolution engine cycle driver")]
struct Cli {
    /// Database file (default: <data dir>/tre.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Engine config TOML (default: <data dir>/tre.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest geoids from JSON files (an array of geoid inputs each)
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run resolution cycles over every stored geoid
    Cycle {
        /// Emit gradients strictly above this tension (default: config)
        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long, default_value_t = 0.0)]
        axis_convergence: f64,

        #[arg(long, default_value_t = 0.0)]
        vault_resonance: f64,

        #[arg(long, default_value_t = 0.0)]
        ambiguity: f64,

        /// Number of cycles to run
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Show vault, overflow and queue statistics
    Status {
        /// Only this vault (A or B)
        vault: Option<VaultId>,
    },

    /// Rebalance the two vaults
    Rebalance,

    /// Export geoids, vaults and overflow to a JSON file
    Export { path: PathBuf },

    /// List stored geoids
    Geoids,

    /// Print the resolved engine config as TOML
    Config,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// An engine warm-started from the store.
struct Session {
    store: Arc<Store>,
    engine: TensionEngine,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let data_dir = resolve_data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let config =
            resolve_config(cli.config.as_deref(), &data_dir).context("failed to load config")?;
        let db = cli.db.clone().unwrap_or_else(|| data_dir.join(DB_FILE));
        let store = Arc::new(
            Store::open(&db).with_context(|| format!("failed to open {}", db.display()))?,
        );

        let engine = TensionEngine::restore(config, store.clone())
            .context("failed to restore vaults")?;
        for geoid in store.load_geoids().context("failed to load geoids")? {
            engine
                .geoids()
                .insert(geoid)
                .context("stored geoid rejected")?;
        }
        engine.set_cycle(store.load_cycle().context("failed to load cycle counter")?);
        engine.restore_buffered(store.load_buffered().context("failed to load buffered pairs")?);
        Ok(Self { store, engine })
    }

    fn save(&self) -> Result<()> {
        self.store
            .save_geoids(&self.engine.geoids().all_snapshots())
            .context("failed to save geoids")?;
        self.store
            .save_cycle(self.engine.cycle())
            .context("failed to save cycle counter")?;
        self.store
            .save_buffered(&self.engine.buffered_pairs())
            .context("failed to save buffered pairs")?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Ingest { files } => cmd_ingest(&cli, files),
        Commands::Cycle {
            threshold,
            axis_convergence,
            vault_resonance,
            ambiguity,
            count,
        } => cmd_cycle(
            &cli,
            *threshold,
            StabilityMetrics {
                axis_convergence: *axis_convergence,
                vault_resonance: *vault_resonance,
                contradiction_lineage_ambiguity: *ambiguity,
            },
            *count,
        ),
        Commands::Status { vault } => cmd_status(&cli, *vault),
        Commands::Rebalance => cmd_rebalance(&cli),
        Commands::Export { path } => cmd_export(&cli, path),
        Commands::Geoids => cmd_geoids(&cli),
        Commands::Config => cmd_config(&cli),
    }
}

fn cmd_ingest(cli: &Cli, files: &[PathBuf]) -> Result<()> {
    let session = Session::open(cli)?;
    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let inputs: Vec<GeoidInput> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let n = inputs.len();
        for input in inputs {
            session
                .engine
                .ingest(input)
                .with_context(|| format!("failed to ingest geoid from {}", path.display()))?;
        }
        println!("ingested {} → {n} geoids", path.display());
    }
    session.save()?;
    println!("done. geoids={}", session.engine.geoids().len());
    Ok(())
}

fn cmd_cycle(
    cli: &Cli,
    threshold: Option<f64>,
    stability: StabilityMetrics,
    count: u32,
) -> Result<()> {
    let session = Session::open(cli)?;
    let engine = &session.engine;
    let threshold = threshold.unwrap_or(engine.config().tension.default_threshold);

    for _ in 0..count {
        let ids = engine.geoids().ids();
        let report = engine.run_cycle(&ids, threshold, &stability);
        println!(
            "cycle {}: gradients={} resubmitted={} scars={} surged={} buffered={} errors={}",
            report.cycle,
            report.gradients,
            report.resubmitted,
            report.scars.len(),
            report.surged.len(),
            report.buffered.len(),
            report.errors,
        );
        for scar in &report.scars {
            println!(
                "  scar {} → vault {}{} delta={:.4} reason={}",
                scar.id,
                scar.vault_id,
                if scar.quarantined { " (quarantined)" } else { "" },
                scar.delta_entropy,
                scar.reason,
            );
        }
    }
    session.save()
}

fn cmd_status(cli: &Cli, only: Option<VaultId>) -> Result<()> {
    let session = Session::open(cli)?;
    let engine = &session.engine;
    let vaults = match only {
        Some(v) => vec![v],
        None => vec![VaultId::A, VaultId::B],
    };
    for vault in vaults {
        let s = engine.vault_status(vault);
        let avg = s
            .average_cls_angle
            .map(|a| format!("{a:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "vault {}:    count={} capacity={} stress={:.4} avg_cls={} quarantined={}",
            s.vault, s.count, s.capacity, s.stress_index, avg, s.quarantined
        );
    }
    if only.is_none() {
        println!("overflow:   {}", engine.overflow_len());
        println!("geoids:     {}", engine.geoids().len());
        println!("cycle:      {}", engine.cycle());
        println!("buffered:   {}", engine.buffered_pairs().len());
    }
    Ok(())
}

fn cmd_rebalance(cli: &Cli) -> Result<()> {
    let session = Session::open(cli)?;
    let report = session.engine.rebalance().context("rebalance failed")?;
    println!(
        "moved={} A={} B={}",
        report.moved_count, report.count_a, report.count_b
    );
    Ok(())
}

fn cmd_export(cli: &Cli, path: &Path) -> Result<()> {
    let session = Session::open(cli)?;
    let json = export_json(&session.engine).context("failed to serialize state")?;
    std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;
    println!("exported to {}", path.display());
    Ok(())
}

fn cmd_geoids(cli: &Cli) -> Result<()> {
    let session = Session::open(cli)?;
    let engine = &session.engine;
    for geoid in engine.geoids().all_snapshots() {
        let dominant = geoid
            .dominant_feature()
            .map(|(k, w)| format!("{k}={w:.3}"))
            .unwrap_or_else(|| "-".to_string());
        let energy = engine.energy(geoid.id).context("failed to read energy")?;
        println!(
            "{} entropy={:.4} dominant={} energy={:.4} mutations={}",
            geoid.id,
            geoid.entropy(),
            dominant,
            energy,
            geoid.metadata.entropy_history.len(),
        );
    }
    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let data_dir = resolve_data_dir();
    let config =
        resolve_config(cli.config.as_deref(), &data_dir).context("failed to load config")?;
    print!("{}", render_config(&config).context("failed to render config")?);
    Ok(())
}
