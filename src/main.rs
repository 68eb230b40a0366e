use anyhow::{bail, Context, Result};
use carbon_ledger::{
    checkout, import_emissions_csv, import_snapshot, plan_neutralization, save_snapshot,
    AllocationPlan, Catalog, EmissionCategory, EmissionMethod, Ledger, LedgerConfig, LedgerEntry,
    LedgerError, NewEmission,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "carbon-ledger", version, about = "Carbon balance ledger and removal optimizer")]
struct Cli {
    /// SQLite database (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON offerings file (overrides config)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Enable logging (RUST_LOG overrides the default filter)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database
    Init,
    /// Record an emission
    Emit {
        #[arg(long)]
        kg: f64,
        #[arg(long)]
        label: String,
        #[arg(long)]
        category: EmissionCategory,
        #[arg(long, default_value = "manual")]
        method: EmissionMethod,
        /// RFC 3339 or YYYY-MM-DD (default: now)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        confidence: Option<f64>,
    },
    /// Import emissions from a bank-feed CSV
    ImportCsv { file: PathBuf },
    /// Show the current balance
    Balance,
    /// Lifetime totals and breakdown
    Summary,
    /// Recent activity, newest first
    Activity {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List offerings in allocation order
    Catalog,
    /// Preview a removal plan without buying anything
    Allocate {
        /// kg to neutralize (default: current debt)
        #[arg(long)]
        target: Option<f64>,
        #[arg(long)]
        budget: Option<f64>,
    },
    /// Allocate and buy removals
    Neutralize {
        #[arg(long)]
        target: Option<f64>,
        #[arg(long)]
        budget: Option<f64>,
        /// Confirm the purchase
        #[arg(long)]
        yes: bool,
    },
    /// Write a JSON snapshot of every record
    Export { file: PathBuf },
    /// Load a JSON snapshot into an empty ledger
    Import { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        init_logging();
    }

    let mut config = LedgerConfig::load();
    if let Some(db) = cli.db.clone() {
        config.database_path = Some(db);
    }
    if let Some(catalog) = cli.catalog.clone() {
        config.catalog_path = Some(catalog);
    }

    run(cli.command, &config)
}

/// Initialize logging with tracing
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carbon_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_ledger(config: &LedgerConfig) -> Result<Ledger> {
    let path = config.database_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ledger::open(&path).with_context(|| format!("Failed to open ledger at {}", path.display()))
}

fn load_catalog(config: &LedgerConfig) -> Result<Catalog> {
    config.catalog().context("Failed to load catalog")
}

fn run(command: Command, config: &LedgerConfig) -> Result<()> {
    match command {
        Command::Init => {
            let ledger = open_ledger(config)?;
            println!("✓ Ledger ready at {} ({} records)", config.database_path().display(), ledger.len());
        }

        Command::Emit { kg, label, category, method, date, confidence } => {
            let ledger = open_ledger(config)?;
            let mut draft = NewEmission::new(&label, kg, category, method);
            draft.date = date;
            draft.confidence = confidence;

            let record = ledger.add_emission(draft).map_err(explain)?;
            println!("✓ Recorded {:.2} kg from {} ({})", record.amount_kg, record.source, record.category.as_str());
            println!("  Balance: {:.2} kg", ledger.balance());
        }

        Command::ImportCsv { file } => {
            let ledger = open_ledger(config)?;
            let report = import_emissions_csv(&ledger, &file)
                .with_context(|| format!("Failed to import {}", file.display()))?;

            println!("✓ {}", report.summary());
            for rejected in &report.rejected {
                println!("  ✗ row {}: {}", rejected.row, rejected.reason);
            }
            println!("  Balance: {:.2} kg", ledger.balance());
        }

        Command::Balance => {
            let ledger = open_ledger(config)?;
            let summary = ledger.summary();
            println!("{:+.2} kg CO2e ({})", summary.balance_kg, summary.status.as_str());
        }

        Command::Summary => {
            let ledger = open_ledger(config)?;
            let summary = ledger.summary();

            println!("Balance:          {:+.2} kg ({})", summary.balance_kg, summary.status.as_str());
            println!("Lifetime emitted: {:.2} kg in {} record(s)", summary.lifetime_emitted_kg, summary.emission_count);
            println!("Lifetime removed: {:.2} kg in {} record(s)", summary.lifetime_removed_kg, summary.removal_count);
            println!("Spent on removal: ${:.2}", summary.lifetime_spent_usd);
            println!("≈ {:.1} trees for a year, {:.2} transatlantic flights", summary.tree_equivalent, summary.flight_equivalent);
            for (category, kg) in &summary.emitted_by_category {
                println!("  {:<12} {:>10.2} kg", category.as_str(), kg);
            }
        }

        Command::Activity { limit } => {
            let ledger = open_ledger(config)?;
            for entry in ledger.activity(Some(limit)) {
                print_entry(&entry);
            }
        }

        Command::Catalog => {
            let catalog = load_catalog(config)?;
            for offering in catalog.offerings() {
                println!(
                    "{:<18} {:<20} {:>8.3} $/kg {:>8.0} y  {}",
                    offering.provider_id,
                    offering.method.as_str(),
                    offering.price_per_kg,
                    offering.permanence_years,
                    offering.region
                );
            }
        }

        Command::Allocate { target, budget } => {
            let ledger = open_ledger(config)?;
            let catalog = load_catalog(config)?;
            let plan = build_plan(&ledger, &catalog, config, target, budget)?;
            print_plan(&plan);
        }

        Command::Neutralize { target, budget, yes } => {
            let ledger = open_ledger(config)?;
            let catalog = load_catalog(config)?;
            let plan = build_plan(&ledger, &catalog, config, target, budget)?;
            print_plan(&plan);

            if plan.is_empty() {
                println!("Nothing to buy.");
                return Ok(());
            }
            if !yes {
                println!("Re-run with --yes to purchase this plan.");
                return Ok(());
            }

            let settlement = checkout(&ledger, &plan).map_err(explain)?;
            println!(
                "✓ Retired {:.2} kg for ${:.2} (settlement {})",
                settlement.total_kg, settlement.total_cost_usd, settlement.settlement_reference
            );
            println!("  Balance: {:.2} kg", ledger.balance());
        }

        Command::Export { file } => {
            let ledger = open_ledger(config)?;
            let count = save_snapshot(&ledger, &file)
                .with_context(|| format!("Failed to write {}", file.display()))?;
            println!("✓ Exported {} record(s) to {}", count, file.display());
        }

        Command::Import { file } => {
            let ledger = open_ledger(config)?;
            import_from(&ledger, &file)?;
        }
    }

    Ok(())
}

fn import_from(ledger: &Ledger, file: &Path) -> Result<()> {
    if !ledger.is_empty() {
        bail!("Ledger already has {} record(s); import needs an empty ledger", ledger.len());
    }
    let count = import_snapshot(ledger, file).map_err(explain)?;
    println!("✓ Imported {} record(s), balance {:.2} kg", count, ledger.balance());
    Ok(())
}

fn build_plan(
    ledger: &Ledger,
    catalog: &Catalog,
    config: &LedgerConfig,
    target: Option<f64>,
    budget: Option<f64>,
) -> Result<AllocationPlan> {
    let target = target.unwrap_or_else(|| ledger.debt_kg());
    let budget = budget.unwrap_or_else(|| config.default_budget_usd());
    plan_neutralization(catalog, target, budget).map_err(explain)
}

/// Turn a ledger error into a message that lists every problem
fn explain(err: LedgerError) -> anyhow::Error {
    if let LedgerError::CommitFailure { failures, .. } = &err {
        let lines: Vec<String> = failures
            .iter()
            .map(|f| {
                let reasons: Vec<String> = f.errors.iter().map(|e| e.to_string()).collect();
                format!("line {} ({}): {}", f.line_index + 1, f.offering_id, reasons.join("; "))
            })
            .collect();
        return anyhow::anyhow!("{}\n  {}", err, lines.join("\n  "));
    }
    anyhow::Error::new(err)
}

fn print_plan(plan: &AllocationPlan) {
    println!("Plan: {}", plan.summary());
    for (i, line) in plan.lines.iter().enumerate() {
        println!(
            "  {}. {:<20} {:<20} {:>10.2} kg  ${:>8.2}",
            i + 1,
            line.provider,
            line.method.as_str(),
            line.amount_kg,
            line.cost_usd
        );
    }
}

fn print_entry(entry: &LedgerEntry) {
    let tag = match entry {
        LedgerEntry::Emission(e) => e.category.as_str(),
        LedgerEntry::Removal(r) => r.method.as_str(),
    };
    println!(
        "{}  {:>+10.2} kg  {:<12} {}",
        entry.date().format("%Y-%m-%d %H:%M"),
        entry.signed_kg(),
        tag,
        entry.label()
    );
}
