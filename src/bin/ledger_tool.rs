use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};

use vote_guard::config::AppConfig;
use vote_guard::database::Database;
use vote_guard::ledger::{ChainReport, Ledger};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("ledger-tool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect the vote ledger and tamper alerts")
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("URL")
                .global(true)
                .help("Database URL (defaults to the configured database_url)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("verify")
                .about("Verify the chain of one election")
                .arg(
                    Arg::new("election")
                        .value_name("ELECTION_ID")
                        .value_parser(clap::value_parser!(i64))
                        .required(true),
                ),
        )
        .subcommand(Command::new("verify-all").about("Verify the whole ledger, including deleted identifiers"))
        .subcommand(
            Command::new("alerts").about("List tamper alerts").arg(
                Arg::new("unacknowledged")
                    .short('u')
                    .long("unacknowledged")
                    .action(clap::ArgAction::SetTrue)
                    .help("Only alerts that still need review"),
            ),
        )
        .subcommand(
            Command::new("ack").about("Acknowledge a tamper alert").arg(
                Arg::new("alert")
                    .value_name("ALERT_ID")
                    .value_parser(clap::value_parser!(i64))
                    .required(true),
            ),
        )
        .subcommand(Command::new("migrate").about("Apply database migrations"))
        .get_matches();

    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let database_url = match matches.get_one::<String>("database") {
        Some(url) => url.clone(),
        None => AppConfig::load()?.database_url,
    };
    let database = Database::new(&database_url)
        .await
        .with_context(|| format!("Failed to open {}", database_url))?;

    match matches.subcommand() {
        Some(("verify", sub)) => {
            let election_id = *sub
                .get_one::<i64>("election")
                .ok_or_else(|| anyhow!("ELECTION_ID is required"))?;
            let report = Ledger::new(database).verify_election(election_id).await?;
            finish(report)
        }
        Some(("verify-all", _)) => {
            let report = Ledger::new(database).verify_all().await?;
            for gap in &report.gaps {
                println!(
                    "  gap after vote {}: {} identifier(s) missing",
                    gap.after_vote_id, gap.missing
                );
            }
            finish(report)
        }
        Some(("alerts", sub)) => {
            let alerts = database.list_alerts(sub.get_flag("unacknowledged")).await?;
            if alerts.is_empty() {
                println!("No alerts");
            }
            for alert in alerts {
                println!(
                    "#{} {} [{}]{} {}",
                    alert.alert_id,
                    alert.created_at.to_rfc3339(),
                    alert.source,
                    if alert.acknowledged { " (acknowledged)" } else { "" },
                    alert.reason
                );
            }
            Ok(())
        }
        Some(("ack", sub)) => {
            let alert_id = *sub
                .get_one::<i64>("alert")
                .ok_or_else(|| anyhow!("ALERT_ID is required"))?;
            database.acknowledge_alert(alert_id).await?;
            println!("✓ Alert {} acknowledged", alert_id);
            Ok(())
        }
        Some(("migrate", _)) => {
            database.run_migrations().await?;
            println!("✓ Migrations applied");
            Ok(())
        }
        _ => Err(anyhow!("Unknown command")),
    }
}

fn finish(report: ChainReport) -> Result<()> {
    println!("{}", report.summary());
    if report.is_intact() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
