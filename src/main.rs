use contract_ledger::{
    config::{database, ledger},
    core::{line_item, report},
    errors::{Error, Result},
};
use dotenvy::dotenv;
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Reads `--contract <id>` from the command line, if present.
fn contract_filter() -> Result<Option<i64>> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--contract" {
            let value = args.next().ok_or_else(|| Error::Config {
                message: "--contract needs a contract id".to_string(),
            })?;
            let contract_id = value.parse().map_err(|_| Error::Config {
                message: format!("Invalid contract id: {value}"),
            })?;
            return Ok(Some(contract_id));
        }
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Ledger policy and command line
    let config = ledger::load_default_config()
        .inspect_err(|e| error!("Failed to load ledger configuration: {e}"))?;
    let contract = contract_filter()?;

    // 4. Database
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {e}"))?;
    database::create_tables(&db).await?;
    info!("Database ready");

    // 5. Report
    let lines = match contract {
        Some(contract_id) => line_item::list_for_contract(&db, contract_id).await?,
        None => line_item::list_all(&db).await?,
    };
    if lines.is_empty() {
        info!("No contract line items to report");
        return Ok(());
    }

    let mut current_contract = None;
    for line in lines {
        if current_contract != Some(line.contract_id) {
            println!("Contract {}", line.contract_id);
            current_contract = Some(line.contract_id);
        }
        let line_report =
            report::line_item_report(&db, line.id, config.low_balance_threshold, Some(0)).await?;
        println!("  {}", report::format_report_line(&line_report));
    }

    Ok(())
}
