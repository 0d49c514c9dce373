//! duckconn - run SQL against an embedded or remote DuckDB engine.

mod cli;

use std::sync::Arc;

use cli::{Cli, OutputFormat};
use duckconn::config::Config;
use duckconn::load::LoadFileOptions;
use duckconn::logging::{self, LogTarget};
use duckconn::transport::{InProcessTransport, RemoteTransport, Transport, TransportKind};
use duckconn::{Connector, ConnectorError, QueryOptions, Result, Rows, Table};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    logging::init(if cli.log_file {
        LogTarget::File
    } else {
        LogTarget::Stderr
    });

    let result = tokio::runtime::Runtime::new()
        .map_err(|e| ConnectorError::internal(format!("Failed to start runtime: {e}")))
        .and_then(|runtime| runtime.block_on(run(cli)));

    if let Err(e) = result {
        error!("{}: {}", e.category(), e);
        std::process::exit(if e.is_abort() { 130 } else { 1 });
    }
}

async fn run(cli: Cli) -> Result<()> {
    cli.validate().map_err(ConnectorError::config)?;

    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)?;
    cli.apply_to(&mut config);
    config.apply_env_defaults();

    // Ctrl-C cancels whatever query is running.
    let interrupt = CancellationToken::new();
    let on_interrupt = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match config.transport {
        TransportKind::InProcess => {
            info!("Database: {}", config.in_process.db_path);
            let transport = Arc::new(InProcessTransport::new(config.in_process.clone()));
            let connector =
                Connector::from_parts(transport, config.in_process.initialization_query.clone());
            session(&connector, &cli, &interrupt).await
        }
        TransportKind::Remote => {
            config.remote.validate()?;
            info!("Server: {}", config.remote.display_string());
            let transport = Arc::new(RemoteTransport::new(config.remote.clone()));
            transport.add_notification_listener(|payload| println!("notify: {payload}"));
            let connector =
                Connector::from_parts(transport, config.remote.initialization_query.clone());
            session(&connector, &cli, &interrupt).await?;

            if !cli.subscribe.is_empty() {
                info!("Listening for notifications, press Ctrl-C to stop");
                connector.initialize().await?;
                interrupt.cancelled().await;
                connector.destroy().await?;
            }
            Ok(())
        }
    }
}

/// Loads the requested file, then runs each statement and prints its result.
async fn session<T>(
    connector: &Connector<T>,
    cli: &Cli,
    interrupt: &CancellationToken,
) -> Result<()>
where
    T: Transport + ?Sized,
{
    let format = cli.output_format().map_err(ConnectorError::config)?;
    connector.initialize().await?;

    if let (Some(file), Some(table)) = (&cli.load, cli.load_table()) {
        let method = cli.load_method().map_err(ConnectorError::config)?;
        connector
            .load_file(file.as_path(), &table, &LoadFileOptions::new(method))
            .await?;
        println!("Loaded {} into {table}", file.display());
    }

    for sql in &cli.sql {
        let options = QueryOptions::new().with_signal(interrupt.clone());
        let table = connector.query(sql.clone(), options).await?;
        print_table(table, format)?;
    }

    if cli.subscribe.is_empty() {
        if let Err(e) = connector.destroy().await {
            warn!("Cleanup failed: {e}");
        }
    }
    Ok(())
}

fn print_table(table: Table, format: OutputFormat) -> Result<()> {
    if table.num_columns() == 0 {
        println!("OK");
        return Ok(());
    }

    match format {
        OutputFormat::Table => println!("{}", table.pretty()?),
        OutputFormat::Json => {
            for row in &Rows::new(table) {
                println!("{}", row.to_json());
            }
        }
    }
    Ok(())
}
