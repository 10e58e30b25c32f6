//! Multicon - query Redshift, BigQuery and Databricks through named profiles.

use multicon::cli::{self, Cli, Command, OutputFormat};
use multicon::error::{ConnectorError, Result};
use multicon::logging;
use multicon::magic::{self, CellArgs};
use multicon::session::{Session, DEFAULT_CHUNK_SIZE};
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();

    if cli.log_file {
        logging::init_file_logging();
    } else {
        logging::init_stderr_logging();
    }

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut session = Session::open(cli.profile.as_deref(), cli.config.as_deref()).await?;
    let result = dispatch(&mut session, cli.command, cli.format).await;
    session.shutdown().await;
    result
}

async fn dispatch(session: &mut Session, command: Command, format: OutputFormat) -> Result<()> {
    let output = match command {
        Command::Query { sql, chunk_size } => {
            let table = session.query(&sql, Some(chunk_size)).await?;
            cli::render_table(&table, format)?
        }
        Command::Exec { sql } => {
            let result = session.query_raw(&sql).await?;
            cli::render_exec(&result, format)?
        }
        Command::Select { fragment } => {
            let sql = magic::select_statement(&fragment.join(" "));
            let table = session.query(&sql, None).await?;
            cli::render_table(&table, format)?
        }
        Command::Sql { file, args } => {
            let cell = cli::read_source(&file)?;
            let args = CellArgs::from_args(&args)?;
            let sql = args.statement(&cell)?;
            debug!("Cell statement: {}", sql);
            let table = session.query(&sql, Some(DEFAULT_CHUNK_SIZE)).await?;

            match &args.target {
                Some(target) => {
                    let dir = std::env::current_dir().map_err(|e| {
                        ConnectorError::config(format!(
                            "Cannot determine the working directory: {e}"
                        ))
                    })?;
                    let path = cli::save_table(&table, target, &dir)?;
                    let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                    format!("Done! Result in {}", name.unwrap_or_else(|| target.clone()))
                }
                None => cli::render_table(&table, format)?,
            }
        }
        Command::Schemas => {
            let table = session.list_schemas().await?;
            cli::render_table(&table, format)?
        }
        Command::Tables { schema } => {
            let table = session.list_tables(&schema).await?;
            cli::render_table(&table, format)?
        }
        Command::Columns { schema } => {
            let table = session.list_columns(&schema).await?;
            cli::render_table(&table, format)?
        }
        Command::Peek { table, limit } => {
            let peeked = session.peek(&table, limit).await?;
            cli::render_table(&peeked, format)?
        }
        Command::PeekSchema { schema, limit } => {
            let peeked = session.peek_schema(&schema, limit).await?;
            cli::render_peeked(&peeked, format)?
        }
        Command::Write {
            schema,
            table,
            file,
            chunk_size,
        } => {
            let rows = cli::load_table(&file)?;
            session.write_table(&rows, &schema, &table, chunk_size).await?;
            format!("Wrote {} rows to {}.{}", rows.row_count(), schema, table)
        }
    };

    println!("{output}");
    Ok(())
}
