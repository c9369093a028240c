//! quickbase: command-line client for the QuickBase XML API
//!
//! Subcommands map one-to-one onto client operations:
//! - `query`: stream matching records as JSON lines
//! - `count`, `add`, `edit`, `delete`, `chown`: record operations
//! - `roles`, `dtm`: application metadata
//! - `export-csv`, `import-csv`, `download`, `upload`: bulk and file transfers

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Parse a `label=value` field assignment.
fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((label, value)) if !label.is_empty() => Ok((label.to_string(), value.to_string())),
        _ => Err(format!("invalid field '{}', expected label=value", s)),
    }
}

#[derive(Parser)]
#[command(name = "quickbase")]
#[command(about = "QuickBase XML API client", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: Connection,

    #[command(subcommand)]
    command: Commands,
}

/// Where and how to connect. Shared by every subcommand.
#[derive(Args)]
pub struct Connection {
    /// Service URL, e.g. https://example.quickbase.com/
    #[arg(long, global = true, env = "QUICKBASE_URL")]
    pub url: Option<String>,

    /// Account e-mail or screen name
    #[arg(long, global = true, env = "QUICKBASE_USERNAME")]
    pub username: Option<String>,

    /// Account password (prompted for when omitted)
    #[arg(long, global = true, env = "QUICKBASE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Application token
    #[arg(long, global = true, env = "QUICKBASE_APPTOKEN", hide_env_values = true)]
    pub apptoken: Option<String>,

    /// JSON file with client settings (timeouts, channel capacity, user agent)
    #[arg(long, global = true, env = "QUICKBASE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overall deadline for non-streaming calls, in seconds
    #[arg(long, global = true)]
    pub request_timeout: Option<u64>,

    /// Give up on a streamed query when nothing arrives for this many seconds
    #[arg(long, global = true)]
    pub idle_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream records as JSON lines
    Query {
        /// Table dbid
        dbid: String,

        /// Query expression, e.g. {'7'.EX.'open'}
        #[arg(long, short)]
        query: Option<String>,

        /// Period-separated field ids to return
        #[arg(long)]
        clist: Option<String>,

        /// Period-separated field ids to sort by
        #[arg(long)]
        slist: Option<String>,

        /// Response options, e.g. num-10.skp-20
        #[arg(long)]
        options: Option<String>,

        /// Key fields by id instead of label
        #[arg(long)]
        structured: bool,
    },

    /// Count matching records
    Count {
        /// Table dbid
        dbid: String,

        /// Query expression
        #[arg(long, short)]
        query: Option<String>,
    },

    /// Add a record and print its id
    Add {
        /// Table dbid
        dbid: String,

        /// Field values as label=value
        #[arg(value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Change fields of a record
    Edit {
        /// Table dbid
        dbid: String,

        /// Record id
        rid: u64,

        /// Field values as label=value
        #[arg(value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record
    Delete {
        /// Table dbid
        dbid: String,

        /// Record id
        rid: u64,
    },

    /// Change the owner of a record
    Chown {
        /// Table dbid
        dbid: String,

        /// Record id
        rid: u64,

        /// New owner (user id, e-mail or screen name)
        owner: String,
    },

    /// List users and their roles
    Roles {
        /// Application dbid
        dbid: String,
    },

    /// Show when an application and its tables last changed (no login needed)
    Dtm {
        /// Application dbid
        dbid: String,
    },

    /// Export records as CSV
    ExportCsv {
        /// Table dbid
        dbid: String,

        /// Field ids to export, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<u32>,

        /// Query expression
        #[arg(long, short)]
        query: Option<String>,

        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Import records from a CSV file
    ImportCsv {
        /// Table dbid
        dbid: String,

        /// CSV file
        file: PathBuf,

        /// Field id for each CSV column, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<u32>,

        /// The first row is a header
        #[arg(long)]
        skip_first: bool,
    },

    /// Download a file attachment
    Download {
        /// Table dbid
        dbid: String,

        /// Record id
        rid: u64,

        /// File attachment field id
        fid: u32,

        /// File version (0 is the latest)
        #[arg(long, default_value = "0")]
        version: u32,

        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Upload a file attachment
    Upload {
        /// Table dbid
        dbid: String,

        /// Record id
        rid: u64,

        /// File attachment field id
        fid: u32,

        /// File to upload
        file: PathBuf,

        /// Name to store the file under (defaults to the file's name)
        #[arg(long)]
        filename: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout carries command output, so logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "quickbase=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let connection = cli.connection;

    match cli.command {
        Commands::Query {
            dbid,
            query,
            clist,
            slist,
            options,
            structured,
        } => {
            let query = commands::build_query(query, clist, slist, options);
            commands::query(&connection, &dbid, &query, structured).await
        }

        Commands::Count { dbid, query } => {
            commands::count(&connection, &dbid, query.as_deref().unwrap_or("")).await
        }

        Commands::Add { dbid, fields } => commands::add(&connection, &dbid, fields).await,

        Commands::Edit { dbid, rid, fields } => {
            commands::edit(&connection, &dbid, rid, fields).await
        }

        Commands::Delete { dbid, rid } => commands::delete(&connection, &dbid, rid).await,

        Commands::Chown { dbid, rid, owner } => {
            commands::chown(&connection, &dbid, rid, &owner).await
        }

        Commands::Roles { dbid } => commands::roles(&connection, &dbid).await,

        Commands::Dtm { dbid } => commands::dtm(&connection, &dbid).await,

        Commands::ExportCsv {
            dbid,
            columns,
            query,
            output,
        } => {
            commands::export_csv(
                &connection,
                &dbid,
                query.as_deref().unwrap_or(""),
                &columns,
                output.as_deref(),
            )
            .await
        }

        Commands::ImportCsv {
            dbid,
            file,
            columns,
            skip_first,
        } => commands::import_csv(&connection, &dbid, &file, &columns, skip_first).await,

        Commands::Download {
            dbid,
            rid,
            fid,
            version,
            output,
        } => commands::download(&connection, &dbid, rid, fid, version, output.as_deref()).await,

        Commands::Upload {
            dbid,
            rid,
            fid,
            file,
            filename,
        } => commands::upload(&connection, &dbid, rid, fid, &file, filename).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("title=Buy milk"),
            Ok(("title".to_string(), "Buy milk".to_string()))
        );
        assert_eq!(
            parse_field("formula=a=b"),
            Ok(("formula".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_field("notes="), Ok(("notes".to_string(), String::new())));
        assert!(parse_field("no-equals").is_err());
        assert!(parse_field("=value").is_err());
    }

    #[test]
    fn test_parse_subcommand_with_global_flags() {
        let cli = Cli::try_parse_from([
            "quickbase",
            "export-csv",
            "bdb5rjd6h",
            "--columns",
            "3,6,7",
            "--url",
            "https://example.quickbase.com/",
        ])
        .unwrap();

        assert_eq!(
            cli.connection.url.as_deref(),
            Some("https://example.quickbase.com/")
        );
        match cli.command {
            Commands::ExportCsv { columns, query, .. } => {
                assert_eq!(columns, vec![3, 6, 7]);
                assert_eq!(query, None);
            }
            _ => panic!("expected export-csv"),
        }
    }
}
