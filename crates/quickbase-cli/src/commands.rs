//! Subcommand implementations.

use std::io::Write;
use std::path::Path;

use futures::StreamExt;
use miette::{IntoDiagnostic, Result};
use quickbase::{ClientConfig, Query, QuickbaseClient, Record, RecordStream, Ticket};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

use crate::Connection;

/// Load settings from `--config` and apply command-line overrides.
fn client_config(connection: &Connection) -> Result<ClientConfig> {
    let mut config = match &connection.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).into_diagnostic()?;
            serde_json::from_str(&text).into_diagnostic()?
        }
        None => ClientConfig::default(),
    };

    if let Some(secs) = connection.request_timeout {
        config.request_timeout_secs = secs;
    }
    if let Some(secs) = connection.idle_timeout {
        config.idle_read_timeout_secs = secs;
    }
    config.validate().map_err(|e| miette::miette!("{}", e))?;
    Ok(config)
}

fn client(connection: &Connection) -> Result<QuickbaseClient> {
    QuickbaseClient::new(client_config(connection)?)
        .map_err(|e| miette::miette!("failed to create QuickBase client: {}", e))
}

fn base_url(connection: &Connection) -> Result<&str> {
    connection
        .url
        .as_deref()
        .ok_or_else(|| miette::miette!("--url (or QUICKBASE_URL) is required"))
}

fn password(connection: &Connection) -> Result<String> {
    if let Some(password) = &connection.password {
        return Ok(password.clone());
    }

    eprint!("Password: ");
    rpassword::read_password().map_err(|e| miette::miette!("failed to read password: {}", e))
}

/// Build a client and sign in.
async fn login(connection: &Connection) -> Result<(QuickbaseClient, Ticket)> {
    let client = client(connection)?;
    let url = base_url(connection)?;
    let username = connection
        .username
        .as_deref()
        .ok_or_else(|| miette::miette!("--username (or QUICKBASE_USERNAME) is required"))?;
    let password = password(connection)?;

    let mut ticket = client
        .authenticate(url, username, &password)
        .await
        .map_err(|e| miette::miette!("authentication failed: {}", e))?;
    if let Some(apptoken) = &connection.apptoken {
        ticket = ticket.with_apptoken(apptoken.clone());
    }

    info!(user_id = %ticket.user_id(), "signed in");
    Ok((client, ticket))
}

pub fn build_query(
    query: Option<String>,
    clist: Option<String>,
    slist: Option<String>,
    options: Option<String>,
) -> Query {
    let mut built = Query::new();
    if let Some(query) = query {
        built = built.filter(query);
    }
    if let Some(clist) = clist {
        built = built.clist(clist);
    }
    if let Some(slist) = slist {
        built = built.slist(slist);
    }
    if let Some(options) = options {
        built = built.options(options);
    }
    built
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{}", json);
    Ok(())
}

pub async fn query(connection: &Connection, dbid: &str, query: &Query, structured: bool) -> Result<()> {
    let (client, ticket) = login(connection).await?;

    let written = if structured {
        let stream = client
            .structured_query_stream(&ticket, dbid, query)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        write_json_lines(stream).await?
    } else {
        let stream = client
            .query_stream(&ticket, dbid, query)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        write_json_lines(stream).await?
    };

    info!(records = written, "query finished");
    Ok(())
}

/// Print each record as one JSON object per line until the stream ends or
/// Ctrl-C cancels it.
async fn write_json_lines<K>(mut stream: RecordStream<K>) -> Result<usize>
where
    K: quickbase::FieldKey + ToString,
{
    let token = stream.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling query");
            token.cancel();
        }
    });

    let stdout = std::io::stdout();
    let mut written = 0;
    let mut outcome = Ok(());
    while let Some(record) = stream.next().await {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                outcome = Err(miette::miette!("{}", e));
                break;
            }
        };
        let line = record_json(&record);
        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", line) {
            // Closed pipe, e.g. `| head`: stop quietly.
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                break;
            }
            outcome = Err(e).into_diagnostic();
            break;
        }
        written += 1;
    }

    interrupt.abort();
    outcome.map(|()| written)
}

fn record_json<K: ToString>(record: &Record<K>) -> Value {
    let fields = record
        .iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.clone())))
        .collect();
    Value::Object(fields)
}

pub async fn count(connection: &Connection, dbid: &str, query: &str) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    let count = client
        .do_query_count(&ticket, dbid, query)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{}", count);
    Ok(())
}

pub async fn add(connection: &Connection, dbid: &str, fields: Vec<(String, String)>) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    let rid = client
        .add_record(&ticket, dbid, fields)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{}", rid);
    Ok(())
}

pub async fn edit(
    connection: &Connection,
    dbid: &str,
    rid: u64,
    fields: Vec<(String, String)>,
) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    client
        .edit_record(&ticket, dbid, rid, fields)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(rid, "record updated");
    Ok(())
}

pub async fn delete(connection: &Connection, dbid: &str, rid: u64) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    client
        .delete_record(&ticket, dbid, rid)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(rid, "record deleted");
    Ok(())
}

pub async fn chown(connection: &Connection, dbid: &str, rid: u64, owner: &str) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    client
        .change_record_owner(&ticket, dbid, rid, owner)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(rid, owner, "record owner changed");
    Ok(())
}

pub async fn roles(connection: &Connection, dbid: &str) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    let users = client
        .user_roles(&ticket, dbid)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&users)
}

pub async fn dtm(connection: &Connection, dbid: &str) -> Result<()> {
    let client = client(connection)?;
    let info = client
        .get_app_dtm_info(base_url(connection)?, dbid)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&info)
}

pub async fn export_csv(
    connection: &Connection,
    dbid: &str,
    query: &str,
    columns: &[u32],
    output: Option<&Path>,
) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    let body = client
        .gen_results_table(&ticket, dbid, query, columns)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let bytes = copy_out(body, output).await?;
    info!(bytes, "CSV export written");
    Ok(())
}

pub async fn import_csv(
    connection: &Connection,
    dbid: &str,
    file: &Path,
    columns: &[u32],
    skip_first: bool,
) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    let csv = tokio::fs::File::open(file).await.into_diagnostic()?;
    let summary = client
        .import_from_csv(&ticket, dbid, columns, csv, skip_first)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&summary)
}

pub async fn download(
    connection: &Connection,
    dbid: &str,
    rid: u64,
    fid: u32,
    version: u32,
    output: Option<&Path>,
) -> Result<()> {
    let (client, ticket) = login(connection).await?;
    let body = client
        .download(&ticket, dbid, rid, fid, version)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let bytes = copy_out(body, output).await?;
    info!(rid, fid, bytes, "file downloaded");
    Ok(())
}

pub async fn upload(
    connection: &Connection,
    dbid: &str,
    rid: u64,
    fid: u32,
    file: &Path,
    filename: Option<String>,
) -> Result<()> {
    let filename = match filename {
        Some(name) => name,
        None => file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| miette::miette!("cannot derive a file name from {}", file.display()))?,
    };

    let (client, ticket) = login(connection).await?;
    let source = tokio::fs::File::open(file).await.into_diagnostic()?;
    client
        .upload(&ticket, dbid, rid, fid, &filename, source)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(rid, fid, filename = %filename, "file uploaded");
    Ok(())
}

/// Copy a response body to `output`, or stdout when none is given.
async fn copy_out<R>(mut body: R, output: Option<&Path>) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let bytes = match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await.into_diagnostic()?;
            let bytes = tokio::io::copy(&mut body, &mut file).await.into_diagnostic()?;
            file.flush().await.into_diagnostic()?;
            bytes
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let bytes = tokio::io::copy(&mut body, &mut stdout).await.into_diagnostic()?;
            stdout.flush().await.into_diagnostic()?;
            bytes
        }
    };
    Ok(bytes)
}
