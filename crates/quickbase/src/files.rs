//! Bulk and binary transfers: CSV export and import, file attachments.

use std::io;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::escape::escape;
use reqwest::Body;
use reqwest::header::CONTENT_TYPE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::client::{PIPE_CAPACITY, parse_response};
use crate::records::parse_number;
use crate::stream::{ResponseBody, body_reader};
use crate::types::{ImportSummary, Query, join_fids, validate_dbid};
use crate::wire::{self, ENVELOPE_CLOSE, ENVELOPE_OPEN, Element};
use crate::{QuickbaseClient, QuickbaseError, Ticket};

/// Source bytes per base64 chunk; a multiple of 3 so chunks concatenate
/// without padding in between.
const ENCODE_CHUNK: usize = 3 * 4096;

impl QuickbaseClient {
    /// Export matching records as CSV via `API_GenResultsTable`, sorted by
    /// record id. The returned body is read as it arrives.
    pub async fn gen_results_table(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &str,
        columns: &[u32],
    ) -> Result<ResponseBody, QuickbaseError> {
        let action = "API_GenResultsTable";
        let mut params = ticket.params();
        Query::new()
            .filter(query)
            .columns(columns.iter().copied())
            .slist("3")
            .options("csv")
            .apply(&mut params);

        let response = self
            .send_streamed(&ticket.endpoint(dbid)?, action, params)
            .await?;

        // Errors come back as an XML envelope rather than CSV.
        let is_xml = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("xml"));
        if is_xml {
            let bytes = response.bytes().await?;
            parse_response(action, &bytes)?;
            return Err(QuickbaseError::Protocol(
                "expected CSV, got an XML response".to_string(),
            ));
        }

        Ok(body_reader(response))
    }

    /// Fetch version `vid` of the file attached to field `fid` of record
    /// `rid`. Version 0 is the latest.
    pub async fn download(
        &self,
        ticket: &Ticket,
        dbid: &str,
        rid: u64,
        fid: u32,
        vid: u32,
    ) -> Result<ResponseBody, QuickbaseError> {
        validate_dbid(dbid)?;
        let mut url = ticket
            .base_url()
            .join(&format!("up/{dbid}/a/r{rid}/e{fid}/v{vid}"))?;
        url.query_pairs_mut().extend_pairs(ticket.params());

        debug!(dbid, rid, fid, vid, "downloading file attachment");
        let response = self.get(url).await?;
        Ok(body_reader(response))
    }

    /// Attach the bytes of `source` to field `fid` of record `rid` under
    /// `filename`.
    ///
    /// The file is base64-encoded into the request body while it is read, so
    /// it never has to fit in memory. A failing `source` fails the call with
    /// [`QuickbaseError::Io`].
    pub async fn upload<R>(
        &self,
        ticket: &Ticket,
        dbid: &str,
        rid: u64,
        fid: u32,
        filename: &str,
        mut source: R,
    ) -> Result<(), QuickbaseError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let action = "API_EditRecord";
        let endpoint = ticket.endpoint(dbid)?;
        let mut params = ticket.params();
        params.insert("rid".to_string(), rid.to_string());
        wire::check_params(&params)?;
        let field_open = format!("<field fid=\"{fid}\" filename=\"{}\">", escape(filename));

        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let producer = tokio::spawn(async move {
            writer.write_all(ENVELOPE_OPEN).await?;
            wire::write_params(&mut writer, &params).await?;
            writer.write_all(field_open.as_bytes()).await?;
            let size = write_base64(&mut source, &mut writer).await?;
            writer.write_all(b"</field>").await?;
            writer.write_all(ENVELOPE_CLOSE).await?;
            writer.shutdown().await?;
            Ok::<_, QuickbaseError>(size)
        });

        debug!(dbid, rid, fid, filename, "uploading file attachment");
        let sent = self
            .send_body(&endpoint, action, Body::wrap_stream(ReaderStream::new(reader)))
            .await;
        let written = producer.await.map_err(io::Error::other)?;

        let response = sent?;
        let bytes = response.bytes().await?;
        let outcome = parse_response(action, &bytes);
        // A failed source explains whatever the server made of the truncated body.
        let size = written?;
        outcome?;

        debug!(dbid, rid, fid, bytes = size, "upload complete");
        Ok(())
    }

    /// Import CSV rows via `API_ImportFromCSV`. `columns` maps CSV columns
    /// to field ids; set `skip_first` when the CSV starts with a header row.
    pub async fn import_from_csv<R>(
        &self,
        ticket: &Ticket,
        dbid: &str,
        columns: &[u32],
        mut csv: R,
        skip_first: bool,
    ) -> Result<ImportSummary, QuickbaseError>
    where
        R: AsyncRead + Unpin,
    {
        let endpoint = ticket.endpoint(dbid)?;
        // TODO: stream large imports instead of buffering the whole CSV
        let mut records_csv = String::new();
        csv.read_to_string(&mut records_csv).await?;

        let mut params = ticket.params();
        params.insert("records_csv".to_string(), records_csv);
        params.insert("skipfirst".to_string(), if skip_first { "1" } else { "0" }.to_string());
        let clist = join_fids(columns.iter().copied());
        if !clist.is_empty() {
            params.insert("clist".to_string(), clist);
        }

        let root = self.call(&endpoint, "API_ImportFromCSV", &params).await?;
        let summary = import_summary(&root)?;
        debug!(
            dbid,
            added = ?summary.records_added,
            updated = ?summary.records_updated,
            "CSV import complete"
        );
        Ok(summary)
    }
}

/// Copy `source` into `sink` as standard base64, returning the number of
/// source bytes consumed.
async fn write_base64<R, W>(source: &mut R, sink: &mut W) -> Result<u64, QuickbaseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ENCODE_CHUNK];
    let mut filled = 0;
    let mut total = 0u64;

    loop {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        total += n as u64;

        let whole = filled - filled % 3;
        if whole > 0 {
            sink.write_all(STANDARD.encode(&buf[..whole]).as_bytes()).await?;
            buf.copy_within(whole..filled, 0);
            filled -= whole;
        }
    }

    if filled > 0 {
        sink.write_all(STANDARD.encode(&buf[..filled]).as_bytes()).await?;
    }
    Ok(total)
}

fn import_summary(root: &Element) -> Result<ImportSummary, QuickbaseError> {
    let optional = |name: &str| {
        root.child(name)
            .map(|_| parse_number(root, name))
            .transpose()
    };

    let record_ids = match root.child("rids") {
        Some(rids) => rids
            .children_named("rid")
            .map(|rid| {
                let text = rid.text();
                text.trim()
                    .parse::<u64>()
                    .map_err(|_| QuickbaseError::Protocol(format!("invalid rid {text:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(ImportSummary {
        records_input: optional("num_recs_input")?,
        records_added: optional("num_recs_added")?,
        records_updated: optional("num_recs_updated")?,
        record_ids,
    })
}
