//! Streaming decoder for `API_DoQuery` responses.
//!
//! The response is read as a token stream and never built into a tree.
//! The caller's future walks the envelope until the first `<record>`; from
//! there the token cursor (and with it the HTTP body) moves into a spawned
//! producer task that extracts records one at a time and hands them to the
//! consumer through a bounded channel.
//!
//! Errors reported by the server before the first record fail the call.
//! Anything that goes wrong after that is delivered as a final
//! [`QuickbaseError::PartialStream`] item, so a cut-short stream never looks
//! like a complete one.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncBufRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::token::{Token, TokenCursor, truncated};
use crate::types::{FieldKey, Record};
use crate::wire::{ENVELOPE, parse_code};
use crate::{ClientConfig, QuickbaseError};

const RECORD: &str = "record";
const LINE_BREAK: &str = "BR";
/// Structured responses nest records as `<table><records><record>`.
const CONTAINERS: &[&str] = &["table", "records"];

/// An HTTP response body read incrementally, as returned by downloads and
/// CSV exports.
pub type ResponseBody = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

pub(crate) fn body_reader(response: reqwest::Response) -> ResponseBody {
    StreamReader::new(response.bytes_stream().map_err(io::Error::other).boxed())
}

/// Tuning for a record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Records buffered between producer and consumer.
    pub channel_capacity: usize,
    /// How long a send may wait for the consumer.
    pub stall_timeout: Duration,
    /// How long a read may wait for the next token.
    pub idle_read_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for StreamOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            channel_capacity: config.record_channel_capacity.max(1),
            stall_timeout: config.stall_timeout(),
            idle_read_timeout: Some(config.idle_read_timeout()),
        }
    }
}

/// Records of a query, produced while the response is still arriving.
///
/// Dropping the stream cancels the producer and releases the response body.
///
/// ```rust,no_run
/// # use futures::StreamExt;
/// # async fn run(client: quickbase::QuickbaseClient, ticket: quickbase::Ticket) -> Result<(), quickbase::QuickbaseError> {
/// let query = quickbase::Query::new().filter("{'7'.EX.'open'}");
/// let mut records = client.query_stream(&ticket, "bdb5rjd6h", &query).await?;
/// while let Some(record) = records.next().await {
///     let record = record?;
///     println!("{:?}", record.get("title"));
/// }
/// # Ok(())
/// # }
/// ```
pub struct RecordStream<K = String> {
    receiver: mpsc::Receiver<Result<Record<K>, QuickbaseError>>,
    /// Why the producer stopped early, yielded after the buffered records.
    outcome: Option<oneshot::Receiver<QuickbaseError>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl<K> RecordStream<K> {
    fn new(
        receiver: mpsc::Receiver<Result<Record<K>, QuickbaseError>>,
        outcome: Option<oneshot::Receiver<QuickbaseError>>,
        cancel: CancellationToken,
    ) -> Self {
        let _guard = cancel.clone().drop_guard();
        Self {
            receiver,
            outcome,
            cancel,
            _guard,
        }
    }

    /// A stream that is already finished.
    fn empty() -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self::new(receiver, None, CancellationToken::new())
    }

    /// Next record, or `None` once the stream has ended.
    pub async fn next_record(&mut self) -> Option<Result<Record<K>, QuickbaseError>> {
        match self.receiver.recv().await {
            Some(item) => Some(item),
            None => self.take_outcome(),
        }
    }

    /// The producer's closing error, once every buffered record is out. The
    /// producer settles it before closing the channel.
    fn take_outcome(&mut self) -> Option<Result<Record<K>, QuickbaseError>> {
        let mut outcome = self.outcome.take()?;
        outcome.try_recv().ok().map(Err)
    }

    /// Stop the producer. Records already buffered can still be received.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this stream when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream, failing on the first error.
    pub async fn collect_all(mut self) -> Result<Vec<Record<K>>, QuickbaseError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record().await {
            records.push(record?);
        }
        Ok(records)
    }
}

impl<K> Stream for RecordStream<K> {
    type Item = Result<Record<K>, QuickbaseError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(None) => Poll::Ready(self.take_outcome()),
            other => other,
        }
    }
}

/// Decode a query response read from `reader`.
///
/// Returns once the first record (or the end of the envelope) has been
/// reached. A server error seen before that point is returned directly.
pub async fn decode_records<K, R>(
    reader: R,
    options: &StreamOptions,
) -> Result<RecordStream<K>, QuickbaseError>
where
    K: FieldKey,
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut cursor = TokenCursor::new(reader);
    if let Some(limit) = options.idle_read_timeout {
        cursor = cursor.with_idle_timeout(limit);
    }

    let mut envelope = Envelope::new();
    match envelope.advance(&mut cursor).await? {
        EnvelopeEvent::Closed => {
            debug!("query returned no records");
            Ok(RecordStream::empty())
        }
        first @ EnvelopeEvent::Record { .. } => {
            let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let cancel = CancellationToken::new();
            let producer = Producer {
                cursor,
                envelope,
                tx,
                cancel: cancel.clone(),
                stall_timeout: options.stall_timeout,
                emitted: 0,
            };
            tokio::spawn(producer.run(first, outcome_tx));
            Ok(RecordStream::new(rx, Some(outcome_rx), cancel))
        }
    }
}

/// Position in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeState {
    /// Before the root element.
    AwaitEnvelope,
    /// Inside the envelope, between elements.
    AwaitField,
    /// A non-zero `errcode` was read; the error is raised at the next
    /// record or at the envelope close.
    ErrorPending { code: i32 },
    /// A `<record>` start tag was handed to record extraction.
    RecordActive,
    Closed,
}

/// What [`Envelope::advance`] stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeEvent {
    /// A record begins; `empty` for `<record/>`.
    Record { empty: bool },
    /// The envelope closed with a success status.
    Closed,
}

/// Envelope-level scanner. Captures the status block, skips everything
/// that is not a record, and stops at each record.
#[derive(Debug)]
struct Envelope {
    state: EnvelopeState,
    code_seen: bool,
    text: Option<String>,
    detail: Option<String>,
    /// Open `table`/`records` containers.
    depth: usize,
}

impl Envelope {
    fn new() -> Self {
        Self {
            state: EnvelopeState::AwaitEnvelope,
            code_seen: false,
            text: None,
            detail: None,
            depth: 0,
        }
    }

    async fn advance<R>(&mut self, cursor: &mut TokenCursor<R>) -> Result<EnvelopeEvent, QuickbaseError>
    where
        R: AsyncBufRead + Unpin,
    {
        match self.state {
            EnvelopeState::Closed => return Ok(EnvelopeEvent::Closed),
            EnvelopeState::AwaitEnvelope => self.open(cursor).await?,
            EnvelopeState::RecordActive => self.state = EnvelopeState::AwaitField,
            EnvelopeState::AwaitField | EnvelopeState::ErrorPending { .. } => {}
        }

        loop {
            match cursor.next().await? {
                Token::Start(tag) => match tag.name.as_str() {
                    "errcode" => {
                        let code = parse_code(&cursor.read_text().await?)?;
                        self.on_code(code);
                    }
                    "errtext" => {
                        let text = cursor.read_text().await?;
                        self.on_text(text);
                    }
                    "errdetail" => {
                        self.detail = Some(cursor.read_text().await?).filter(|d| !d.is_empty());
                    }
                    RECORD => return self.on_record(false),
                    name if CONTAINERS.contains(&name) => self.depth += 1,
                    _ => cursor.skip_element().await?,
                },
                Token::Empty(tag) => match tag.name.as_str() {
                    "errcode" => self.on_code(parse_code("")?),
                    "errtext" => self.on_text(String::new()),
                    RECORD => return self.on_record(true),
                    _ => {}
                },
                Token::End(name) => {
                    if self.depth > 0 {
                        self.depth -= 1;
                    } else if name == ENVELOPE {
                        return self.on_close();
                    } else {
                        return Err(QuickbaseError::Protocol(format!(
                            "unexpected </{name}> in envelope"
                        )));
                    }
                }
                Token::Text(_) => {}
                Token::Eof => return Err(truncated()),
            }
        }
    }

    /// Read up to and including the root start tag.
    async fn open<R>(&mut self, cursor: &mut TokenCursor<R>) -> Result<(), QuickbaseError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match cursor.next().await? {
                Token::Start(tag) if tag.name == ENVELOPE => {
                    self.state = EnvelopeState::AwaitField;
                    return Ok(());
                }
                Token::Text(text) if text.trim().is_empty() => {}
                Token::Start(tag) | Token::Empty(tag) => {
                    return Err(QuickbaseError::Protocol(format!(
                        "{ENVELOPE} expected; {} found",
                        tag.name
                    )));
                }
                Token::Eof => {
                    return Err(QuickbaseError::Protocol("empty response".to_string()));
                }
                other => {
                    return Err(QuickbaseError::Protocol(format!(
                        "{ENVELOPE} expected; {other:?} found"
                    )));
                }
            }
        }
    }

    fn on_code(&mut self, code: i32) {
        self.code_seen = true;
        self.state = if code == 0 {
            EnvelopeState::AwaitField
        } else {
            // errtext and errdetail may still follow
            EnvelopeState::ErrorPending { code }
        };
    }

    fn on_text(&mut self, text: String) {
        self.text = Some(text);
    }

    fn on_record(&mut self, empty: bool) -> Result<EnvelopeEvent, QuickbaseError> {
        self.fail_if_pending()?;
        self.state = EnvelopeState::RecordActive;
        Ok(EnvelopeEvent::Record { empty })
    }

    fn on_close(&mut self) -> Result<EnvelopeEvent, QuickbaseError> {
        self.fail_if_pending()?;
        if !self.code_seen {
            return Err(QuickbaseError::Protocol("response has no errcode".to_string()));
        }
        self.state = EnvelopeState::Closed;
        Ok(EnvelopeEvent::Closed)
    }

    fn fail_if_pending(&mut self) -> Result<(), QuickbaseError> {
        if let EnvelopeState::ErrorPending { code } = self.state {
            let text = self.text.take().unwrap_or_default();
            return Err(self.error(code, text));
        }
        Ok(())
    }

    fn error(&mut self, code: i32, text: String) -> QuickbaseError {
        self.state = EnvelopeState::Closed;
        QuickbaseError::Api {
            code,
            text,
            detail: self.detail.take(),
        }
    }
}

/// Extract one record whose `<record>` start tag was just read.
///
/// Field boundaries follow the QuickBase convention: a start tag opens a
/// field and implicitly ends the one before it, an end tag ends the current
/// field, and `<BR/>` inside a field stands for a carriage return. Fields
/// whose tag maps to no key are consumed and dropped. Later fields replace
/// earlier fields with the same key.
pub(crate) async fn extract_record<K, R>(
    cursor: &mut TokenCursor<R>,
) -> Result<Record<K>, QuickbaseError>
where
    K: FieldKey,
    R: AsyncBufRead + Unpin,
{
    let mut record = Record::<K>::new();
    let mut field: Option<(Option<K>, String)> = None;

    loop {
        match cursor.next().await? {
            Token::Start(tag) | Token::Empty(tag) if tag.name == LINE_BREAK => {
                if let Some((_, value)) = field.as_mut() {
                    value.push('\r');
                }
            }
            Token::Start(tag) => {
                commit(&mut record, field.take());
                field = Some((K::from_tag(&tag)?, String::new()));
            }
            Token::Empty(tag) => {
                commit(&mut record, field.take());
                if let Some(key) = K::from_tag(&tag)? {
                    record.insert(key, String::new());
                }
            }
            Token::Text(text) => {
                if let Some((_, value)) = field.as_mut() {
                    value.push_str(&text);
                }
            }
            Token::End(name) if name == RECORD => {
                commit(&mut record, field.take());
                return Ok(record);
            }
            Token::End(name) if name == LINE_BREAK => {}
            Token::End(_) => commit(&mut record, field.take()),
            Token::Eof => return Err(truncated()),
        }
    }
}

fn commit<K: FieldKey>(record: &mut Record<K>, field: Option<(Option<K>, String)>) {
    if let Some((Some(key), value)) = field {
        record.insert(key, value);
    }
}

/// Why the producer stopped early.
enum Halt {
    Failed(QuickbaseError),
    ConsumerGone,
    Stalled,
    Cancelled,
}

/// Owns the rest of the response once records start.
struct Producer<K, R> {
    cursor: TokenCursor<R>,
    envelope: Envelope,
    tx: mpsc::Sender<Result<Record<K>, QuickbaseError>>,
    cancel: CancellationToken,
    stall_timeout: Duration,
    emitted: usize,
}

impl<K, R> Producer<K, R>
where
    K: FieldKey,
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn run(mut self, first: EnvelopeEvent, outcome: oneshot::Sender<QuickbaseError>) {
        let closing = match self.pump(first).await {
            Ok(()) => {
                debug!(records = self.emitted, "record stream complete");
                None
            }
            Err(Halt::Failed(cause)) => {
                warn!(records = self.emitted, error = %cause, "record stream failed");
                Some(self.partial(cause))
            }
            Err(Halt::ConsumerGone) => {
                debug!(records = self.emitted, "consumer dropped the record stream");
                None
            }
            Err(Halt::Stalled) => {
                warn!(
                    records = self.emitted,
                    stall_timeout_secs = self.stall_timeout.as_secs(),
                    "consumer stalled, abandoning record stream"
                );
                Some(self.partial(QuickbaseError::Timeout("consumer stalled")))
            }
            Err(Halt::Cancelled) => {
                debug!(records = self.emitted, "record stream cancelled");
                Some(QuickbaseError::Cancelled)
            }
        };

        // Settled before the channel closes, so the consumer sees it right
        // after the last buffered record.
        if let Some(error) = closing {
            let _ = outcome.send(error);
        }
        drop(self.tx);
        drop(self.cursor);
        trace!("released response body");
    }

    fn partial(&self, cause: QuickbaseError) -> QuickbaseError {
        QuickbaseError::PartialStream {
            records_emitted: self.emitted,
            cause: Box::new(cause),
        }
    }

    async fn pump(&mut self, first: EnvelopeEvent) -> Result<(), Halt> {
        let mut next = first;
        loop {
            match next {
                EnvelopeEvent::Record { empty } => {
                    let record = if empty {
                        Record::new()
                    } else {
                        cancellable(&self.cancel, extract_record::<K, R>(&mut self.cursor)).await?
                    };
                    self.deliver(record).await?;
                }
                EnvelopeEvent::Closed => return Ok(()),
            }
            next = cancellable(&self.cancel, self.envelope.advance(&mut self.cursor)).await?;
        }
    }

    /// Send one record, waiting at most the stall timeout for the consumer.
    async fn deliver(&mut self, record: Record<K>) -> Result<(), Halt> {
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            sent = tokio::time::timeout(self.stall_timeout, self.tx.send(Ok(record))) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Halt::ConsumerGone),
                Err(_) => Err(Halt::Stalled),
            },
        };
        sent?;
        self.emitted += 1;
        trace!(records = self.emitted, "record delivered");
        Ok(())
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, QuickbaseError>>,
) -> Result<T, Halt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Halt::Cancelled),
        result = work => result.map_err(Halt::Failed),
    }
}
