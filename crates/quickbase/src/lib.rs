//! Client for the QuickBase XML-over-HTTP API.
//!
//! Every call POSTs a `<qdbapi>` envelope to `{base}db/{dbid}` with the action
//! named in the `QUICKBASE-ACTION` header, and gets a `<qdbapi>` envelope
//! back carrying `errcode`/`errtext` plus the action's payload.
//!
//! ## Features
//!
//! - **Invoker**: [`QuickbaseClient::call`] for any action, decoded into a
//!   small element tree
//! - **Streaming queries**: [`QuickbaseClient::query_stream`] yields records
//!   while the response is still arriving, with backpressure, cancellation
//!   and stall deadlines
//! - **Operations**: authentication, record CRUD, counts, user roles,
//!   modification times, CSV export/import, file download/upload
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use quickbase::{ClientConfig, Query, QuickbaseClient};
//!
//! # async fn run() -> Result<(), quickbase::QuickbaseError> {
//! let client = QuickbaseClient::new(ClientConfig::default())?;
//! let ticket = client
//!     .authenticate("https://example.quickbase.com/", "ada@example.com", "hunter2")
//!     .await?;
//!
//! let query = Query::new().filter("{'3'.EX.'42'}").columns([3, 6]).sort_by([3]);
//! let mut records = client.structured_query_stream(&ticket, "bdb5rjd6h", &query).await?;
//! while let Some(record) = records.next().await {
//!     let record = record?;
//!     println!("{:?}", record.get(&6));
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod client;
mod config;
mod error;
mod files;
mod records;
mod schema;
pub mod stream;
pub mod token;
mod types;
pub mod wire;

pub use client::{ACTION_HEADER, QuickbaseClient};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{QuickbaseError, Result, codes};
pub use stream::{RecordStream, ResponseBody, StreamOptions, decode_records};
pub use token::Tag;
pub use types::{
    Access, AppDtmInfo, FieldKey, ImportSummary, Query, Record, Role, SchemaModification, Ticket,
    User,
};
