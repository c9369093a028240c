//! Core types shared by the QuickBase operations.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::token::Tag;
use crate::wire::Params;
use crate::QuickbaseError;

/// One result row: field key to field value.
///
/// Plain queries key by field label (`String`); structured queries key by
/// numeric field id (`u32`). Label-keyed rows keep only the last value when
/// two fields share a sanitized label, e.g. `foo ` and `foo*` both arrive as
/// `foo_`.
pub type Record<K = String> = HashMap<K, String>;

/// How a field element inside a `<record>` maps to a [`Record`] key.
pub trait FieldKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {
    /// Key for the field started by `tag`, or `None` when the element is
    /// not a field in this response format.
    fn from_tag(tag: &Tag) -> Result<Option<Self>, QuickbaseError>;
}

impl FieldKey for String {
    fn from_tag(tag: &Tag) -> Result<Option<Self>, QuickbaseError> {
        Ok(Some(tag.name.clone()))
    }
}

/// Structured responses wrap every value in `<f id="N">`.
impl FieldKey for u32 {
    fn from_tag(tag: &Tag) -> Result<Option<Self>, QuickbaseError> {
        if tag.name != "f" {
            return Ok(None);
        }
        let id = tag
            .attr("id")
            .ok_or_else(|| QuickbaseError::Protocol("field element without id".to_string()))?;
        id.parse()
            .map(Some)
            .map_err(|_| QuickbaseError::Protocol(format!("invalid field id {id:?}")))
    }
}

/// An authentication ticket returned by `API_Authenticate`.
///
/// Tickets are immutable; attaching an application token produces a new
/// value. Expiry is enforced by the server and surfaces as an API error
/// with code [`BAD_TICKET`](crate::codes::BAD_TICKET).
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket {
    ticket: String,
    user_id: String,
    base_url: Url,
    apptoken: Option<String>,
}

impl Ticket {
    /// Build a ticket from its parts. `base_url` is normalized to end in `/`.
    pub fn new(
        ticket: impl Into<String>,
        user_id: impl Into<String>,
        base_url: &str,
    ) -> Result<Self, QuickbaseError> {
        Ok(Self {
            ticket: ticket.into(),
            user_id: user_id.into(),
            base_url: normalize_base_url(base_url)?,
            apptoken: None,
        })
    }

    pub(crate) fn from_url(ticket: String, user_id: String, base_url: Url) -> Self {
        Self {
            ticket,
            user_id,
            base_url,
            apptoken: None,
        }
    }

    /// Attach an application token sent with every call made with this ticket.
    pub fn with_apptoken(mut self, apptoken: impl Into<String>) -> Self {
        let apptoken = apptoken.into();
        self.apptoken = (!apptoken.is_empty()).then_some(apptoken);
        self
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn apptoken(&self) -> Option<&str> {
        self.apptoken.as_deref()
    }

    /// `{base}db/{dbid}`.
    pub(crate) fn endpoint(&self, dbid: &str) -> Result<Url, QuickbaseError> {
        db_endpoint(&self.base_url, dbid)
    }

    /// `ticket` plus `apptoken` when one is attached.
    pub(crate) fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("ticket".to_string(), self.ticket.clone());
        if let Some(apptoken) = &self.apptoken {
            params.insert("apptoken".to_string(), apptoken.clone());
        }
        params
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("ticket", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("base_url", &self.base_url.as_str())
            .field("apptoken", &self.apptoken.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Parse a service URL, making sure relative joins land under it.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<Url, QuickbaseError> {
    let mut url = Url::parse(base_url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(QuickbaseError::InvalidParameter(format!(
            "base URL {base_url:?} must use http or https"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// `{base}db/{dbid}`, rejecting ids that would escape the `db/` path.
pub(crate) fn db_endpoint(base_url: &Url, dbid: &str) -> Result<Url, QuickbaseError> {
    validate_dbid(dbid)?;
    Ok(base_url.join(&format!("db/{dbid}"))?)
}

pub(crate) fn validate_dbid(dbid: &str) -> Result<(), QuickbaseError> {
    if dbid.is_empty() || !dbid.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(QuickbaseError::InvalidParameter(format!(
            "table id {dbid:?} must be non-empty and alphanumeric"
        )));
    }
    Ok(())
}

/// Parameters of `API_DoQuery` and friends.
///
/// Empty parts are omitted from the request.
///
/// ```rust
/// use quickbase::Query;
///
/// let query = Query::new()
///     .filter("{'3'.EX.'42'}")
///     .columns([3, 6])
///     .sort_by([3])
///     .options("num-100");
/// assert_eq!(query.clist.as_deref(), Some("3.6"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Query expression, e.g. `{'3'.EX.'42'}`.
    pub query: Option<String>,
    /// Period-separated field ids to return.
    pub clist: Option<String>,
    /// Period-separated field ids to sort by.
    pub slist: Option<String>,
    /// Response options, e.g. `num-10.skp-20.sortorder-D`.
    pub options: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, query: impl Into<String>) -> Self {
        self.query = non_empty(query.into());
        self
    }

    pub fn clist(mut self, clist: impl Into<String>) -> Self {
        self.clist = non_empty(clist.into());
        self
    }

    pub fn columns(self, fids: impl IntoIterator<Item = u32>) -> Self {
        let clist = join_fids(fids);
        self.clist(clist)
    }

    pub fn slist(mut self, slist: impl Into<String>) -> Self {
        self.slist = non_empty(slist.into());
        self
    }

    pub fn sort_by(self, fids: impl IntoIterator<Item = u32>) -> Self {
        let slist = join_fids(fids);
        self.slist(slist)
    }

    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = non_empty(options.into());
        self
    }

    pub(crate) fn apply(&self, params: &mut Params) {
        let parts = [
            ("query", &self.query),
            ("clist", &self.clist),
            ("slist", &self.slist),
            ("options", &self.options),
        ];
        for (key, value) in parts {
            if let Some(value) = value {
                params.insert(key.to_string(), value.clone());
            }
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Field ids joined with `.`, the separator QuickBase uses for lists.
pub(crate) fn join_fids(fids: impl IntoIterator<Item = u32>) -> String {
    fids.into_iter()
        .map(|fid| fid.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Modification times for an application or one of its tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaModification {
    /// Application or table dbid.
    pub id: String,
    /// Last schema change.
    pub schema_modified: DateTime<Utc>,
    /// Last record change.
    pub records_modified: DateTime<Utc>,
}

/// Response of `API_GetAppDTMInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDtmInfo {
    /// When the server received the request.
    pub request_time: DateTime<Utc>,
    /// Earliest time the server will accept another DTM request.
    pub next_allowed_time: DateTime<Utc>,
    pub app: SchemaModification,
    pub tables: Vec<SchemaModification>,
}

/// A user with access to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub roles: Vec<Role>,
}

/// A role granted to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: u32,
    pub name: String,
    pub access: Option<Access>,
}

/// The access level attached to a role, e.g. "Basic Access".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub id: u32,
    pub name: String,
}

/// Counts reported by `API_ImportFromCSV`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub records_input: Option<u64>,
    pub records_added: Option<u64>,
    pub records_updated: Option<u64>,
    /// Ids of added or updated records, in input order.
    pub record_ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ticket_normalizes_base_url() {
        let ticket = Ticket::new("t", "u", "https://example.quickbase.com").unwrap();
        assert_eq!(ticket.base_url().as_str(), "https://example.quickbase.com/");
        assert_eq!(
            ticket.endpoint("bdb5rjd6h").unwrap().as_str(),
            "https://example.quickbase.com/db/bdb5rjd6h"
        );
    }

    #[test]
    fn test_ticket_keeps_base_path() {
        let ticket = Ticket::new("t", "u", "http://127.0.0.1:8080/proxy").unwrap();
        assert_eq!(
            ticket.endpoint("main").unwrap().as_str(),
            "http://127.0.0.1:8080/proxy/db/main"
        );
    }

    #[test]
    fn test_ticket_rejects_non_http_schemes() {
        for base_url in ["ftp://example.quickbase.com/", "file:///etc/quickbase"] {
            assert!(matches!(
                Ticket::new("t", "u", base_url),
                Err(QuickbaseError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_endpoint_rejects_path_segments() {
        let ticket = Ticket::new("t", "u", "https://example.quickbase.com/").unwrap();
        assert!(matches!(
            ticket.endpoint("../up"),
            Err(QuickbaseError::InvalidParameter(_))
        ));
        assert!(ticket.endpoint("").is_err());
    }

    #[test]
    fn test_ticket_params_include_apptoken_only_when_set() {
        let ticket = Ticket::new("abc", "u", "https://example.com/").unwrap();
        assert_eq!(ticket.params().len(), 1);

        let ticket = ticket.with_apptoken("tok");
        let params = ticket.params();
        assert_eq!(params.get("ticket").map(String::as_str), Some("abc"));
        assert_eq!(params.get("apptoken").map(String::as_str), Some("tok"));

        assert_eq!(ticket.with_apptoken("").apptoken(), None);
    }

    #[test]
    fn test_ticket_debug_redacts_secrets() {
        let ticket = Ticket::new("secret-ticket", "u", "https://example.com/")
            .unwrap()
            .with_apptoken("secret-token");
        let debug = format!("{ticket:?}");
        assert!(!debug.contains("secret-ticket"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_query_omits_empty_parts() {
        let query = Query::new().filter("").columns([3, 6]).sort_by([3]);
        let mut params = Params::new();
        query.apply(&mut params);

        assert_eq!(params.get("clist").map(String::as_str), Some("3.6"));
        assert_eq!(params.get("slist").map(String::as_str), Some("3"));
        assert!(!params.contains_key("query"));
        assert!(!params.contains_key("options"));
    }

    #[test]
    fn test_structured_field_key() {
        let tag = Tag::new("f").with_attr("id", "6");
        assert_eq!(u32::from_tag(&tag).unwrap(), Some(6));

        let tag = Tag::new("update_id");
        assert_eq!(u32::from_tag(&tag).unwrap(), None);

        let tag = Tag::new("f").with_attr("id", "six");
        assert!(matches!(u32::from_tag(&tag), Err(QuickbaseError::Protocol(_))));
    }

    #[test]
    fn test_label_field_key() {
        let tag = Tag::new("record_id_");
        assert_eq!(String::from_tag(&tag).unwrap(), Some("record_id_".to_string()));
    }
}
