//! Record queries and edits.

use tracing::debug;

use crate::stream::{RecordStream, StreamOptions, body_reader, decode_records};
use crate::types::{FieldKey, Query, Record};
use crate::wire::{Element, Node, Params};
use crate::{QuickbaseClient, QuickbaseError, Ticket};

const LINE_BREAK: &str = "BR";

impl QuickbaseClient {
    /// Run `API_DoQuery` and return every record keyed by field label.
    ///
    /// Two fields whose labels sanitize to the same name collide; the last
    /// one wins. Use [`do_structured_query`](Self::do_structured_query) when
    /// that matters.
    pub async fn do_query(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &Query,
    ) -> Result<Vec<Record>, QuickbaseError> {
        let root = self
            .call(&ticket.endpoint(dbid)?, "API_DoQuery", &query_params(ticket, query, false))
            .await?;

        let records = root
            .children_named("record")
            .map(label_record)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(dbid, records = records.len(), "query complete");
        Ok(records)
    }

    /// Run `API_DoQuery` with `fmt=structured`, keying fields by id.
    pub async fn do_structured_query(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &Query,
    ) -> Result<Vec<Record<u32>>, QuickbaseError> {
        let root = self
            .call(&ticket.endpoint(dbid)?, "API_DoQuery", &query_params(ticket, query, true))
            .await?;

        let records = root
            .find_all("record")
            .into_iter()
            .map(structured_record)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(dbid, records = records.len(), "structured query complete");
        Ok(records)
    }

    /// Stream `API_DoQuery` results keyed by field label.
    ///
    /// Fails only when the request cannot be made or the server reports an
    /// error before the first record; later failures arrive as a final
    /// [`QuickbaseError::PartialStream`] item.
    pub async fn query_stream(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &Query,
    ) -> Result<RecordStream, QuickbaseError> {
        self.stream_query(ticket, dbid, query, false).await
    }

    /// Stream `fmt=structured` results keyed by field id.
    pub async fn structured_query_stream(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &Query,
    ) -> Result<RecordStream<u32>, QuickbaseError> {
        self.stream_query(ticket, dbid, query, true).await
    }

    async fn stream_query<K: FieldKey>(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &Query,
        structured: bool,
    ) -> Result<RecordStream<K>, QuickbaseError> {
        let endpoint = ticket.endpoint(dbid)?;
        let params = query_params(ticket, query, structured);

        let response = self.send_streamed(&endpoint, "API_DoQuery", params).await?;
        decode_records(body_reader(response), &StreamOptions::from(self.config())).await
    }

    /// Number of records `API_DoQuery` would return for `query`.
    pub async fn do_query_count(
        &self,
        ticket: &Ticket,
        dbid: &str,
        query: &str,
    ) -> Result<u64, QuickbaseError> {
        let mut params = ticket.params();
        Query::new().filter(query).apply(&mut params);

        let root = self
            .call(&ticket.endpoint(dbid)?, "API_DoQueryCount", &params)
            .await?;
        parse_number(&root, "numMatches")
    }

    /// Add a record from `(label, value)` pairs and return its record id.
    pub async fn add_record<I, L, V>(
        &self,
        ticket: &Ticket,
        dbid: &str,
        fields: I,
    ) -> Result<u64, QuickbaseError>
    where
        I: IntoIterator<Item = (L, V)>,
        L: AsRef<str>,
        V: Into<String>,
    {
        let mut params = ticket.params();
        insert_fields(&mut params, fields);

        let root = self
            .call(&ticket.endpoint(dbid)?, "API_AddRecord", &params)
            .await?;
        let rid = parse_number(&root, "rid")?;
        debug!(dbid, rid, "record added");
        Ok(rid)
    }

    /// Overwrite the given fields of record `rid`.
    pub async fn edit_record<I, L, V>(
        &self,
        ticket: &Ticket,
        dbid: &str,
        rid: u64,
        fields: I,
    ) -> Result<(), QuickbaseError>
    where
        I: IntoIterator<Item = (L, V)>,
        L: AsRef<str>,
        V: Into<String>,
    {
        let mut params = ticket.params();
        params.insert("rid".to_string(), rid.to_string());
        insert_fields(&mut params, fields);

        self.call(&ticket.endpoint(dbid)?, "API_EditRecord", &params)
            .await?;
        Ok(())
    }

    pub async fn delete_record(
        &self,
        ticket: &Ticket,
        dbid: &str,
        rid: u64,
    ) -> Result<(), QuickbaseError> {
        let mut params = ticket.params();
        params.insert("rid".to_string(), rid.to_string());

        self.call(&ticket.endpoint(dbid)?, "API_DeleteRecord", &params)
            .await?;
        Ok(())
    }

    /// Hand record `rid` to `owner` (a user id, e-mail or screen name).
    pub async fn change_record_owner(
        &self,
        ticket: &Ticket,
        dbid: &str,
        rid: u64,
        owner: &str,
    ) -> Result<(), QuickbaseError> {
        let mut params = ticket.params();
        params.insert("rid".to_string(), rid.to_string());
        params.insert("newowner".to_string(), owner.to_string());

        self.call(&ticket.endpoint(dbid)?, "API_ChangeRecordOwner", &params)
            .await?;
        Ok(())
    }
}

fn query_params(ticket: &Ticket, query: &Query, structured: bool) -> Params {
    let mut params = ticket.params();
    query.apply(&mut params);
    if structured {
        params.insert("fmt".to_string(), "structured".to_string());
    }
    params
}

fn insert_fields<I, L, V>(params: &mut Params, fields: I)
where
    I: IntoIterator<Item = (L, V)>,
    L: AsRef<str>,
    V: Into<String>,
{
    for (label, value) in fields {
        params.insert(format!("_fnm_{}", label.as_ref()), value.into());
    }
}

/// Integer text of the first direct child `name`.
pub(crate) fn parse_number(root: &Element, name: &str) -> Result<u64, QuickbaseError> {
    let text = root
        .child_text(name)
        .ok_or_else(|| QuickbaseError::Protocol(format!("response has no {name}")))?;
    text.trim()
        .parse()
        .map_err(|_| QuickbaseError::Protocol(format!("invalid {name} {text:?}")))
}

fn label_record(record: &Element) -> Result<Record, QuickbaseError> {
    let mut fields = Record::new();
    for field in record.elements() {
        let value = field_value(field, true)?;
        fields.insert(field.name.clone(), value);
    }
    Ok(fields)
}

fn structured_record(record: &Element) -> Result<Record<u32>, QuickbaseError> {
    let mut fields = Record::new();
    for field in record.elements() {
        if let Some(id) = u32::from_tag(&field.tag())? {
            fields.insert(id, field_value(field, false)?);
        }
    }
    Ok(fields)
}

/// Text of a field with each `<BR/>` turned into `\r`, which is how
/// QuickBase separates lines internally. Other nested elements are an
/// error when `strict`, and skipped otherwise.
fn field_value(field: &Element, strict: bool) -> Result<String, QuickbaseError> {
    let mut value = String::new();
    for node in &field.children {
        match node {
            Node::Text(text) => value.push_str(text),
            Node::Element(element) if element.name == LINE_BREAK => value.push('\r'),
            Node::Element(element) if strict => {
                return Err(QuickbaseError::Protocol(format!(
                    "cannot handle tag {} within value for field {}",
                    element.name, field.name
                )));
            }
            Node::Element(_) => {}
        }
    }
    Ok(value)
}
