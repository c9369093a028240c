//! Application metadata: users and roles, modification times.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{Access, AppDtmInfo, Role, SchemaModification, User, db_endpoint, normalize_base_url};
use crate::wire::{Element, Params};
use crate::{QuickbaseClient, QuickbaseError, Ticket};

impl QuickbaseClient {
    /// Users with access to the application `dbid`, with their roles.
    pub async fn user_roles(
        &self,
        ticket: &Ticket,
        dbid: &str,
    ) -> Result<Vec<User>, QuickbaseError> {
        let root = self
            .call(&ticket.endpoint(dbid)?, "API_UserRoles", &ticket.params())
            .await?;

        root.find_all("user").into_iter().map(parse_user).collect()
    }

    /// When the application `dbid` and its tables last changed.
    ///
    /// Needs no ticket. The server rate-limits this call; see
    /// [`AppDtmInfo::next_allowed_time`].
    pub async fn get_app_dtm_info(
        &self,
        base_url: &str,
        dbid: &str,
    ) -> Result<AppDtmInfo, QuickbaseError> {
        let endpoint = db_endpoint(&normalize_base_url(base_url)?, "main")?;
        let mut params = Params::new();
        params.insert("dbid".to_string(), dbid.to_string());

        let root = self.call(&endpoint, "API_GetAppDTMInfo", &params).await?;

        let app = root
            .find("app")
            .ok_or_else(|| QuickbaseError::Protocol("no app returned".to_string()))?;
        let tables = root
            .find("tables")
            .ok_or_else(|| QuickbaseError::Protocol("no tables returned".to_string()))?;

        let info = AppDtmInfo {
            request_time: child_time(&root, "RequestTime")?,
            next_allowed_time: child_time(&root, "RequestNextAllowedTime")?,
            app: schema_modification(app)?,
            tables: tables
                .children_named("table")
                .map(schema_modification)
                .collect::<Result<_, _>>()?,
        };
        debug!(dbid, tables = info.tables.len(), "DTM info received");
        Ok(info)
    }
}

fn parse_user(user: &Element) -> Result<User, QuickbaseError> {
    let roles = match user.child("roles") {
        Some(roles) => roles
            .children_named("role")
            .map(parse_role)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(User {
        id: required_attr(user, "id")?.to_string(),
        name: user.child_text("name").unwrap_or_default(),
        roles,
    })
}

fn parse_role(role: &Element) -> Result<Role, QuickbaseError> {
    let access = role
        .child("access")
        .map(|access| {
            Ok::<_, QuickbaseError>(Access {
                id: numeric_attr(access, "id")?,
                name: access.text(),
            })
        })
        .transpose()?;

    Ok(Role {
        id: numeric_attr(role, "id")?,
        name: role.child_text("name").unwrap_or_default(),
        access,
    })
}

fn schema_modification(element: &Element) -> Result<SchemaModification, QuickbaseError> {
    let id = required_attr(element, "id")?;
    if id.is_empty() {
        return Err(QuickbaseError::Protocol(format!("{} without an id", element.name)));
    }

    Ok(SchemaModification {
        id: id.to_string(),
        schema_modified: child_time(element, "lastModifiedTime")?,
        records_modified: child_time(element, "lastRecModTime")?,
    })
}

fn required_attr<'a>(element: &'a Element, name: &str) -> Result<&'a str, QuickbaseError> {
    element.attr(name).ok_or_else(|| {
        QuickbaseError::Protocol(format!("{} has no {name} attribute", element.name))
    })
}

fn numeric_attr(element: &Element, name: &str) -> Result<u32, QuickbaseError> {
    let value = required_attr(element, name)?;
    value.parse().map_err(|_| {
        QuickbaseError::Protocol(format!("invalid {} {name} {value:?}", element.name))
    })
}

/// A timestamp sent as milliseconds since the Unix epoch.
fn child_time(element: &Element, name: &str) -> Result<DateTime<Utc>, QuickbaseError> {
    let text = element
        .child_text(name)
        .ok_or_else(|| QuickbaseError::Protocol(format!("tag named {name} not found")))?;
    text.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| QuickbaseError::Protocol(format!("invalid {name} {text:?}")))
}
