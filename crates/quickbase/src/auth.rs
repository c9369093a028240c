//! `API_Authenticate`.

use tracing::debug;

use crate::types::{db_endpoint, normalize_base_url};
use crate::wire::Params;
use crate::{QuickbaseClient, QuickbaseError, Ticket};

impl QuickbaseClient {
    /// Sign in and obtain a [`Ticket`] for `base_url`, e.g.
    /// `https://example.quickbase.com/`.
    ///
    /// Wrong credentials fail with [`QuickbaseError::Api`] carrying
    /// [`INVALID_CREDENTIALS`](crate::codes::INVALID_CREDENTIALS).
    pub async fn authenticate(
        &self,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Ticket, QuickbaseError> {
        let base_url = normalize_base_url(base_url)?;
        let endpoint = db_endpoint(&base_url, "main")?;

        let mut params = Params::new();
        params.insert("username".to_string(), username.to_string());
        params.insert("password".to_string(), password.to_string());

        let root = self.call(&endpoint, "API_Authenticate", &params).await?;

        let ticket = root
            .child_text("ticket")
            .filter(|ticket| !ticket.is_empty())
            .ok_or_else(|| QuickbaseError::Protocol("no ticket in authentication response".to_string()))?;
        let user_id = root.child_text("userid").unwrap_or_default();

        debug!(user_id = %user_id, "authenticated with QuickBase");
        Ok(Ticket::from_url(ticket, user_id, base_url))
    }
}
