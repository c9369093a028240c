//! QuickBase API client: request transport and the synchronous invoker.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, Response};
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};
use url::Url;

use crate::wire::{self, Element, Params};
use crate::{ClientConfig, QuickbaseError};

/// Header carrying the API action name.
pub const ACTION_HEADER: &str = "QUICKBASE-ACTION";

const XML_CONTENT_TYPE: &str = "application/xml";

/// Bytes buffered between a request body writer task and the HTTP client.
pub(crate) const PIPE_CAPACITY: usize = 16 * 1024;

/// Client for the QuickBase XML API.
///
/// Holds only the HTTP transport and its configuration; credentials travel
/// with each call as a [`Ticket`](crate::Ticket). Cloning is cheap and
/// clones share the connection pool.
#[derive(Debug, Clone)]
pub struct QuickbaseClient {
    http: Client,
    config: ClientConfig,
}

impl QuickbaseClient {
    /// Build a client with its own HTTP transport.
    pub fn new(config: ClientConfig) -> Result<Self, QuickbaseError> {
        config.validate()?;
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { http, config })
    }

    /// Build a client on an existing HTTP transport, e.g. one with a proxy
    /// or custom TLS roots. Timeouts from `config` are applied per request.
    pub fn with_http_client(http: Client, config: ClientConfig) -> Result<Self, QuickbaseError> {
        config.validate()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Execute one API call and return the decoded response envelope.
    ///
    /// Fails with [`QuickbaseError::Api`] when the response carries a
    /// non-zero `errcode`.
    pub async fn call(
        &self,
        endpoint: &Url,
        action: &str,
        params: &Params,
    ) -> Result<Element, QuickbaseError> {
        let body = wire::encode(params)?;
        debug!(action, endpoint = %endpoint, "calling QuickBase");

        let response = self
            .send(endpoint, action, Body::from(body), Some(self.config.request_timeout()))
            .await?;
        let bytes = response.bytes().await?;
        trace!(action, bytes = bytes.len(), "response received");

        parse_response(action, &bytes)
    }

    /// POST `params` with a body produced by a writer task while the
    /// request is in flight, returning the response as soon as its headers
    /// arrive.
    pub(crate) async fn send_streamed(
        &self,
        endpoint: &Url,
        action: &str,
        params: Params,
    ) -> Result<Response, QuickbaseError> {
        // Fail bad parameter names here rather than as a truncated body.
        wire::check_params(&params)?;

        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = wire::write_envelope(&mut writer, &params).await {
                debug!(error = %e, "request body writer stopped");
            }
        });

        debug!(action, endpoint = %endpoint, "calling QuickBase (streamed)");
        self.send_body(endpoint, action, Body::wrap_stream(ReaderStream::new(reader)))
            .await
    }

    /// POST a prepared body without an overall deadline.
    pub(crate) async fn send_body(
        &self,
        endpoint: &Url,
        action: &str,
        body: Body,
    ) -> Result<Response, QuickbaseError> {
        self.send(endpoint, action, body, None).await
    }

    /// GET `url`, returning the response once its headers arrive.
    pub(crate) async fn get(&self, url: Url) -> Result<Response, QuickbaseError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response)
    }

    async fn send(
        &self,
        endpoint: &Url,
        action: &str,
        body: Body,
        timeout: Option<Duration>,
    ) -> Result<Response, QuickbaseError> {
        let mut request = self
            .http
            .post(endpoint.clone())
            .header(ACTION_HEADER, action)
            .header(CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response)
    }
}

/// Decode a complete response and check its status.
pub(crate) fn parse_response(action: &str, bytes: &[u8]) -> Result<Element, QuickbaseError> {
    let root = wire::decode(bytes)?;
    wire::expect_envelope(&root)?;

    let status = wire::status_of(&root)?;
    if !status.is_success() {
        debug!(action, code = status.code, text = %status.text, "QuickBase reported an error");
        return Err(status.into_error());
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn client() -> QuickbaseClient {
        QuickbaseClient::new(ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_client_rejects_invalid_config() {
        let config = ClientConfig {
            record_channel_capacity: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            QuickbaseClient::new(config),
            Err(QuickbaseError::Config(_))
        ));
    }

    #[test]
    fn test_injected_transport_still_validates_config() {
        let config = ClientConfig {
            stall_timeout_secs: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            QuickbaseClient::with_http_client(Client::new(), config),
            Err(QuickbaseError::Config(_))
        ));
        assert!(QuickbaseClient::with_http_client(Client::new(), ClientConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_call_sends_action_header_and_envelope() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/db/bdb5rjd6h"))
            .and(header(ACTION_HEADER, "API_DoQueryCount"))
            .and(header("content-type", XML_CONTENT_TYPE))
            .and(body_string(
                "<qdbapi><query>{'7'.EX.'x'}</query><ticket>t</ticket></qdbapi>".replace('\'', "&apos;"),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<qdbapi><errcode>0</errcode><errtext>No error</errtext><numMatches>5</numMatches></qdbapi>",
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let endpoint = Url::parse(&format!("{}/db/bdb5rjd6h", mock_server.uri())).unwrap();
        let root = client()
            .call(
                &endpoint,
                "API_DoQueryCount",
                &params(&[("ticket", "t"), ("query", "{'7'.EX.'x'}")]),
            )
            .await
            .unwrap();

        assert_eq!(root.child_text("numMatches").as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_call_maps_errcode_to_api_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<qdbapi><errcode>4</errcode><errtext>User not authorized</errtext></qdbapi>",
            ))
            .mount(&mock_server)
            .await;

        let endpoint = Url::parse(&format!("{}/db/main", mock_server.uri())).unwrap();
        let err = client()
            .call(&endpoint, "API_GetSchema", &Params::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QuickbaseError::Api { code: 4, ref text, .. } if text == "User not authorized"
        ));
    }

    #[tokio::test]
    async fn test_call_http_failure_is_transport_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let endpoint = Url::parse(&format!("{}/db/main", mock_server.uri())).unwrap();
        let err = client()
            .call(&endpoint, "API_Authenticate", &Params::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QuickbaseError::Http(_)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_call_malformed_body_is_parse_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<qdbapi><errcode>0</qdbapi>"))
            .mount(&mock_server)
            .await;

        let endpoint = Url::parse(&format!("{}/db/main", mock_server.uri())).unwrap();
        let err = client()
            .call(&endpoint, "API_Authenticate", &Params::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QuickbaseError::Parse(_)));
    }

    #[tokio::test]
    async fn test_streamed_request_body_matches_encode() {
        let mock_server = MockServer::start().await;
        let params = params(&[("ticket", "t"), ("clist", "3.6"), ("query", "{'3'.EX.'42'}")]);
        let expected = String::from_utf8(wire::encode(&params).unwrap()).unwrap();

        Mock::given(method("POST"))
            .and(header(ACTION_HEADER, "API_DoQuery"))
            .and(body_string(expected))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let endpoint = Url::parse(&format!("{}/db/bdb5rjd6h", mock_server.uri())).unwrap();
        let response = client()
            .send_streamed(&endpoint, "API_DoQuery", params)
            .await
            .unwrap();

        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_streamed_request_rejects_bad_names_up_front() {
        let endpoint = Url::parse("http://127.0.0.1:9/db/main").unwrap();
        let err = client()
            .send_streamed(&endpoint, "API_DoQuery", params(&[("bad name", "x")]))
            .await
            .unwrap_err();

        assert!(matches!(err, QuickbaseError::InvalidParameter(_)));
    }
}
