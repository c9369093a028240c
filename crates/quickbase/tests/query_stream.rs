//! End-to-end tests for streamed queries against a mocked QuickBase server.

use std::io;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use quickbase::{
    ClientConfig, Query, QuickbaseClient, QuickbaseError, Record, StreamOptions, Ticket, codes,
    decode_records,
};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TABLE: &str = "bdb5rjd6h";

// Helper to build a plain DoQuery response with one `n` field per record
fn numbered_records(count: usize) -> String {
    let records: String = (1..=count)
        .map(|n| format!("<record><n>{n}</n><title>task {n}</title></record>"))
        .collect();
    format!(
        "<?xml version=\"1.0\" ?><qdbapi><action>API_DoQuery</action>\
         <errcode>0</errcode><errtext>No error</errtext>{records}</qdbapi>"
    )
}

async fn mount_query(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path(format!("/db/{TABLE}")))
        .and(header("QUICKBASE-ACTION", "API_DoQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

fn setup(server: &MockServer) -> (QuickbaseClient, Ticket) {
    let client = QuickbaseClient::new(ClientConfig::default()).unwrap();
    let ticket = Ticket::new("tkt", "112245.efy7", &server.uri()).unwrap();
    (client, ticket)
}

async fn drain(client: &QuickbaseClient, ticket: &Ticket, query: &Query) -> Vec<Record> {
    client
        .query_stream(ticket, TABLE, query)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap()
}

#[tokio::test]
async fn streams_every_record_in_server_order() {
    let server = MockServer::start().await;
    mount_query(&server, numbered_records(250)).await;

    let (client, ticket) = setup(&server);
    let mut stream = client
        .query_stream(&ticket, TABLE, &Query::new())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(record) = stream.next().await {
        let record = record.unwrap();
        seen.push(record["n"].parse::<usize>().unwrap());
    }

    assert_eq!(seen, (1..=250).collect::<Vec<_>>());
}

#[tokio::test]
async fn server_error_before_records_fails_the_call() {
    let server = MockServer::start().await;
    mount_query(
        &server,
        "<qdbapi><action>API_DoQuery</action><errcode>31</errcode>\
         <errtext>No such field</errtext><errdetail>clist mentions field 99</errdetail></qdbapi>"
            .to_string(),
    )
    .await;

    let (client, ticket) = setup(&server);
    let err = client
        .query_stream(&ticket, TABLE, &Query::new().clist("3.99"))
        .await
        .err()
        .unwrap();

    match err {
        QuickbaseError::Api { code, text, detail } => {
            assert_eq!(code, codes::NO_SUCH_FIELD);
            assert_eq!(text, "No such field");
            assert_eq!(detail.as_deref(), Some("clist mentions field 99"));
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn structured_query_keys_fields_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/db/{TABLE}")))
        .and(body_string_contains("<clist>3.6</clist>"))
        .and(body_string_contains("<slist>3</slist>"))
        .and(body_string_contains("<query>{&apos;3&apos;.EX.&apos;42&apos;}</query>"))
        .and(body_string_contains("<fmt>structured</fmt>"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<qdbapi><action>API_DoQuery</action><errcode>0</errcode><errtext>No error</errtext>
            <table>
              <original><table_id>bdb5rjd6h</table_id></original>
              <records>
                <record><f id="3">42</f><f id="6">first line<BR/>second line</f><update_id>1</update_id></record>
                <record><f id="3">42</f><f id="6">again</f><update_id>2</update_id></record>
              </records>
            </table></qdbapi>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let (client, ticket) = setup(&server);
    let query = Query::new().filter("{'3'.EX.'42'}").columns([3, 6]).sort_by([3]);
    let records = client
        .structured_query_stream(&ticket, TABLE, &query)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    for record in &records {
        let mut keys: Vec<u32> = record.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![3, 6]);
        assert_eq!(record[&3], "42");
    }
    assert_eq!(records[0][&6], "first line\rsecond line");
}

#[tokio::test]
async fn repeating_a_query_yields_the_same_records() {
    let server = MockServer::start().await;
    mount_query(&server, numbered_records(20)).await;

    let (client, ticket) = setup(&server);
    let query = Query::new().filter("{'7'.EX.'open'}");

    let first = drain(&client, &ticket, &query).await;
    let second = drain(&client, &ticket, &query).await;

    assert_eq!(first.len(), 20);
    assert_eq!(first, second);
}

#[tokio::test]
async fn invalid_credentials_are_an_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/main"))
        .and(header("QUICKBASE-ACTION", "API_Authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<qdbapi><action>API_Authenticate</action><errcode>20</errcode>\
             <errtext>Unknown username/password</errtext></qdbapi>",
        ))
        .mount(&server)
        .await;

    let client = QuickbaseClient::new(ClientConfig::default()).unwrap();
    let err = client
        .authenticate(&server.uri(), "ada@example.com", "wrong")
        .await
        .unwrap_err();

    assert_eq!(err.api_code(), Some(codes::INVALID_CREDENTIALS));
    assert!(err.is_invalid_credentials());
    assert!(!err.is_transport());
}

#[tokio::test]
async fn body_cut_short_surfaces_partial_stream() {
    let server = MockServer::start().await;
    // Three complete records, then the body stops inside the fourth.
    let full = numbered_records(5);
    let cut = full.find("<record><n>4</n>").unwrap() + "<record><n>4".len();
    mount_query(&server, full[..cut].to_string()).await;

    let (client, ticket) = setup(&server);
    let items: Vec<_> = client
        .query_stream(&ticket, TABLE, &Query::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 4);
    for (i, item) in items[..3].iter().enumerate() {
        assert_eq!(item.as_ref().unwrap()["n"], (i + 1).to_string());
    }
    assert!(matches!(
        items[3],
        Err(QuickbaseError::PartialStream { records_emitted: 3, .. })
    ));
}

#[tokio::test]
async fn connection_drop_after_three_of_five_records() {
    let full = numbered_records(5);
    let cut = full.find("<record><n>4</n>").unwrap();
    let (head, tail) = full.split_at(cut);

    let body = tokio_test::io::Builder::new()
        .read(head.as_bytes())
        .read(&tail.as_bytes()[..10])
        .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
        .build();

    let stream = decode_records::<String, _>(
        tokio::io::BufReader::new(body),
        &StreamOptions::default(),
    )
    .await
    .unwrap();
    let items: Vec<_> = stream.collect().await;

    assert_eq!(items.len(), 4);
    assert!(items[..3].iter().all(Result::is_ok));
    match &items[3] {
        Err(QuickbaseError::PartialStream { records_emitted, cause }) => {
            assert_eq!(*records_emitted, 3);
            assert!(matches!(**cause, QuickbaseError::Io(_)));
        }
        other => panic!("expected partial stream error, got {other:?}"),
    }
}

#[tokio::test]
async fn dropping_the_stream_early_is_clean() {
    let server = MockServer::start().await;
    mount_query(&server, numbered_records(5_000)).await;

    let config = ClientConfig::builder()
        .record_channel_capacity(4)
        .build()
        .unwrap();
    let client = QuickbaseClient::new(config).unwrap();
    let ticket = Ticket::new("tkt", "112245.efy7", &server.uri()).unwrap();

    let mut stream = client
        .query_stream(&ticket, TABLE, &Query::new())
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first["n"], "1");
    drop(stream);

    // The producer notices and releases the body; a fresh query still works.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let records = drain(&client, &ticket, &Query::new()).await;
    assert_eq!(records.len(), 5_000);
}
