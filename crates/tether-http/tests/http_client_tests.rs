//! End-to-end tests through the reqwest transport against a local mock server.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_http::{
    CachePolicy, FormPost, NetworkError, Operation, RedirectPolicy, Request, Response,
    TransferProgress,
};
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(10);

fn launch(request: Request) -> (Operation, tokio::sync::oneshot::Receiver<Response>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let operation = request
        .start(move |response| {
            let _ = tx.send(response);
        })
        .expect("start");
    (operation, rx)
}

async fn fetch(request: Request) -> Response {
    let (_operation, rx) = launch(request);
    tokio::time::timeout(TIMEOUT, rx)
        .await
        .expect("operation timed out")
        .expect("completion dropped")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("Hello, World!", "text/plain; charset=utf-8"),
        )
        .mount(&server)
        .await;

    let response = fetch(Request::get(format!("{}/hello", server.uri()))).await;

    assert_eq!(response.status(), 200);
    assert!(response.is_success());
    assert!(response.error().is_none());
    assert_eq!(response.response_string(), "Hello, World!");
    assert_eq!(
        response.url().map(|u| u.path().to_string()).as_deref(),
        Some("/hello")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declared_charset_decoding() {
    let server = MockServer::start().await;
    Mock::given(path("/latin1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(vec![b'c', b'a', b'f', 0xE9], "text/plain; charset=iso-8859-1"),
        )
        .mount(&server)
        .await;

    let response = fetch(Request::get(format!("{}/latin1", server.uri()))).await;
    assert_eq!(response.response_string(), "café");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_not_found_is_http_error() {
    let server = MockServer::start().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .mount(&server)
        .await;

    let response = fetch(Request::get(format!("{}/missing", server.uri()))).await;

    assert_eq!(response.status(), 404);
    assert_eq!(response.http_error().map(|e| e.code()), Some(404));
    assert!(response.network_error().is_none());
    assert_eq!(response.data(), b"nope");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_basic_auth_challenge() {
    let server = MockServer::start().await;
    Mock::given(path("/private"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .mount(&server)
        .await;
    Mock::given(path("/private"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Basic realm="files""#),
        )
        .mount(&server)
        .await;

    let realms = Arc::new(Mutex::new(Vec::new()));
    let seen = realms.clone();
    let response = fetch(
        Request::get(format!("{}/private", server.uri())).on_auth_challenge(move |auth| {
            seen.lock().push(auth.realm().map(str::to_string));
            auth.continue_with("user", "pass");
        }),
    )
    .await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.response_string(), "secret");
    assert_eq!(*realms.lock(), vec![Some("files".to_string())]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_credentials_deliver_401() {
    let server = MockServer::start().await;
    Mock::given(path("/private"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("WWW-Authenticate", r#"Basic realm="files""#)
                .set_body_string("denied"),
        )
        .mount(&server)
        .await;

    let response = fetch(
        Request::get(format!("{}/private", server.uri())).on_auth_challenge(|auth| {
            auth.continue_with("user", "wrong");
        }),
    )
    .await;

    assert_eq!(response.http_error().map(|e| e.code()), Some(401));
    assert_eq!(response.data(), b"denied");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_without_handler() {
    let server = MockServer::start().await;
    Mock::given(path("/private"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Basic"))
        .mount(&server)
        .await;

    let response = fetch(Request::get(format!("{}/private", server.uri()))).await;
    assert!(matches!(
        response.network_error(),
        Some(NetworkError::AuthorizationRequired { .. })
    ));
    assert!(response.http_error().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_redirect_becomes_get() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/done"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/done"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .mount(&server)
        .await;

    let response = fetch(
        Request::post(format!("{}/submit", server.uri())).body_bytes("payload", Some("text/plain")),
    )
    .await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.response_string(), "done");
    assert_eq!(
        response.url().map(|u| u.path().to_string()).as_deref(),
        Some("/done")
    );

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].body.is_empty());
    assert!(requests[1].headers.get("content-type").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_redirect_is_final() {
    let server = MockServer::start().await;
    Mock::given(path("/moved"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere"))
        .mount(&server)
        .await;

    let response = fetch(
        Request::get(format!("{}/moved", server.uri())).redirect_policy(RedirectPolicy::Disabled),
    )
    .await;

    assert_eq!(response.status(), 302);
    assert_eq!(response.http_error().map(|e| e.code()), Some(302));
    assert_eq!(response.header("location"), Some("/elsewhere"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multiple_choices_is_final_with_body() {
    let server = MockServer::start().await;
    Mock::given(path("/choose"))
        .respond_with(
            ResponseTemplate::new(300)
                .insert_header("Location", "/a")
                .set_body_string("pick one"),
        )
        .mount(&server)
        .await;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    let response = fetch(
        Request::get(format!("{}/choose", server.uri()))
            .on_headers(move |response, _| sink.lock().push(response.status())),
    )
    .await;

    assert_eq!(response.status(), 300);
    assert_eq!(response.http_error().map(|e| e.code()), Some(300));
    assert_eq!(response.response_string(), "pick one");
    assert_eq!(*statuses.lock(), vec![300]);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_credentials_not_sent_to_another_port() {
    let origin = MockServer::start().await;
    let other = MockServer::start().await;
    Mock::given(path("/start"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("{}/landing", other.uri())),
        )
        .mount(&origin)
        .await;
    Mock::given(path("/landing"))
        .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
        .mount(&other)
        .await;

    let response =
        fetch(Request::get(format!("{}/start", origin.uri())).try_basic_auth("u", "p")).await;

    assert_eq!(response.response_string(), "landed");
    let first = origin.received_requests().await.unwrap();
    assert!(first[0].headers.get("authorization").is_some());
    let landed = other.received_requests().await.unwrap();
    assert_eq!(landed.len(), 1);
    assert!(landed[0].headers.get("authorization").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redirect_loop() {
    let server = MockServer::start().await;
    Mock::given(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
        .mount(&server)
        .await;

    let response =
        fetch(Request::get(format!("{}/loop", server.uri())).max_redirects(3)).await;
    assert_eq!(response.network_error(), Some(&NetworkError::TooManyRedirects));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_save_to_file() {
    let server = MockServer::start().await;
    let payload = vec![7u8; 64 * 1024];
    Mock::given(path("/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let mut response = fetch(
        Request::get(format!("{}/blob", server.uri())).save_to_file(true),
    )
    .await;

    assert!(response.data().is_empty());
    let temp = response.file_path().expect("file body").to_path_buf();
    assert_eq!(std::fs::read(&temp).unwrap(), payload);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("downloads").join("blob.bin");
    response.move_file_to(&dest, true).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert!(response.file_path().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_urlencoded_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/form"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("name=Ada+Lovelace&lang=en%26fr"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let mut form = FormPost::new();
    form.set_value("name", "Ada Lovelace").set_value("lang", "en&fr");
    let response = fetch(Request::post(format!("{}/form", server.uri())).form(form)).await;

    assert_eq!(response.status(), 201);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multipart_form_upload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "file contents").unwrap();

    let mut form = FormPost::new();
    form.set_value("title", "Notes").set_file("attachment", &file);

    let uploads: Arc<Mutex<Vec<TransferProgress>>> = Arc::default();
    let sink = uploads.clone();
    let response = fetch(
        Request::post(format!("{}/upload", server.uri()))
            .form(form)
            .on_upload_progress(move |p| sink.lock().push(p)),
    )
    .await;
    assert_eq!(response.status(), 200);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let content_type = request.headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("name=\"title\""));
    assert!(body.contains("Notes"));
    assert!(body.contains("filename=\"notes.txt\""));
    assert!(body.contains("Content-Type: text/plain"));
    assert!(body.contains("file contents"));

    let declared: u64 = request
        .headers
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, request.body.len() as u64);
    let last = uploads.lock().last().copied().expect("upload progress");
    assert_eq!(last.bytes_transferred, declared);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_headers_and_download_progress() {
    let server = MockServer::start().await;
    Mock::given(path("/large"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 256 * 1024]))
        .mount(&server)
        .await;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let progress: Arc<Mutex<Vec<TransferProgress>>> = Arc::default();
    let (s, p) = (statuses.clone(), progress.clone());
    let response = fetch(
        Request::get(format!("{}/large", server.uri()))
            .on_headers(move |response, _| s.lock().push(response.status()))
            .on_download_progress(move |update| p.lock().push(update)),
    )
    .await;

    assert_eq!(response.data().len(), 256 * 1024);
    assert_eq!(*statuses.lock(), vec![200]);

    let progress = progress.lock();
    assert!(!progress.is_empty());
    assert!(
        progress
            .windows(2)
            .all(|w| w[0].bytes_transferred < w[1].bytes_transferred)
    );
    let last = progress.last().unwrap();
    assert_eq!(last.bytes_transferred, 256 * 1024);
    assert_eq!(last.percent(), Some(100));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_in_flight() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let (operation, rx) = launch(Request::get(format!("{}/slow", server.uri())));
    tokio::time::sleep(Duration::from_millis(100)).await;
    operation.cancel();

    let response = tokio::time::timeout(TIMEOUT, rx).await.unwrap().unwrap();
    assert!(response.is_cancelled());
    assert!(response.error().is_none());
    assert!(operation.is_cancelled());
    assert!(operation.is_finished());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let response = fetch(
        Request::get(format!("{}/slow", server.uri())).timeout(Duration::from_millis(200)),
    )
    .await;
    assert_eq!(response.network_error(), Some(&NetworkError::Timeout));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_headers_sent() {
    let server = MockServer::start().await;
    Mock::given(path("/headers"))
        .and(header("user-agent", "tether-test/1.0"))
        .and(header("cache-control", "no-cache"))
        .and(header("x-trace", "abc"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let response = fetch(
        Request::get(format!("{}/headers", server.uri()))
            .user_agent("tether-test/1.0")
            .cache_policy(CachePolicy::ReloadIgnoringCache)
            .header("X-Trace", "abc"),
    )
    .await;
    assert_eq!(response.status(), 204);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_refused() {
    // Bind and drop a listener to get a port nothing listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let response = fetch(Request::get(format!("http://127.0.0.1:{port}/"))).await;
    assert!(matches!(
        response.network_error(),
        Some(NetworkError::Connection(_))
    ));
    assert_eq!(response.status(), 0);
}
