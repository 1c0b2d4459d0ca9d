//! Sidecar back-end against a mocked sidecar HTTP API.

use std::sync::Arc;

use base64::Engine;
use render_probe::browser::sidecar::SidecarDriver;
use render_probe::browser::{BrowserDriver, ConsoleCursor, LaunchSettings, CONSOLE_CAPTURE_SCRIPT};
use render_probe::error::ErrorKind;
use render_probe::recorder::ConsoleLevel;
use render_probe::waiter::ReadyBy;
use render_probe::{Outcome, SessionConfig, SessionRunner, SessionSpec};
use wiremock::matchers::{body_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_session(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "session_id": "s1" })),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/init_script"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .mount(server)
        .await;
}

async fn mount_teardown(server: &MockServer) {
    Mock::given(method("DELETE"))
        .and(path("/sessions/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_screenshot(server: &MockServer) {
    let data = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG sidecar");
    Mock::given(method("GET"))
        .and(path("/sessions/s1/screenshot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn launch_sends_settings_and_pages_read_console() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .and(body_json(serde_json::json!({
            "headless": true,
            "args": ["--use-gl=swiftshader", "--enable-unsafe-webgpu"],
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "session_id": "s1" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/init_script"))
        .and(body_json(serde_json::json!({ "script": CONSOLE_CAPTURE_SCRIPT })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/eval"))
        .and(body_string_contains("__renderProbeConsole"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": r#"{"epoch":"e1","first":0,"entries":[{"level":"warning","text":"slow frame"}]}"#
        })))
        .mount(&server)
        .await;
    // a read positioned past the first entry acknowledges it
    Mock::given(method("POST"))
        .and(path("/sessions/s1/eval"))
        .and(body_string_contains("const next = 1;"))
        .and(body_string_contains(r#"b.epoch === \"e1\""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": r#"{"epoch":"e1","first":1,"entries":[]}"#
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_teardown(&server).await;

    let driver = SidecarDriver::new(&server.uri()).unwrap();
    let settings = LaunchSettings {
        headless: true,
        args: vec![
            "--use-gl=swiftshader".into(),
            "--enable-unsafe-webgpu".into(),
        ],
    };
    let mut browser = driver.launch(&settings).await.unwrap();
    let page = browser.new_page().await.unwrap();
    assert!(browser.new_page().await.is_err(), "one page per session");

    page.install_console_capture().await.unwrap();
    let batch = page.read_console(&ConsoleCursor::default()).await.unwrap();
    assert_eq!(batch.epoch.as_deref(), Some("e1"));
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].level, ConsoleLevel::Warn);
    assert_eq!(batch.entries[0].text, "slow frame");

    let cursor = ConsoleCursor {
        epoch: Some("e1".into()),
        next: 1,
    };
    let rest = page.read_console(&cursor).await.unwrap();
    assert_eq!(rest.first, 1);
    assert!(rest.entries.is_empty());

    drop(page);
    browser.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_sidecar_fails_launch() {
    // nothing listens on the discard port
    let driver = SidecarDriver::new("http://127.0.0.1:9").unwrap();
    let err = match driver.launch(&LaunchSettings::default()).await {
        Ok(_) => panic!("launch should fail"),
        Err(e) => e,
    };
    assert!(format!("{err:#}").contains("not reachable"));
}

#[tokio::test]
async fn full_run_through_sidecar_passes_on_selector() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    mount_screenshot(&server).await;
    mount_teardown(&server).await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/goto"))
        .and(body_json(serde_json::json!({ "url": "http://localhost:4173/" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true, "status": 200 })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/eval"))
        .and(body_string_contains("querySelector"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "result": true })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/eval"))
        .and(body_string_contains("__renderProbeConsole"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {
                "epoch": "e1",
                "first": 0,
                "entries": [{ "level": "log", "text": "Scene initialised" }]
            }
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut spec = SessionSpec::new("http://localhost:4173/");
    spec.ready_selector = Some("#glCanvas".into());
    spec.timeout_ms = 2_000;
    spec.poll_interval_ms = 20;
    spec.screenshot_path = dir.path().join("preview.png");
    let config = SessionConfig::from_spec(spec).unwrap();

    let driver = SidecarDriver::new(&server.uri()).unwrap();
    let verdict = SessionRunner::new(Arc::new(driver)).run(&config).await;

    assert_eq!(verdict.outcome, Outcome::Pass);
    assert_eq!(verdict.ready_by, Some(ReadyBy::Selector));
    // the sidecar keeps answering with the same unacknowledged entry; it is
    // recorded once
    assert_eq!(verdict.console_entries, 1);
    let shot = std::fs::read(verdict.screenshot_path.unwrap()).unwrap();
    assert_eq!(shot, b"\x89PNG sidecar");
}

#[tokio::test]
async fn sidecar_navigation_failure_is_error() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    mount_screenshot(&server).await;
    mount_teardown(&server).await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/goto"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false,
            "error": "net::ERR_CONNECTION_REFUSED"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/eval"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "result": r#"{"entries":[]}"# })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut spec = SessionSpec::new("http://localhost:9999/");
    spec.ready_selector = Some("#glCanvas".into());
    spec.screenshot_path = dir.path().join("down.png");
    let config = SessionConfig::from_spec(spec).unwrap();

    let driver = SidecarDriver::new(&server.uri()).unwrap();
    let verdict = SessionRunner::new(Arc::new(driver)).run(&config).await;

    assert_eq!(verdict.outcome, Outcome::Error);
    let err = verdict.error.unwrap();
    assert_eq!(err.kind, ErrorKind::Navigation);
    assert!(err.message.contains("ERR_CONNECTION_REFUSED"));
    // screenshot is still attempted and, here, succeeds
    assert!(verdict.screenshot_path.is_some());
}
