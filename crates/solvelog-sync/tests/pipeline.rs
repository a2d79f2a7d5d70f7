use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use solvelog_core::{format_submitted_at, RecordKey};
use solvelog_storage::{MemoryFaults, MemoryStore};
use solvelog_sync::{PipelineError, RunResponse, SyncConfig, SyncPipeline};
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Row<'a> {
    submission_id: &'a str,
    problem_id: &'a str,
    accepted: bool,
    age: ChronoDuration,
}

fn ac(submission_id: &'static str, problem_id: &'static str) -> Row<'static> {
    Row {
        submission_id,
        problem_id,
        accepted: true,
        age: ChronoDuration::hours(1),
    }
}

fn status_page(username: &str, rows: &[Row<'_>]) -> String {
    let now = Utc::now().naive_utc();
    let body: String = rows
        .iter()
        .map(|row| {
            let (class, label) = if row.accepted {
                ("result-ac", "Accepted")
            } else {
                ("result-wa", "Wrong Answer")
            };
            format!(
                r#"<tr>
  <td>{sid}</td>
  <td><a href="/user/{username}">{username}</a></td>
  <td><a href="/problem/{pid}" class="problem_title">{pid}</a></td>
  <td class="result"><span class="result-text {class}">{label}</span></td>
  <td class="memory">2020KB</td>
  <td class="time">4ms</td>
  <td><a href="" title="{at}" class="real-time-update">recently</a></td>
</tr>"#,
                sid = row.submission_id,
                pid = row.problem_id,
                at = format_submitted_at(&(now - row.age)),
            )
        })
        .collect();
    format!(r#"<html><body><table id="status-table"><tbody>{body}</tbody></table></body></html>"#)
}

async fn mount_page(server: &MockServer, username: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/status"))
        .and(query_param("user_id", username))
        .respond_with(response)
        .mount(server)
        .await;
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

fn config_for(server: &MockServer) -> SyncConfig {
    let mut config = SyncConfig::new(Url::parse(&server.uri()).unwrap());
    config.http_timeout_secs = 1;
    config.http_max_retries = 0;
    config
}

fn pipeline(config: &SyncConfig, store: &Arc<MemoryStore>) -> SyncPipeline {
    SyncPipeline::new(config, store.clone(), store.clone()).unwrap()
}

async fn invoke(pipeline: &SyncPipeline) -> RunResponse {
    RunResponse::from_outcome(&pipeline.run_once().await)
}

#[tokio::test]
async fn unreachable_user_is_skipped_and_reachable_user_persists() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", html(status_page("alice", &[ac("101", "1000")]))).await;
    mount_page(
        &server,
        "bob",
        ResponseTemplate::new(200).set_delay(Duration::from_secs(3)),
    )
    .await;

    let store = Arc::new(MemoryStore::with_users(["alice", "bob"]));
    let response = invoke(&pipeline(&config_for(&server), &store)).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "Successfully processed 1 submissions");

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), RecordKey::new("alice", "1000"));
    assert_eq!(records[0].submission_id, "101");
    assert_eq!(records[0].problem_url, format!("{}/problem/1000", server.uri()));
}

#[tokio::test]
async fn server_error_for_one_user_does_not_affect_others() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", html(status_page("alice", &[ac("11", "1000")]))).await;
    mount_page(&server, "bob", ResponseTemplate::new(500)).await;
    mount_page(
        &server,
        "carol",
        html(status_page("carol", &[ac("31", "2557"), ac("32", "1001")])),
    )
    .await;

    let store = Arc::new(MemoryStore::with_users(["alice", "bob", "carol"]));
    let summary = pipeline(&config_for(&server), &store).run_once().await.unwrap();

    assert_eq!(summary.tracked_users, 3);
    assert_eq!(summary.failed_users, 1);
    assert_eq!(summary.persisted, 3);
    let users: HashSet<String> = store.records().await.into_iter().map(|r| r.username).collect();
    assert_eq!(users, HashSet::from(["alice".to_string(), "carol".to_string()]));
}

#[tokio::test]
async fn second_run_over_unchanged_pages_persists_nothing() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "alice",
        html(status_page("alice", &[ac("11", "1000"), ac("12", "1001")])),
    )
    .await;

    let store = Arc::new(MemoryStore::with_users(["alice"]));
    let pipeline = pipeline(&config_for(&server), &store);

    assert_eq!(invoke(&pipeline).await.body, "Successfully processed 2 submissions");
    let after_first = store.records().await;

    assert_eq!(invoke(&pipeline).await.body, "Successfully processed 0 submissions");
    assert_eq!(store.records().await, after_first);
}

#[tokio::test]
async fn problem_accepted_twice_on_one_page_is_stored_once() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "alice",
        html(status_page(
            "alice",
            &[
                ac("20", "1000"),
                Row {
                    submission_id: "19",
                    problem_id: "1000",
                    accepted: true,
                    age: ChronoDuration::hours(2),
                },
                Row {
                    submission_id: "18",
                    problem_id: "1002",
                    accepted: false,
                    age: ChronoDuration::hours(3),
                },
                Row {
                    submission_id: "17",
                    problem_id: "1008",
                    accepted: true,
                    age: ChronoDuration::hours(30),
                },
            ],
        )),
    )
    .await;

    let store = Arc::new(MemoryStore::with_users(["alice"]));
    let response = invoke(&pipeline(&config_for(&server), &store)).await;

    assert_eq!(response.body, "Successfully processed 1 submissions");
    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].submission_id, "20");
}

#[tokio::test]
async fn directory_failure_is_a_failed_invocation() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::with_users(["alice"]));
    store
        .set_faults(MemoryFaults {
            directory_unavailable: true,
            ..MemoryFaults::default()
        })
        .await;

    let outcome = pipeline(&config_for(&server), &store).run_once().await;
    assert!(matches!(outcome, Err(PipelineError::DirectoryRead(_))));

    let response = RunResponse::from_outcome(&outcome);
    assert_eq!(response.status_code, 500);
    assert!(response.body.starts_with("Scrap failed"));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn empty_directory_processes_zero() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());

    let response = invoke(&pipeline(&config_for(&server), &store)).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "Successfully processed 0 submissions");
}

#[tokio::test]
async fn rejected_item_is_excluded_from_the_count() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "alice",
        html(status_page("alice", &[ac("11", "1000"), ac("12", "1001")])),
    )
    .await;

    let store = Arc::new(MemoryStore::with_users(["alice"]));
    store
        .set_faults(MemoryFaults {
            rejected_writes: HashSet::from([RecordKey::new("alice", "1001")]),
            ..MemoryFaults::default()
        })
        .await;

    let summary = pipeline(&config_for(&server), &store).run_once().await.unwrap();
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.persist_failed, 1);
    assert_eq!(RunResponse::from_outcome(&Ok(summary)).body, "Successfully processed 1 submissions");
}

#[tokio::test]
async fn lookup_outage_fails_open_by_default() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", html(status_page("alice", &[ac("11", "1000")]))).await;

    let store = Arc::new(MemoryStore::with_users(["alice"]));
    store
        .set_faults(MemoryFaults {
            lookups_unavailable: true,
            ..MemoryFaults::default()
        })
        .await;

    let response = invoke(&pipeline(&config_for(&server), &store)).await;
    assert_eq!(response.body, "Successfully processed 1 submissions");
}

#[tokio::test]
async fn in_flight_fetches_never_exceed_the_limit() {
    let server = MockServer::start().await;
    let users: Vec<String> = (0..6).map(|i| format!("user{i}")).collect();
    for user in &users {
        mount_page(
            &server,
            user,
            html(status_page(user, &[ac("1", "1000")])).set_delay(Duration::from_millis(200)),
        )
        .await;
    }

    let store = Arc::new(MemoryStore::with_users(users.clone()));
    let mut config = config_for(&server);
    config.concurrency_limit = 2;

    let started = Instant::now();
    let summary = pipeline(&config, &store).run_once().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.persisted, 6);
    // Six 200ms pages through two permits take at least three rounds.
    assert!(elapsed >= Duration::from_millis(550), "finished in {elapsed:?}");
}

#[tokio::test]
async fn users_are_fetched_concurrently_under_the_default_limit() {
    let server = MockServer::start().await;
    let users: Vec<String> = (0..6).map(|i| format!("user{i}")).collect();
    for user in &users {
        mount_page(
            &server,
            user,
            html(status_page(user, &[ac("1", "1000")])).set_delay(Duration::from_millis(300)),
        )
        .await;
    }

    let store = Arc::new(MemoryStore::with_users(users.clone()));
    let started = Instant::now();
    let summary = pipeline(&config_for(&server), &store).run_once().await.unwrap();

    assert_eq!(summary.persisted, 6);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn repeated_directory_entries_fetch_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .and(query_param("user_id", "alice"))
        .respond_with(html(status_page("alice", &[ac("11", "1000")])))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::with_users(["alice", "alice", " alice "]));
    let summary = pipeline(&config_for(&server), &store).run_once().await.unwrap();
    assert_eq!(summary.tracked_users, 1);
    assert_eq!(summary.persisted, 1);
}
