use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use strategos_engine::strategos::{HttpStrategosClient, StrategosClient, WorkerFilter};
use strategos_engine::types::WorkerTemplate;

#[tokio::test]
async fn spawn_posts_task_and_returns_worker_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/workers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"worker_id": "w-1"})))
        .mount(&server)
        .await;

    let client = HttpStrategosClient::new(server.uri());
    let worker_id = client
        .spawn(WorkerTemplate::Research, "label", Path::new("/tmp/project"), None, "investigate")
        .await
        .unwrap();

    assert_eq!(worker_id, "w-1");
}

#[tokio::test]
async fn spawn_retries_on_server_error_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/workers"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/workers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"worker_id": "w-2"})))
        .mount(&server)
        .await;

    let client = HttpStrategosClient::new(server.uri());
    let worker_id = client
        .spawn(WorkerTemplate::Impl, "label", Path::new("/tmp/project"), None, "build")
        .await
        .unwrap();

    assert_eq!(worker_id, "w-2");
}

#[tokio::test]
async fn wait_for_done_polls_until_status_flips() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/workers/w-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": false})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workers/w-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true, "output": "result"})))
        .mount(&server)
        .await;

    let client = HttpStrategosClient::new(server.uri());
    let cancel = CancellationToken::new();
    let outcome = client
        .wait_for_done("w-3", Duration::from_secs(5), &cancel)
        .await
        .unwrap();

    assert!(outcome.ok);
    assert_eq!(outcome.output.as_deref(), Some("result"));
}

#[tokio::test]
async fn delete_treats_404_as_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/workers/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = HttpStrategosClient::new(server.uri());
    client.delete("gone").await.unwrap();
}

#[tokio::test]
async fn list_workers_forwards_project_filter_as_query_param() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/workers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["w-4", "w-5"])))
        .mount(&server)
        .await;

    let client = HttpStrategosClient::new(server.uri());
    let filter = WorkerFilter { project_id: Some("p1".to_string()) };
    let ids = client.list_workers(Some(&filter)).await.unwrap();

    assert_eq!(ids, vec!["w-4".to_string(), "w-5".to_string()]);
}
