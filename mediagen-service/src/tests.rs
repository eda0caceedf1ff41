use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    config::{ReferenceRowPolicy, VideoMode, DEFAULT_MAX_BODY_BYTES},
    gate::GenerationGate,
    materializer::{
        tests::{MemoryStorage, StaticFetcher},
        Materializer,
    },
    models::ModelCatalog,
    provider::{tests::ScriptedProvider, ProviderError, ProviderInvoker, RetryPolicy, META_KEY},
    recorder::{RecorderError, ReferenceRecorder},
    server::{create_router, AppState},
    types::{PendingJob, ProviderOutput, StoredArtifact},
};

const CALLBACK_URL: &str = "https://svc.test/api/generate/callback";

#[derive(Default)]
struct FakeRecorder {
    rows: Mutex<Vec<(PendingJob, StoredArtifact)>>,
    fail: bool,
}

#[async_trait]
impl ReferenceRecorder for FakeRecorder {
    async fn record(
        &self,
        job: &PendingJob,
        artifact: &StoredArtifact,
    ) -> Result<(), RecorderError> {
        if self.fail {
            return Err(RecorderError::Rejected {
                status: 409,
                message: "conflict".into(),
            });
        }
        self.rows
            .lock()
            .unwrap()
            .push((job.clone(), artifact.clone()));
        Ok(())
    }
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    storage: Arc<MemoryStorage>,
    fetcher: Arc<StaticFetcher>,
    recorder: Arc<FakeRecorder>,
    video_mode: VideoMode,
    callback_url: Option<String>,
    policy: ReferenceRowPolicy,
    max_body_bytes: usize,
}

impl Harness {
    fn new(provider: ScriptedProvider, fetcher: StaticFetcher) -> Self {
        Self {
            provider: Arc::new(provider),
            storage: Arc::new(MemoryStorage::default()),
            fetcher: Arc::new(fetcher),
            recorder: Arc::new(FakeRecorder::default()),
            video_mode: VideoMode::Webhook,
            callback_url: Some(CALLBACK_URL.to_string()),
            policy: ReferenceRowPolicy::Propagate,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    fn router(&self) -> Router {
        let retry = RetryPolicy {
            max_attempts: 2,
            min_backoff_ms: 0,
            max_backoff_ms: 1,
        };
        let state = AppState {
            invoker: ProviderInvoker::new(self.provider.clone(), retry, self.callback_url.clone()),
            materializer: Materializer::new(self.storage.clone(), self.fetcher.clone()),
            catalog: Arc::new(ModelCatalog::builtin()),
            image_model: "black-forest-labs/flux-dev".to_string(),
            video_model: "wavespeedai/wan-2.1-i2v-480p".to_string(),
            video_mode: self.video_mode,
            gate: GenerationGate::new(Some(2)),
            recorder: Some(self.recorder.clone()),
            reference_row_policy: self.policy,
            max_body_bytes: self.max_body_bytes,
        };
        create_router(state)
    }

    fn uploads(&self) -> Vec<(String, String)> {
        self.storage
            .uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(path, _, content_type)| (path.clone(), content_type.clone()))
            .collect()
    }
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn assert_uuid_path(path: &str, prefix: &str, extension: &str) {
    let stem = path
        .strip_prefix(prefix)
        .and_then(|file| file.strip_suffix(&format!(".{extension}")))
        .unwrap_or_else(|| panic!("unexpected storage path {path}"));
    assert!(Uuid::parse_str(stem).is_ok(), "{stem} is not a uuid");
}

mod generate {
    use super::*;

    #[tokio::test]
    async fn missing_fields_are_rejected_without_calling_the_provider() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        for body in [
            json!({ "userId": "u1", "characterId": "c1" }),
            json!({ "prompt": "a cat", "characterId": "c1" }),
            json!({ "prompt": "a cat", "userId": "u1" }),
            json!({ "prompt": "   ", "userId": "u1", "characterId": "c1" }),
        ] {
            let response = harness
                .router()
                .oneshot(post_json("/api/generate", &body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(json_body(response).await["code"], "INVALID_REQUEST");
        }
        assert_eq!(harness.provider.run_calls(), 0);
        assert!(harness.provider.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_a_json_bad_request() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"prompt\": "))
            .unwrap();
        let response = harness.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "INVALID_REQUEST");
        assert!(body["error"].as_str().unwrap().contains("malformed JSON"));
    }

    #[tokio::test]
    async fn oversized_body_is_a_json_413() {
        let mut harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        harness.max_body_bytes = 1024;
        let body = json!({
            "prompt": "a".repeat(4096),
            "userId": "u1",
            "characterId": "c1"
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(json_body(response).await["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(harness.provider.run_calls(), 0);
    }

    #[tokio::test]
    async fn other_methods_get_a_json_405() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/generate")
            .body(Body::empty())
            .unwrap();
        let response = harness.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(json_body(response).await["code"], "METHOD_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn preflight_allows_any_origin() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/generate")
            .header(header::ORIGIN, "https://app.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = harness.router().oneshot(request).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn image_generation_is_stored_under_user_and_character() {
        let harness = Harness::new(
            ScriptedProvider::with_runs(vec![Ok(ProviderOutput::Json(json!([
                "https://cdn.test/out-0.webp"
            ])))]),
            StaticFetcher::ok("image/webp", b"RIFF"),
        );
        let body = json!({
            "prompt": "a cat",
            "userId": "u1",
            "characterId": "c1",
            "input": { "guidance_scale": 3.5, "bogus": true, "seed": null }
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;

        let path = body["path"].as_str().unwrap();
        assert_uuid_path(path, "u1/c1/", "webp");
        assert_eq!(body["url"], format!("https://storage.test/public/{path}"));
        assert_eq!(body["type"], "image");
        assert_eq!(body["model"], "black-forest-labs/flux-dev");
        assert!(body["generationTime"].is_u64());
        assert_eq!(body["used"]["prompt"], "a cat");
        assert_eq!(body["used"]["guidance"], 3.5);
        assert!(body["used"].get("bogus").is_none());
        assert!(body["used"].get("seed").is_none());

        assert_eq!(
            harness.uploads(),
            vec![(path.to_string(), "image/webp".to_string())]
        );
    }

    #[tokio::test]
    async fn single_url_image_output_is_stored() {
        let harness = Harness::new(
            ScriptedProvider::with_runs(vec![Ok(ProviderOutput::Json(json!(
                "https://cdn.test/out.png"
            )))]),
            StaticFetcher::ok("image/png", b"\x89PNG"),
        );
        let body = json!({ "prompt": "a cat", "userId": "u1", "characterId": "c1" });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;

        let path = body["path"].as_str().unwrap();
        assert_uuid_path(path, "u1/c1/", "png");
        assert_eq!(body["type"], "image");
        assert_eq!(
            *harness.fetcher.requested.lock().unwrap(),
            vec!["https://cdn.test/out.png"]
        );
        assert_eq!(
            harness.uploads(),
            vec![(path.to_string(), "image/png".to_string())]
        );
    }

    #[tokio::test]
    async fn provider_outage_is_a_bad_gateway_after_two_attempts() {
        let harness = Harness::new(
            ScriptedProvider::with_runs(vec![
                Err(ProviderError::Transport("reset".into())),
                Err(ProviderError::Transport("reset".into())),
            ]),
            StaticFetcher::status(200),
        );
        let body = json!({ "prompt": "a cat", "userId": "u1", "characterId": "c1" });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["code"], "PROVIDER_UNAVAILABLE");
        assert_eq!(body["debug"]["attempts"], 2);
        assert_eq!(harness.provider.run_calls(), 2);
        assert!(harness.uploads().is_empty());
    }

    #[tokio::test]
    async fn unrecognized_output_reports_diagnostics() {
        let harness = Harness::new(
            ScriptedProvider::with_runs(vec![Ok(ProviderOutput::Json(json!(42)))]),
            StaticFetcher::status(200),
        );
        let body = json!({ "prompt": "a cat", "userId": "u1", "characterId": "c1" });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["code"], "UNRECOGNIZED_OUTPUT_SHAPE");
        assert_eq!(body["debug"]["observedType"], "number");
        assert_eq!(body["debug"]["matchedChecks"], json!([]));
    }

    #[tokio::test]
    async fn download_failure_carries_upstream_status() {
        let harness = Harness::new(
            ScriptedProvider::with_runs(vec![Ok(ProviderOutput::Json(json!(
                "https://cdn.test/expired.webp"
            )))]),
            StaticFetcher::status(403),
        );
        let body = json!({ "prompt": "a cat", "userId": "u1", "characterId": "c1" });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["code"], "ARTIFACT_DOWNLOAD_FAILED");
        assert_eq!(body["debug"]["upstreamStatus"], 403);
    }

    #[tokio::test]
    async fn video_requires_a_start_image() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let body = json!({
            "type": "video",
            "prompt": "waves",
            "userId": "u1",
            "characterId": "c1"
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(harness.provider.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_mode_without_callback_url_is_misconfigured() {
        let mut harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        harness.callback_url = None;
        let body = json!({
            "type": "video",
            "prompt": "waves",
            "image": "https://cdn.test/start.png",
            "userId": "u1",
            "characterId": "c1"
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["code"], "MISCONFIGURED_CALLBACK");
        assert!(harness.provider.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_video_is_stored_in_the_videos_directory() {
        let mut harness = Harness::new(
            ScriptedProvider::with_runs(vec![Ok(ProviderOutput::Json(json!(
                "https://cdn.test/out.mp4"
            )))]),
            StaticFetcher::ok("video/mp4", b"mp4"),
        );
        harness.video_mode = VideoMode::Sync;
        let body = json!({
            "type": "video",
            "prompt": "waves",
            "image": "https://cdn.test/start.png",
            "userId": "u1",
            "characterId": "c1"
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["type"], "video");
        assert_uuid_path(body["path"].as_str().unwrap(), "u1/c1/videos/", "mp4");
        assert_eq!(body["used"]["image"], "https://cdn.test/start.png");
    }
}

mod callback {
    use super::*;

    fn video_request() -> Value {
        json!({
            "type": "video",
            "prompt": "waves",
            "image": "https://cdn.test/start.png",
            "userId": "u1",
            "characterId": "c1"
        })
    }

    #[tokio::test]
    async fn webhook_video_round_trip_stores_one_artifact() {
        let harness = Harness::new(
            ScriptedProvider::default(),
            StaticFetcher::ok("video/mp4", b"mp4"),
        );

        let response = harness
            .router()
            .oneshot(post_json("/api/generate", &video_request()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = json_body(response).await;
        assert_eq!(accepted["type"], "video");
        assert_eq!(accepted["status"], "processing");
        assert_eq!(accepted["predictionId"], "job-1");
        assert!(harness.uploads().is_empty());

        let submitted_input = {
            let submissions = harness.provider.submissions.lock().unwrap();
            assert_eq!(submissions.len(), 1);
            assert_eq!(submissions[0].2, CALLBACK_URL);
            submissions[0].1.clone()
        };
        assert_eq!(submitted_input[META_KEY]["userId"], "u1");

        let completion = json!({
            "id": "job-1",
            "status": "succeeded",
            "output": "https://cdn.test/out.mp4",
            "input": submitted_input,
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate/callback", &completion))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["predictionId"], "job-1");

        let uploads = harness.uploads();
        assert_eq!(uploads.len(), 1);
        assert_uuid_path(&uploads[0].0, "u1/c1/videos/", "mp4");
        assert_eq!(body["path"], uploads[0].0);
        assert_eq!(
            *harness.fetcher.requested.lock().unwrap(),
            vec!["https://cdn.test/out.mp4"]
        );

        let rows = harness.recorder.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.job_id, "job-1");
        assert_eq!(rows[0].0.subject_id, "c1");
        assert!(!rows[0].0.original_parameters.contains_key(META_KEY));
        assert_eq!(rows[0].1.storage_path, uploads[0].0);
    }

    #[tokio::test]
    async fn inline_video_of_several_megabytes_is_accepted() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(500));
        let video = vec![0u8; 3 * 1024 * 1024];
        let completion = json!({
            "id": "job-9",
            "status": "succeeded",
            "output": format!("data:video/mp4;base64,{}", STANDARD.encode(&video)),
            "input": { "_meta": { "userId": "u1", "characterId": "c1" } }
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate/callback", &completion))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);

        let uploads = harness.storage.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_uuid_path(&uploads[0].0, "u1/c1/videos/", "mp4");
        assert_eq!(uploads[0].1.len(), video.len());
        assert!(harness.fetcher.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_acknowledged_without_work() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let completion = json!({
            "id": "job-1",
            "status": "failed",
            "output": null,
            "input": { "_meta": { "userId": "u1", "characterId": "c1" } }
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate/callback", &completion))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["ignored"], "failed");
        assert!(harness.uploads().is_empty());
    }

    #[tokio::test]
    async fn missing_metadata_is_a_bad_request() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let completion = json!({
            "id": "job-1",
            "status": "succeeded",
            "output": "https://cdn.test/out.mp4",
            "input": { "_meta": { "userId": "u1" } }
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate/callback", &completion))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "MISSING_CALLBACK_METADATA");
        assert!(harness.uploads().is_empty());
    }

    fn succeeded() -> Value {
        json!({
            "id": "job-7",
            "status": "succeeded",
            "output": ["https://cdn.test/out.mp4"],
            "input": { "_meta": { "userId": "u1", "characterId": "c1" } }
        })
    }

    #[tokio::test]
    async fn reference_row_failure_propagates_by_default() {
        let mut harness = Harness::new(
            ScriptedProvider::default(),
            StaticFetcher::ok("video/mp4", b"mp4"),
        );
        harness.recorder = Arc::new(FakeRecorder {
            fail: true,
            ..Default::default()
        });
        let response = harness
            .router()
            .oneshot(post_json("/api/generate/callback", &succeeded()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["code"], "REFERENCE_RECORD_FAILED");
        assert_eq!(harness.uploads().len(), 1);
    }

    #[tokio::test]
    async fn reference_row_failure_can_be_swallowed() {
        let mut harness = Harness::new(
            ScriptedProvider::default(),
            StaticFetcher::ok("video/mp4", b"mp4"),
        );
        harness.recorder = Arc::new(FakeRecorder {
            fail: true,
            ..Default::default()
        });
        harness.policy = ReferenceRowPolicy::Swallow;
        let response = harness
            .router()
            .oneshot(post_json("/api/generate/callback", &succeeded()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);
    }
}

mod health {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = harness.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn unknown_paths_get_a_json_404() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let request = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let response = harness.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["code"], "NOT_FOUND");
        assert_eq!(body["error"], "Not found: /api/unknown");
    }

    #[tokio::test]
    async fn openapi_document_lists_generation_routes() {
        let harness = Harness::new(ScriptedProvider::default(), StaticFetcher::status(200));
        let request = Request::builder()
            .uri("/api-docs/openapi.json")
            .body(Body::empty())
            .unwrap();
        let response = harness.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let document = json_body(response).await;
        assert!(document["paths"].get("/api/generate").is_some());
        assert!(document["paths"].get("/api/generate/callback").is_some());
        assert!(document["paths"].get("/health").is_some());
    }
}
