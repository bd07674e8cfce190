// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for heimdall-webhook.
//!
//! These tests run without a Kubernetes cluster or broker and drive the
//! admission endpoint end to end through the router.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::fixtures::{
    INTRUDER_IP, OWNER_IP, ObjectBuilder, PRIORITY_LABEL, RecordingQueue, ReviewBuilder, peer,
    webhook_state, webhook_state_with_policy,
};
use heimdall_webhook::config::OwnershipPolicy;
use heimdall_webhook::webhooks::WebhookState;
use heimdall_webhook::webhooks::codec::JSON_CONTENT_TYPE;

async fn post(state: Arc<WebhookState>, requester: &str, body: String) -> (StatusCode, Value) {
    let app = heimdall_webhook::webhooks::create_webhook_router(state, "/mutate")
        .layer(MockConnectInfo(peer(requester)));
    let response = app
        .oneshot(
            Request::post("/mutate")
                .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn owned() -> ObjectBuilder {
    ObjectBuilder::deployment("web")
        .owner(OWNER_IP)
        .label("app", "web")
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_non_owner_spec_change_is_denied_and_queued() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(5)).build();

        let (status, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(status, StatusCode::OK);
        let response = &review["response"];
        assert_eq!(response["allowed"], false);
        assert_eq!(response["uid"], "review-uid");
        let message = response["status"]["message"].as_str().unwrap();
        assert!(message.contains(INTRUDER_IP));
        assert!(message.contains("spec"));
        assert!(response.get("patch").is_none());

        let published = queue.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "web");
        assert_eq!(published[0].namespace, "shop");
        assert_eq!(published[0].kind, "Deployment");
        assert_eq!(published[0].group, "apps");
        assert_eq!(published[0].version, "v1");
    }

    #[tokio::test]
    async fn test_non_owner_priority_change_is_allowed() {
        let queue = Arc::new(RecordingQueue::default());
        let body =
            ReviewBuilder::update(&owned(), &owned().label(PRIORITY_LABEL, "high")).build();

        let (status, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["response"]["allowed"], true);
        assert!(review["response"].get("patch").is_none());
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_identical_objects_are_allowed_for_anyone() {
        for requester in [OWNER_IP, INTRUDER_IP, "192.168.1.1"] {
            let queue = Arc::new(RecordingQueue::default());
            let body = ReviewBuilder::update(&owned(), &owned()).build();

            let (_, review) = post(webhook_state(queue.clone()), requester, body).await;

            assert_eq!(review["response"]["allowed"], true);
            assert!(review["response"].get("patch").is_none());
            assert!(queue.published().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_kube_system_bypasses_policy() {
        let queue = Arc::new(RecordingQueue::default());
        let state = webhook_state(queue.clone());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(9))
            .namespace("kube-system")
            .build();

        let (_, review) = post(state.clone(), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], true);
        assert!(review["response"].get("patch").is_none());
        assert!(queue.published().await.is_empty());
        let metrics = state.health.metrics.encode();
        assert!(metrics.contains("outcome=\"bypassed\""));
        assert!(!metrics.contains("outcome=\"denied\""));
    }

    #[tokio::test]
    async fn test_kube_public_bypasses_even_undecodable_objects() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned())
            .namespace("kube-public")
            .raw_object(json!("not an object"))
            .build();

        let (_, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], true);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_owner_may_change_spec() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(7)).build();

        let (_, review) = post(webhook_state(queue.clone()), OWNER_IP, body).await;

        assert_eq!(review["response"]["allowed"], true);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_protected_label_change_is_denied() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().label("app", "api")).build();

        let (_, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], false);
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("(app: api)"));
        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_protected_label_removal_is_denied() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().without_label("app")).build();

        let (_, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_with_denial() {
        let queue = Arc::new(RecordingQueue::failing());
        let state = webhook_state(queue.clone());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(5)).build();

        let (status, review) = post(state.clone(), INTRUDER_IP, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["response"]["allowed"], false);
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.starts_with("DENIED: non-owner 10.0.0.9 cannot change spec"));
        assert!(message.contains("reconciliation not queued"));
        assert_eq!(queue.published().await.len(), 1);

        let recent = state.health.recent_errors.snapshot().await;
        assert_eq!(recent.len(), 1);
        assert!(recent[0].contains("reconciliation not queued"));
    }

    #[tokio::test]
    async fn test_decode_failure_denied_without_publish_by_default() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned())
            .raw_object(json!({"metadata": {"name": "web"}}))
            .build();

        let (status, review) = post(webhook_state(queue.clone()), OWNER_IP, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["response"]["allowed"], false);
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("new object"));
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_publishes_when_configured() {
        let queue = Arc::new(RecordingQueue::default());
        let policy = OwnershipPolicy {
            publish_on_decode_failure: true,
            ..Default::default()
        };
        let body = ReviewBuilder::update(&owned(), &owned())
            .raw_object(json!([1, 2, 3]))
            .build();

        let (_, review) =
            post(webhook_state_with_policy(queue.clone(), policy), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_is_allowed() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(8))
            .operation(Some("CREATE"))
            .build();

        let (_, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], true);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_owner_delete_is_denied_and_queued() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned())
            .operation(Some("DELETE"))
            .raw_object(Value::Null)
            .build();

        let (status, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(review["response"]["uid"], "review-uid");
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains(INTRUDER_IP));
        assert!(message.contains("delete"));
        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_owner_delete_is_allowed() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned())
            .operation(Some("DELETE"))
            .raw_object(Value::Null)
            .build();

        let (_, review) = post(webhook_state(queue.clone()), OWNER_IP, body).await;

        assert_eq!(review["response"]["allowed"], true);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_runs_ownership_rules() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(8))
            .operation(Some("CONNECT"))
            .build();

        let (_, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_operation_is_treated_as_update() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned().replicas(8))
            .operation(None)
            .build();

        let (_, review) = post(webhook_state(queue.clone()), INTRUDER_IP, body).await;

        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_uid_is_echoed() {
        let queue = Arc::new(RecordingQueue::default());
        let body = ReviewBuilder::update(&owned(), &owned())
            .uid("705ab4f5-6393-11e8-b7cc-42010a800002")
            .build();

        let (_, review) = post(webhook_state(queue), INTRUDER_IP, body).await;

        assert_eq!(
            review["response"]["uid"],
            "705ab4f5-6393-11e8-b7cc-42010a800002"
        );
        assert_eq!(review["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(review["kind"], "AdmissionReview");
    }
}

mod transport_tests {
    use super::*;

    async fn send(request: Request<Body>) -> (StatusCode, String, Arc<RecordingQueue>) {
        let queue = Arc::new(RecordingQueue::default());
        let app = heimdall_webhook::webhooks::create_webhook_router(
            webhook_state(queue.clone()),
            "/mutate",
        )
        .layer(MockConnectInfo(peer(INTRUDER_IP)));
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned(), queue)
    }

    #[tokio::test]
    async fn test_get_is_rejected() {
        let (status, body, queue) =
            send(Request::get("/mutate").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(body.contains("GET"));
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_content_type_is_rejected() {
        let body = ReviewBuilder::update(&owned(), &owned().replicas(5)).build();
        let (status, _, queue) =
            send(Request::post("/mutate").body(Body::from(body)).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_content_type_parameters_are_rejected() {
        let body = ReviewBuilder::update(&owned(), &owned()).build();
        let (status, _, _) = send(
            Request::post("/mutate")
                .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_garbage_body_is_rejected() {
        let (status, body, _) = send(
            Request::post("/mutate")
                .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(Body::from("{{{"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("could not deserialize request"));
    }

    #[tokio::test]
    async fn test_missing_request_is_rejected() {
        let (status, body, _) = send(
            Request::post("/mutate")
                .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(Body::from(
                    r#"{"apiVersion":"admission.k8s.io/v1","kind":"AdmissionReview"}"#,
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("request is nil"));
    }
}

mod fixture_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn test_peer_rejects_invalid_address() {
        peer("10.0.0.300");
    }
}

mod config_tests {
    use clap::Parser;
    use heimdall_webhook::config::WebhookConfig;

    #[test]
    fn test_flags_override_defaults() {
        let config = WebhookConfig::try_parse_from([
            "heimdall-webhook",
            "--topic",
            "drift",
            "--topic-partitions",
            "6",
            "--reserved-namespaces",
            "kube-system,istio-system",
        ])
        .unwrap();

        assert_eq!(config.topic, "drift");
        assert_eq!(config.topic_partitions, 6);
        let policy = config.ownership_policy();
        assert!(policy.is_reserved_namespace("istio-system"));
        assert!(!policy.is_reserved_namespace("kube-public"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_partitions_rejected() {
        let config =
            WebhookConfig::try_parse_from(["heimdall-webhook", "--topic-partitions", "0"])
                .unwrap();
        assert!(config.validate().is_err());
    }
}
