use super::*;

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use oracle_client::{AgentBinding, ReasoningController};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone)]
struct AgentServerState {
    succeed: bool,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "agent": "keiba-oracle" }))
}

async fn test_run(
    State(state): State<AgentServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let query = params.get("query").cloned().unwrap_or_default();
    if !state.succeed {
        return Json(json!({
            "success": false,
            "error": "model quota exhausted",
            "query": query
        }));
    }
    Json(json!({
        "success": true,
        "query": query,
        "final_recommendation": "Back Equinox to win",
        "risk_score": 0.35,
        "reasoning_steps": 14,
        "tool_calls": 2,
        "backtracks": 1
    }))
}

async fn spawn_agent_server(succeed: bool) -> String {
    let app = Router::new()
        .route("/health", get(health))
        .route("/test", post(test_run))
        .with_state(AgentServerState { succeed });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn wait_for_idle(controller: &ReasoningController) {
    for _ in 0..200 {
        if !controller.is_loading() && controller.state().final_recommendation.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn rejects_invalid_server_url() {
    assert!(matches!(
        HttpAgent::new("not a url"),
        Err(HttpAgentError::InvalidUrl { .. })
    ));
}

#[test]
fn endpoints_stay_under_the_base_path() {
    let agent = HttpAgent::new("http://agent.local/api").expect("agent");
    assert_eq!(
        agent.endpoint("health").expect("url").as_str(),
        "http://agent.local/api/health"
    );

    let agent = HttpAgent::new("http://agent.local/api/").expect("agent");
    assert_eq!(
        agent.endpoint("test").expect("url").as_str(),
        "http://agent.local/api/test"
    );

    let agent = HttpAgent::new("http://agent.local").expect("agent");
    assert_eq!(
        agent.endpoint("health").expect("url").as_str(),
        "http://agent.local/health"
    );
}

#[tokio::test]
async fn agent_mounted_under_a_prefix_is_reachable() {
    let app = Router::new().nest(
        "/api",
        Router::new()
            .route("/health", get(health))
            .route("/test", post(test_run))
            .with_state(AgentServerState { succeed: true }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let binding = LocalAgentBinding::with_handler(Arc::new(
        HttpAgent::new(&format!("http://{addr}/api")).expect("agent"),
    ));
    binding.set_state(ReasoningState::for_query("Nakayama"));
    binding.run().await.expect("prefixed run");

    let snapshot = binding.current().snapshot.expect("snapshot");
    assert_eq!(snapshot.final_recommendation.as_deref(), Some("Back Equinox to win"));
}

#[test]
fn failed_summary_becomes_run_error() {
    let response = TestRunResponse {
        success: false,
        query: None,
        final_recommendation: None,
        risk_score: None,
        reasoning_steps: 0,
        tool_calls: 0,
        backtracks: 0,
        error: Some("graph crashed".into()),
    };
    let err = snapshot_from_summary(response, "Kyoto").expect_err("failure");
    assert!(err.to_string().contains("graph crashed"));
}

#[test]
fn summary_risk_is_clamped_and_query_falls_back_to_request() {
    let response = TestRunResponse {
        success: true,
        query: None,
        final_recommendation: Some("Pass on this race".into()),
        risk_score: Some(1.3),
        reasoning_steps: 3,
        tool_calls: 1,
        backtracks: 3,
        error: None,
    };
    let snapshot = snapshot_from_summary(response, "Hanshin").expect("snapshot");
    assert_eq!(snapshot.query, "Hanshin");
    assert_eq!(snapshot.risk_score, 1.0);
    assert_eq!(snapshot.backtrack_count, 3);
    assert!(snapshot.backtrack_limit_reached());
}

#[tokio::test]
async fn remote_run_summary_lands_in_the_controller() {
    let server_url = spawn_agent_server(true).await;
    let binding =
        LocalAgentBinding::with_handler(Arc::new(HttpAgent::new(&server_url).expect("agent")));
    let controller = ReasoningController::new(Arc::new(binding.clone()));
    controller.attach(binding.updates());

    controller
        .send_query("Tokyo Yushun")
        .await
        .expect("remote run");
    wait_for_idle(&controller).await;

    let view = controller.view();
    assert_eq!(view.state.query, "Tokyo Yushun");
    assert_eq!(view.final_recommendation(), Some("Back Equinox to win"));
    assert_eq!(view.risk_score(), 0.35);
    assert_eq!(view.backtrack_count(), 1);
    assert!(!view.is_loading);
}

#[tokio::test]
async fn remote_failure_propagates_from_send_query() {
    let server_url = spawn_agent_server(false).await;
    let binding =
        LocalAgentBinding::with_handler(Arc::new(HttpAgent::new(&server_url).expect("agent")));
    let controller = ReasoningController::new(Arc::new(binding.clone()));

    let err = controller
        .send_query("Kyoto")
        .await
        .expect_err("remote failure");
    assert!(format!("{err:#}").contains("model quota exhausted"));
    assert!(!binding.current().running);
    assert_eq!(controller.state(), ReasoningState::for_query("Kyoto"));
}

#[tokio::test]
async fn unreachable_agent_surfaces_transport_error() {
    let binding = LocalAgentBinding::with_handler(Arc::new(
        HttpAgent::new("http://127.0.0.1:9").expect("agent"),
    ));
    let result = binding.run().await;
    assert!(result.is_err());
    assert!(!binding.current().running);
}
