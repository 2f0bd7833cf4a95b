//! corral-api — REST API for the corral control plane.
//!
//! Thin axum routes over [`corral_server::Server`]. Errors map to status
//! codes: not-leader 503, validation 400, not found 404, conflict and stale
//! plan 409, provisioner failure 502.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET, POST | `/v1/nodes` | List / register nodes |
//! | GET, DELETE | `/v1/nodes/{id}` | Get / deregister a node |
//! | POST | `/v1/nodes/{id}/heartbeat` | Renew a node's heartbeat |
//! | PUT | `/v1/nodes/{id}/status` | Client-reported node status |
//! | PUT | `/v1/nodes/{id}/drain` | Toggle drain |
//! | GET | `/v1/nodes/{id}/allocations` | Allocations on a node |
//! | POST | `/v1/allocations/updates` | Client-reported allocation status |
//! | GET, POST | `/v1/jobs` | List / register jobs |
//! | GET, DELETE | `/v1/jobs/{namespace}/{id}` | Get / deregister a job |
//! | POST | `/v1/jobs/{namespace}/{id}/scale` | Scale a task group |
//! | GET | `/v1/jobs/{namespace}/{id}/allocations` | Job allocations |
//! | GET | `/v1/jobs/{namespace}/{id}/evaluations` | Job evaluations |
//! | GET | `/v1/evaluations` | List evaluations |
//! | GET | `/v1/evaluations/{id}` | Evaluation status |
//! | GET | `/v1/evaluations/{id}/plan` | Plan result |
//! | GET | `/v1/broker/stats` | Broker counters |
//! | GET, POST | `/v1/volumes` | List / create host volumes |
//! | POST | `/v1/volumes/register` | Register existing host volumes |
//! | POST | `/v1/volumes/delete` | Delete host volumes |
//! | GET | `/v1/volumes/{namespace}/{id}` | Get a host volume |
//! | GET | `/v1/status/leader` | Leadership and latest index |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post, put};
use corral_server::Server;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub server: Server,
}

/// Build the complete API router.
pub fn build_router(server: Server) -> Router {
    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route("/nodes/{id}", get(handlers::get_node).delete(handlers::deregister_node))
        .route("/nodes/{id}/heartbeat", post(handlers::heartbeat))
        .route("/nodes/{id}/status", put(handlers::update_node_status))
        .route("/nodes/{id}/drain", put(handlers::update_drain))
        .route("/nodes/{id}/allocations", get(handlers::node_allocations))
        .route("/allocations/updates", post(handlers::update_allocs))
        .route("/jobs", get(handlers::list_jobs).post(handlers::register_job))
        .route(
            "/jobs/{namespace}/{id}",
            get(handlers::get_job).delete(handlers::deregister_job),
        )
        .route("/jobs/{namespace}/{id}/scale", post(handlers::scale_job))
        .route("/jobs/{namespace}/{id}/allocations", get(handlers::job_allocations))
        .route("/jobs/{namespace}/{id}/evaluations", get(handlers::job_evaluations))
        .route("/evaluations", get(handlers::list_evals))
        .route("/evaluations/{id}", get(handlers::eval_status))
        .route("/evaluations/{id}/plan", get(handlers::plan_result))
        .route("/broker/stats", get(handlers::broker_stats))
        .route("/volumes", get(handlers::list_volumes).post(handlers::create_volumes))
        .route("/volumes/register", post(handlers::register_volumes))
        .route("/volumes/delete", post(handlers::delete_volumes))
        .route("/volumes/{namespace}/{id}", get(handlers::get_volume))
        .route("/status/leader", get(handlers::leader_status))
        .with_state(ApiState { server });

    Router::new().nest("/v1", api_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use corral_core::ServerConfig;
    use corral_state::StateStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn server() -> Server {
        let mut config = ServerConfig::default();
        config.scheduler.num_schedulers = 0;
        Server::new(config, StateStore::open_in_memory().unwrap())
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn leader_status_route() {
        let server = server();
        server.establish_leadership().await.unwrap();
        let app = build_router(server.clone());

        let resp = app
            .oneshot(Request::get("/v1/status/leader").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["leader"], true);
        assert_eq!(json["data"]["epoch"], 1);
        server.revoke_leadership().await;
    }

    #[tokio::test]
    async fn not_leader_is_retryable() {
        let app = build_router(server());
        let resp = app
            .oneshot(
                Request::post("/v1/jobs/default/web/scale")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"count": 2}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["retryable"], true);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = build_router(server());
        let resp = app
            .oneshot(Request::get("/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
