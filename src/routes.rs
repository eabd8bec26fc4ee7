use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    body::Body,
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hyper::HeaderMap;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    artifacts::{ArtifactService, GetArtifactOutcome, RequestContext},
    http_objects::{
        ApiError, ArtifactView, CreateArtifactRequest, CreateArtifactResponse,
        ErrorArtifactResponse, ListArtifactsResponse, ListQuery,
    },
};

#[derive(OpenApi)]
#[openapi(
    paths(
        create_artifact,
        get_artifact,
        get_latest_artifact,
        list_artifacts,
        list_latest_artifacts,
    ),
    components(schemas(
        ApiError,
        ArtifactView,
        CreateArtifactRequest,
        CreateArtifactResponse,
        ErrorArtifactResponse,
        ListArtifactsResponse,
    )),
    tags(
        (name = "artifacts", description = "Artifact mediation API")
    )
)]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub artifact_service: Arc<ArtifactService>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route(
            "/task/:task_id/runs/:run_id/artifacts/*name",
            post(create_artifact)
                .get(get_artifact)
                .with_state(route_state.clone()),
        )
        .route(
            "/task/:task_id/runs/:run_id/artifacts",
            get(list_artifacts).with_state(route_state.clone()),
        )
        .route(
            "/task/:task_id/artifacts/*name",
            get(get_latest_artifact).with_state(route_state.clone()),
        )
        .route(
            "/task/:task_id/artifacts",
            get(list_latest_artifacts).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn index() -> &'static str {
    "artifact-broker"
}

/// Register an artifact on a run and obtain upload credentials
#[utoipa::path(
    post,
    path = "/task/{task_id}/runs/{run_id}/artifacts/{name}",
    tag = "artifacts",
    request_body = CreateArtifactRequest,
    responses(
        (status = 200, description = "artifact registered", body = CreateArtifactResponse),
        (status = BAD_REQUEST, description = "invalid input"),
        (status = CONFLICT, description = "conflicts with an existing artifact or resolved run"),
    ),
)]
async fn create_artifact(
    Path((task_id, run_id, name)): Path<(String, u32, String)>,
    State(state): State<RouteState>,
    Json(request): Json<CreateArtifactRequest>,
) -> Result<Json<CreateArtifactResponse>, ApiError> {
    let response = state
        .artifact_service
        .create_artifact(&task_id, run_id, &name, request)
        .await?;
    Ok(Json(response))
}

/// Redirect to the artifact's download location
#[utoipa::path(
    get,
    path = "/task/{task_id}/runs/{run_id}/artifacts/{name}",
    tag = "artifacts",
    responses(
        (status = 303, description = "redirect to the artifact bytes"),
        (status = 403, description = "stored error artifact", body = ErrorArtifactResponse),
        (status = NOT_FOUND, description = "no such artifact"),
    ),
)]
async fn get_artifact(
    Path((task_id, run_id, name)): Path<(String, u32, String)>,
    State(state): State<RouteState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    let outcome = state
        .artifact_service
        .get_artifact(&task_id, Some(run_id), &name, &ctx)
        .await?;
    artifact_response(outcome)
}

/// Redirect to the artifact's download location on the latest run
#[utoipa::path(
    get,
    path = "/task/{task_id}/artifacts/{name}",
    tag = "artifacts",
    responses(
        (status = 303, description = "redirect to the artifact bytes"),
        (status = 403, description = "stored error artifact", body = ErrorArtifactResponse),
        (status = NOT_FOUND, description = "no such artifact or task has no runs"),
    ),
)]
async fn get_latest_artifact(
    Path((task_id, name)): Path<(String, String)>,
    State(state): State<RouteState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    let outcome = state
        .artifact_service
        .get_artifact(&task_id, None, &name, &ctx)
        .await?;
    artifact_response(outcome)
}

/// List artifacts of a run
#[utoipa::path(
    get,
    path = "/task/{task_id}/runs/{run_id}/artifacts",
    tag = "artifacts",
    responses(
        (status = 200, description = "one page of artifacts", body = ListArtifactsResponse),
        (status = NOT_FOUND, description = "no such task or run"),
    ),
)]
async fn list_artifacts(
    Path((task_id, run_id)): Path<(String, u32)>,
    State(state): State<RouteState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListArtifactsResponse>, ApiError> {
    let response = state
        .artifact_service
        .list_artifacts(&task_id, Some(run_id), query)
        .await?;
    Ok(Json(response))
}

/// List artifacts of the latest run
#[utoipa::path(
    get,
    path = "/task/{task_id}/artifacts",
    tag = "artifacts",
    responses(
        (status = 200, description = "one page of artifacts", body = ListArtifactsResponse),
        (status = NOT_FOUND, description = "no such task or task has no runs"),
    ),
)]
async fn list_latest_artifacts(
    Path(task_id): Path<String>,
    State(state): State<RouteState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListArtifactsResponse>, ApiError> {
    let response = state
        .artifact_service
        .list_artifacts(&task_id, None, query)
        .await?;
    Ok(Json(response))
}

/// Region routing trusts the forwarding header written by the load
/// balancer; without one the request resolves to no region.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let skip_cache = headers
        .get("x-taskcluster-skip-cache")
        .and_then(|value| value.to_str().ok())
        .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false);
    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok());
    RequestContext {
        source_ip,
        skip_cache,
    }
}

fn artifact_response(outcome: GetArtifactOutcome) -> Result<Response, ApiError> {
    match outcome {
        GetArtifactOutcome::Redirect(url) => Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(header::LOCATION, url)
            .body(Body::empty())
            .map_err(|e| ApiError::internal_error(anyhow!("failed to build redirect: {e}"))),
        GetArtifactOutcome::Denied { reason, message } => Ok((
            StatusCode::FORBIDDEN,
            Json(ErrorArtifactResponse { reason, message }),
        )
            .into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_context_reads_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 192.168.0.1".parse().unwrap());
        let ctx = request_context(&headers);
        assert_eq!(ctx.source_ip, Some("10.1.2.3".parse().unwrap()));
        assert!(!ctx.skip_cache);
    }

    #[test]
    fn test_request_context_without_forwarding_header() {
        let ctx = request_context(&HeaderMap::new());
        assert_eq!(ctx.source_ip, None);
    }

    #[test]
    fn test_skip_cache_normalization() {
        for (value, expected) in [("true", true), ("TRUE", true), ("1", true), ("0", false), ("yes", false)] {
            let mut headers = HeaderMap::new();
            headers.insert("x-taskcluster-skip-cache", value.parse().unwrap());
            assert_eq!(request_context(&headers).skip_cache, expected, "{value}");
        }
    }

    #[test]
    fn test_redirect_response_sets_location() {
        let response =
            artifact_response(GetArtifactOutcome::Redirect("https://example.com/a".to_string()))
                .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_denied_response_is_forbidden() {
        let response = artifact_response(GetArtifactOutcome::Denied {
            reason: "failed".to_string(),
            message: "build failed".to_string(),
        })
        .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
