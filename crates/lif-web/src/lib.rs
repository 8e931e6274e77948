//! Axum JSON API over the provider catalog.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use lif_catalog::{
    CatalogError, ProviderCatalog, ProviderProfile, RankedProvider, SearchOptions,
};
use lif_core::{NewProvider, ProviderChanges, ProviderScope, ProviderStatus};
use lif_store::InvalidationScope;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "lif-web";

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<ProviderCatalog>,
}

impl AppState {
    pub fn new(catalog: Arc<ProviderCatalog>) -> Self {
        Self { catalog }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/statuses", get(statuses_handler))
        .route("/providers", get(list_handler).post(add_handler))
        .route("/providers/{id}", get(get_handler).put(update_handler))
        .route("/providers/{id}/location", put(update_location_handler))
        .route("/providers/{id}/priority", post(promote_handler))
        .route("/priorities/sweep", post(sweep_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .route("/search", get(search_handler))
        .route("/search/offers", get(search_offers_handler))
        .route("/coverage", get(coverage_handler))
        .route("/coverage/areas", get(coverage_areas_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving provider directory API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    service: &'static str,
    endpoints: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct StatusRow {
    code: i16,
    label: &'static str,
    active: bool,
}

/// Search results. `matches` is `null` for the no-match sentinel so callers
/// can tell it apart from a page they merely paged past.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub matches: Option<Vec<RankedProvider>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub providers: Option<Vec<ProviderProfile>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub updated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub demoted: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddResponse {
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    postcode: String,
    limit: Option<u32>,
    cover: Option<bool>,
    prefer_offers: Option<bool>,
    only_offers: Option<bool>,
    tutors: Option<bool>,
}

impl SearchQuery {
    fn options(&self) -> SearchOptions {
        let defaults = SearchOptions::default();
        SearchOptions {
            limit: self.limit.unwrap_or(defaults.limit),
            cover_only: self.cover.unwrap_or(false),
            prefer_offers: self.prefer_offers.unwrap_or(false),
            only_offers: self.only_offers.unwrap_or(false),
            scope: if self.tutors.unwrap_or(false) {
                ProviderScope::Tutors
            } else {
                ProviderScope::All
            },
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    status: Option<i16>,
    limit: Option<u32>,
    active: Option<bool>,
    only_offers: Option<bool>,
    tutors: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AreasQuery {
    /// Comma-separated area tokens.
    areas: String,
    limit: Option<u32>,
    prefer_offers: Option<bool>,
    only_offers: Option<bool>,
    tutors: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LocationBody {
    postcode: String,
}

#[derive(Debug, Deserialize, Default)]
struct InvalidateBody {
    provider_id: Option<i64>,
}

fn catalog_error(err: CatalogError) -> Response {
    let status = if err.is_validation() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn index_handler() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "lif",
        endpoints: vec![
            "/statuses",
            "/providers",
            "/search",
            "/search/offers",
            "/coverage",
            "/coverage/areas",
        ],
    })
}

async fn statuses_handler() -> Json<Vec<StatusRow>> {
    Json(
        ProviderStatus::all()
            .into_iter()
            .map(|status| StatusRow {
                code: status.code(),
                label: status.label(),
                active: status.is_active(),
            })
            .collect(),
    )
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Some(status) = query.status {
        return match state.catalog.list_all(Some(status)).await {
            Ok(providers) => Json(ListResponse { providers }).into_response(),
            Err(err) => catalog_error(err),
        };
    }

    let mut extra = BTreeMap::new();
    if query.tutors.unwrap_or(false) {
        extra.insert(
            "tutor".to_string(),
            lif_store::Predicate::Eq(lif_store::Value::Bool(true)),
        );
    }
    match state
        .catalog
        .list_matching(
            &extra,
            query.limit.unwrap_or(50),
            query.active.unwrap_or(true),
            None,
            query.only_offers.unwrap_or(false),
        )
        .await
    {
        Ok(providers) => Json(ListResponse { providers }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.catalog.get(id).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("provider {id} not found"),
            }),
        )
            .into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn add_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewProvider>,
) -> Response {
    match state.catalog.add(&input, Utc::now()).await {
        Ok(id) => (StatusCode::CREATED, Json(AddResponse { id })).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(changes): Json<ProviderChanges>,
) -> Response {
    match state.catalog.update(id, &changes).await {
        Ok(updated) => Json(UpdateResponse { updated }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn update_location_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<LocationBody>,
) -> Response {
    match state.catalog.update_location(id, &body.postcode).await {
        Ok(updated) => Json(UpdateResponse { updated }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn promote_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.catalog.promote(&id, Utc::now()).await {
        Ok(updated) => Json(UpdateResponse { updated }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn sweep_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.catalog.expire_priorities(Utc::now()).await {
        Ok(demoted) => Json(SweepResponse { demoted }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn invalidate_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<InvalidateBody>>,
) -> Response {
    let scope = match body {
        Some(Json(InvalidateBody {
            provider_id: Some(id),
        })) => InvalidationScope::Provider(id),
        _ => InvalidationScope::Global,
    };
    match state.catalog.invalidate_cache(scope).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state
        .catalog
        .find_closest(&query.postcode, &query.options())
        .await
    {
        Ok(matches) => Json(SearchResponse { matches }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn search_offers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state
        .catalog
        .find_closest_with_offers(&query.postcode, &query.options())
        .await
    {
        Ok(matches) => Json(SearchResponse { matches }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn coverage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state
        .catalog
        .find_by_coverage(&query.postcode, &query.options())
        .await
    {
        Ok(matches) => Json(SearchResponse { matches }).into_response(),
        Err(err) => catalog_error(err),
    }
}

async fn coverage_areas_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AreasQuery>,
) -> Response {
    let areas: Vec<String> = query
        .areas
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();
    let options = SearchOptions {
        limit: query.limit.unwrap_or(SearchOptions::default().limit),
        prefer_offers: query.prefer_offers.unwrap_or(false),
        only_offers: query.only_offers.unwrap_or(false),
        scope: if query.tutors.unwrap_or(false) {
            ProviderScope::Tutors
        } else {
            ProviderScope::All
        },
        ..SearchOptions::default()
    };
    match state.catalog.find_by_coverage_array(&areas, &options).await {
        Ok(matches) => Json(SearchResponse { matches }).into_response(),
        Err(err) => catalog_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use lif_catalog::CatalogConfig;
    use lif_core::{CoverageList, ProviderRecord};
    use lif_geo::FixedResolver;
    use lif_store::MemStore;
    use tower::ServiceExt;

    fn record(id: i64, areas: &[&str], coords: Option<(f64, f64)>) -> ProviderRecord {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        ProviderRecord {
            id,
            name: format!("Provider {id} Example"),
            email: format!("provider{id}@example.com"),
            phone: None,
            mobile: None,
            website: None,
            about: None,
            status: ProviderStatus::Active.code(),
            coverage: CoverageList::from_tokens(areas.iter().copied()).unwrap(),
            main_area: None,
            latitude: coords.map(|c| c.0),
            longitude: coords.map(|c| c.1),
            priority: false,
            priority_started_at: None,
            offer: None,
            lessons: None,
            social: None,
            tutor: false,
            cache_stale: false,
            password_hash: Some("sealed".to_string()),
            recovery_hash: None,
            created_at: created,
            updated_at: created,
        }
    }

    async fn test_app(records: Vec<ProviderRecord>, resolver: FixedResolver) -> Router {
        let store = Arc::new(MemStore::new());
        store.seed(records).await;
        let config = CatalogConfig {
            testimonials_enabled: false,
            search_cache_ttl_secs: 0,
            list_cache_ttl_secs: 0,
            ..CatalogConfig::default()
        };
        let catalog = Arc::new(ProviderCatalog::new(store, Arc::new(resolver), config));
        app(AppState::new(catalog))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_and_statuses_respond() {
        let app = test_app(vec![], FixedResolver::new()).await;
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/statuses")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body
            .as_array()
            .unwrap()
            .iter()
            .any(|row| row["label"] == "Active" && row["active"] == true));
    }

    #[tokio::test]
    async fn geo_search_returns_distances() {
        let app = test_app(
            vec![
                record(1, &["GU16"], Some((51.33, -0.72))),
                record(2, &["GU16"], Some((51.29, -0.75))),
            ],
            FixedResolver::new().with("GU16 7ER", 51.29, -0.75),
        )
        .await;

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/search?postcode=GU16%207ER")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let matches = body["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["id"], 2);
        assert!(matches[0]["distance"].is_number());
        assert!(matches[0].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn fallback_search_has_null_distances() {
        let app = test_app(
            vec![record(1, &["GU16"], None)],
            FixedResolver::new(),
        )
        .await;

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/search?postcode=GU16%207ER")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let matches = body["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0]["distance"].is_null());
    }

    #[tokio::test]
    async fn sentinel_is_null_not_empty_list() {
        let app = test_app(vec![], FixedResolver::new()).await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/coverage/areas?areas=")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["matches"].is_null());
    }

    #[tokio::test]
    async fn missing_provider_is_not_found() {
        let app = test_app(vec![], FixedResolver::new()).await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/providers/99")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_rejects_bad_input_with_unprocessable_entity() {
        let app = test_app(vec![], FixedResolver::new()).await;
        let payload = serde_json::json!({
            "id": "not-a-number",
            "name": "Rowan Hughes",
            "email": "rowan@example.co.uk",
            "coverage": ["GU16"],
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/providers")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("not numeric"));
    }

    #[tokio::test]
    async fn add_then_promote_then_sweep_round_trip() {
        let app = test_app(vec![], FixedResolver::new()).await;
        let payload = serde_json::json!({
            "id": "11",
            "name": "Rowan Hughes",
            "email": "rowan@example.co.uk",
            "coverage": ["GU16"],
        });
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/providers")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/providers/11/priority")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["updated"], true);

        // Freshly promoted, so the sweep has nothing to demote.
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/priorities/sweep")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["demoted"], 0);
    }
}
