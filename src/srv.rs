use std::io;
use std::time::Duration;

use actix_web::dev::Server;
use actix_web::http::header::RETRY_AFTER;
use actix_web::http::StatusCode;
use actix_web::middleware::TrailingSlash;
use actix_web::web::{Data, Path, ServiceConfig};
use actix_web::{
    error, middleware, route, App, HttpRequest, HttpResponse, HttpServer, ResponseError, Result,
};
use log::{error, info, warn};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TileError;
use crate::query::QueryExecutor;
use crate::registry::SourceRegistry;
use crate::Xyz;

pub const MVT_CONTENT_TYPE: &str = "application/vnd.mapbox-vector-tile";

pub struct AppState {
    pub registry: SourceRegistry,
    pub db: Box<dyn QueryExecutor>,
    /// Deadline for a single tile query.
    pub query_timeout: Duration,
    /// Cancelled when the server shuts down, aborting every running tile query.
    pub shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct SourceRequest {
    source_id: String,
}

#[derive(Deserialize)]
struct TileRequest {
    source_id: String,
    z: u8,
    x: u32,
    y: u32,
}

impl ResponseError for TileError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::SourceNotFound(_) | Self::ZoomOutOfRange { .. } | Self::NoQueryForZoom { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::AmbiguousTileResult { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::QueryExecution { .. } => StatusCode::BAD_GATEWAY,
            Self::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cancelled { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code());
        if matches!(self, Self::PoolExhausted { .. }) {
            res.insert_header((RETRY_AFTER, "1"));
        }
        res.content_type("text/plain; charset=utf-8")
            .body(self.to_string())
    }
}

/// Logs a failed tile request at a level matching how much an operator should care.
fn log_tile_error(e: &TileError) {
    match e {
        TileError::SourceNotFound(_) => {}
        TileError::ZoomOutOfRange { .. } | TileError::NoQueryForZoom { .. } => info!("{e}"),
        TileError::PoolExhausted { .. } | TileError::Cancelled { .. } => warn!("{e}"),
        TileError::AmbiguousTileResult { xyz, .. } | TileError::QueryExecution { xyz, .. } => {
            let (lon, lat) = xyz.lon_lat();
            error!("{e} (tile north-west corner at {lon:.5},{lat:.5})");
        }
    }
}

#[route("/health", method = "GET", method = "HEAD")]
async fn get_health() -> &'static str {
    "OK"
}

#[route("/list", method = "GET", method = "HEAD")]
async fn get_list(state: Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.list_ids())
}

#[route("/{source_id}", method = "GET", method = "HEAD")]
async fn get_tilejson(
    req: HttpRequest,
    path: Path<SourceRequest>,
    state: Data<AppState>,
) -> Result<HttpResponse> {
    let source = state.registry.get_source(&path.source_id)?;

    let connection_info = req.connection_info();
    let base_url = format!(
        "{}://{}{}",
        connection_info.scheme(),
        connection_info.host(),
        req.path().trim_end_matches('/')
    );

    Ok(HttpResponse::Ok().json(source.tilejson(&base_url)))
}

#[route("/{source_id}/{z}/{x}/{y}", method = "GET", method = "HEAD")]
async fn get_tile(path: Path<TileRequest>, state: Data<AppState>) -> Result<HttpResponse> {
    let xyz = Xyz::new(path.z, path.x, path.y);
    if !xyz.is_valid() {
        return Err(error::ErrorBadRequest(format!("Tile {xyz} does not exist")));
    }
    let source = state.registry.get_source(&path.source_id)?;

    let cancel = state.shutdown.child_token();
    let deadline = cancel.clone();
    let timeout = state.query_timeout;
    let timer = actix_web::rt::spawn(async move {
        tokio::time::sleep(timeout).await;
        deadline.cancel();
    });
    let result = source.get_tile(state.db.as_ref(), xyz, &cancel).await;
    timer.abort();

    match result {
        Ok(tile) if tile.is_empty() => Ok(HttpResponse::NoContent().finish()),
        Ok(tile) => Ok(HttpResponse::Ok().content_type(MVT_CONTENT_TYPE).body(tile)),
        Err(e) => {
            log_tile_error(&e);
            Err(e.into())
        }
    }
}

pub fn router(cfg: &mut ServiceConfig) {
    cfg.service(get_health)
        .service(get_list)
        .service(get_tilejson)
        .service(get_tile);
}

pub fn new_server(config: &Config, state: AppState) -> io::Result<Server> {
    let state = Data::new(state);
    let keep_alive = config.keep_alive;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::new(TrailingSlash::MergeOnly))
            .configure(router)
    })
    .bind(&config.listen_addresses)?
    .keep_alive(keep_alive)
    .shutdown_timeout(0);

    let server = match config.workers {
        Some(workers) => server.workers(workers),
        None => server,
    };

    Ok(server.run())
}

#[cfg(test)]
mod tests {
    use actix_web::http::header::CONTENT_TYPE;
    use actix_web::test::{call_and_read_body_json, call_service, init_service, read_body, TestRequest};
    use serde_json::Value;

    use super::*;
    use crate::error::DbError;
    use crate::query::tests::MockExecutor;
    use crate::recipe::RecipeSource;

    fn state(db: MockExecutor, query_timeout: Duration) -> Data<AppState> {
        let recipe = "name: roads\nminzoom: 2\nmaxzoom: 14\nvector_layers:\n  - id: roads\n    fields:\n      name: text\nsqls:\n  z*: SELECT tile(:z, :x, :y)\n";
        let source = RecipeSource::from_yaml(recipe).unwrap();
        let (registry, _) = SourceRegistry::build(vec![(source.id.clone(), source)]);
        Data::new(AppState {
            registry,
            db: Box::new(db),
            query_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    async fn status(db: MockExecutor, uri: &str) -> StatusCode {
        let state = state(db, Duration::from_secs(10));
        let app = init_service(App::new().app_data(state).configure(router)).await;
        call_service(&app, TestRequest::get().uri(uri).to_request())
            .await
            .status()
    }

    #[actix_web::test]
    async fn test_list() {
        let state = state(MockExecutor::with_rows(vec![]), Duration::from_secs(10));
        let app = init_service(App::new().app_data(state).configure(router)).await;
        let ids: Vec<String> =
            call_and_read_body_json(&app, TestRequest::get().uri("/list").to_request()).await;
        assert_eq!(vec!["roads"], ids);
    }

    #[actix_web::test]
    async fn test_tilejson() {
        let state = state(MockExecutor::with_rows(vec![]), Duration::from_secs(10));
        let app = init_service(App::new().app_data(state).configure(router)).await;
        let req = TestRequest::get()
            .uri("/roads")
            .insert_header(("host", "tiles.example.org"))
            .to_request();
        let tilejson: Value = call_and_read_body_json(&app, req).await;
        assert_eq!("3.0.0", tilejson["tilejson"]);
        assert_eq!("http://tiles.example.org/roads/{z}/{x}/{y}", tilejson["tiles"][0]);
        assert_eq!("roads", tilejson["name"]);
        assert_eq!(2, tilejson["minzoom"]);
        assert_eq!(14, tilejson["maxzoom"]);
        assert_eq!("text", tilejson["vector_layers"][0]["fields"]["name"]);

        assert_eq!(
            StatusCode::NOT_FOUND,
            status(MockExecutor::with_rows(vec![]), "/water").await
        );
    }

    #[actix_web::test]
    async fn test_tile() {
        let state = state(MockExecutor::with_rows(vec![vec![0x1a, 0x02]]), Duration::from_secs(10));
        let app = init_service(App::new().app_data(state).configure(router)).await;
        let res = call_service(&app, TestRequest::get().uri("/roads/3/2/1").to_request()).await;
        assert_eq!(StatusCode::OK, res.status());
        let content_type = res.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap();
        assert_eq!(MVT_CONTENT_TYPE, content_type);
        let body = read_body(res).await;
        assert_eq!(&[0x1a, 0x02][..], &body[..]);
    }

    #[actix_web::test]
    async fn test_tile_statuses() {
        let rows = MockExecutor::with_rows;
        assert_eq!(StatusCode::NO_CONTENT, status(rows(vec![]), "/roads/3/2/1").await);
        assert_eq!(StatusCode::NOT_FOUND, status(rows(vec![]), "/water/3/2/1").await);
        assert_eq!(StatusCode::NOT_FOUND, status(rows(vec![]), "/roads/1/0/0").await);
        assert_eq!(StatusCode::BAD_REQUEST, status(rows(vec![]), "/roads/3/8/1").await);
        assert_eq!(
            StatusCode::INTERNAL_SERVER_ERROR,
            status(rows(vec![vec![1], vec![2]]), "/roads/3/2/1").await
        );

        let failing = MockExecutor::failing(|| DbError::Query("boom".into()));
        assert_eq!(StatusCode::BAD_GATEWAY, status(failing, "/roads/3/2/1").await);
    }

    #[actix_web::test]
    async fn test_pool_exhausted_hints_retry() {
        let state = state(MockExecutor::failing(|| DbError::PoolExhausted), Duration::from_secs(10));
        let app = init_service(App::new().app_data(state).configure(router)).await;
        let res = call_service(&app, TestRequest::get().uri("/roads/3/2/1").to_request()).await;
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, res.status());
        assert_eq!("1", res.headers().get(RETRY_AFTER).unwrap().to_str().unwrap());
    }

    #[actix_web::test]
    async fn test_tile_deadline() {
        let mut db = MockExecutor::with_rows(vec![vec![1]]);
        db.delay = Some(Duration::from_secs(60));
        let state = state(db, Duration::from_millis(20));
        let app = init_service(App::new().app_data(state).configure(router)).await;
        let res = call_service(&app, TestRequest::get().uri("/roads/3/2/1").to_request()).await;
        assert_eq!(StatusCode::GATEWAY_TIMEOUT, res.status());
    }

    #[actix_web::test]
    async fn test_shutdown_cancels_queries() {
        let mut db = MockExecutor::with_rows(vec![vec![1]]);
        db.delay = Some(Duration::from_secs(60));
        let state = state(db, Duration::from_secs(60));
        state.shutdown.cancel();
        let app = init_service(App::new().app_data(state).configure(router)).await;
        let res = call_service(&app, TestRequest::get().uri("/roads/3/2/1").to_request()).await;
        assert_eq!(StatusCode::GATEWAY_TIMEOUT, res.status());
    }
}
