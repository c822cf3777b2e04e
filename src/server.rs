use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    algorithm::run_algorithm,
    codec::encode_bytes,
    config::Config,
    errors::{InstanSegError, Result},
    model::OnnxEngineFactory,
    params::{parameters_schema, Parameters, RawParameters},
    results::SerializedResult,
    samples::load_sample_images,
    traits::EngineFactory,
};

pub const ALGORITHM_ID: &str = "instanseg";

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub algorithm_name: String,
    pub engines: Arc<dyn EngineFactory>,
    pub sample_dir: PathBuf,
}

impl AppState {
    pub fn new(engines: Arc<dyn EngineFactory>, sample_dir: impl Into<PathBuf>) -> Self {
        Self {
            algorithm_name: ALGORITHM_ID.to_string(),
            engines,
            sample_dir: sample_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let engines = OnnxEngineFactory::new(config.model_dir()?, config.device_id);
        Ok(Self::new(Arc::new(engines), config.sample_dir()?))
    }
}

#[derive(Debug, Serialize)]
struct SampleImagePayload {
    sample_image: String,
}

#[derive(Debug, Serialize)]
struct SampleImagesResponse {
    sample_images: Vec<SampleImagePayload>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/parameters", get(parameters_handler))
        .route("/process", post(process_handler))
        .route("/sample_images", get(sample_images_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn info_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "algorithm_name": state.algorithm_name,
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ["/", "/health", "/version", "/parameters", "/process", "/sample_images"],
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn version_handler() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

async fn parameters_handler() -> Json<Value> {
    Json(parameters_schema())
}

async fn process_handler(
    State(state): State<AppState>,
    Json(raw): Json<RawParameters>,
) -> Result<Json<Vec<SerializedResult>>> {
    let engines = state.engines.clone();
    let results = tokio::task::spawn_blocking(move || {
        let params = Parameters::try_from(raw)?;
        let results = run_algorithm(engines.as_ref(), &params)?;
        Ok::<_, InstanSegError>(
            results
                .iter()
                .map(SerializedResult::from)
                .collect::<Vec<_>>(),
        )
    })
    .await
    .map_err(|e| InstanSegError::model("inference task", e.to_string()))??;

    Ok(Json(results))
}

async fn sample_images_handler(
    State(state): State<AppState>,
) -> Result<Json<SampleImagesResponse>> {
    let dir = state.sample_dir.clone();
    let samples = tokio::task::spawn_blocking(move || load_sample_images(&dir))
        .await
        .map_err(|e| InstanSegError::model("sample loading task", e.to_string()))??;

    let sample_images = samples
        .iter()
        .map(|sample| SampleImagePayload {
            sample_image: encode_bytes(&sample.encoded),
        })
        .collect();
    Ok(Json(SampleImagesResponse { sample_images }))
}

/// Binds the configured address and serves until the process exits.
pub async fn serve(config: &Config) -> Result<()> {
    let state = AppState::from_config(config)?;
    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| InstanSegError::Server {
            operation: format!("bind {address}"),
            source: e,
        })?;
    info!(%address, algorithm = %state.algorithm_name, "server listening");

    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| InstanSegError::Server {
            operation: "serve".to_string(),
            source: e,
        })
}
