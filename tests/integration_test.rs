use std::io::Cursor;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use instanseg_server::{create_router, mocks::MockEngineFactory, AppState};

fn encoded_rgb(width: u32, height: u32) -> String {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    general_purpose::STANDARD.encode(bytes)
}

fn test_app(factory: &MockEngineFactory, sample_dir: &TempDir) -> Router {
    create_router(AppState::new(Arc::new(factory.clone()), sample_dir.path()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn process_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/process")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_fluorescence_end_to_end() {
    let samples = TempDir::new().unwrap();
    let factory = MockEngineFactory::new();
    let app = test_app(&factory, &samples);

    let (status, body) = send(
        app,
        process_request(json!({
            "image": encoded_rgb(512, 512),
            "model_name": "fluorescence_nuclei_and_cells",
            "pixel_size": 0.5,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let results = body.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["type"], "mask3d");
    assert_eq!(results[0]["shape"], json!([2, 512, 512]));
    assert_eq!(
        results[0]["data_params"]["name"],
        "InstanSeg (fluorescence_nuclei_and_cells)"
    );

    let data = general_purpose::STANDARD
        .decode(results[0]["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(data.len(), 2 * 512 * 512 * 4);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_brightfield_out_of_range_fails_before_inference() {
    let samples = TempDir::new().unwrap();
    let factory = MockEngineFactory::new();
    let app = test_app(&factory, &samples);

    let (status, body) = send(
        app,
        process_request(json!({
            "image": encoded_rgb(512, 512),
            "model_name": "brightfield_nuclei",
            "pixel_size": 11.0,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"][0]["loc"], json!(["body", "pixel_size"]));
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_brightfield_returns_instance_mask() {
    let samples = TempDir::new().unwrap();
    let factory = MockEngineFactory::new();
    let app = test_app(&factory, &samples);

    let (status, body) = send(
        app,
        process_request(json!({
            "image": encoded_rgb(64, 48),
            "model_name": "brightfield_nuclei",
            "pixel_size": 10.0,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["type"], "instance_mask");
    assert_eq!(body[0]["shape"], json!([48, 64]));
    assert_eq!(body[0]["data_params"]["name"], "InstanSeg (brightfield_nuclei)");
}

#[tokio::test]
async fn test_defaults_are_applied() {
    let samples = TempDir::new().unwrap();
    let factory = MockEngineFactory::new();
    let app = test_app(&factory, &samples);

    let (status, body) = send(app, process_request(json!({ "image": encoded_rgb(8, 8) }))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["type"], "mask3d");
}

#[tokio::test]
async fn test_invalid_inputs_are_rejected() {
    let samples = TempDir::new().unwrap();
    let factory = MockEngineFactory::new();

    let cases = [
        (json!({ "image": encoded_rgb(8, 8), "model_name": "nuclei" }), "model_name"),
        (json!({ "image": encoded_rgb(8, 8), "pixel_size": 0.05 }), "pixel_size"),
        (json!({ "image": "" }), "image"),
        (json!({ "image": "bm90IGFuIGltYWdl" }), "image"),
    ];
    for (body, field) in cases {
        let (status, response) = send(test_app(&factory, &samples), process_request(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "field {field}");
        assert_eq!(response["detail"][0]["loc"][1], field);
    }
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_missing_image_is_rejected_by_extractor() {
    let samples = TempDir::new().unwrap();
    let app = test_app(&MockEngineFactory::new(), &samples);

    let (status, _) = send(app, process_request(json!({ "pixel_size": 0.5 }))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_engine_failure_is_server_error() {
    let samples = TempDir::new().unwrap();
    let app = test_app(&MockEngineFactory::failing(), &samples);

    let (status, body) = send(app, process_request(json!({ "image": encoded_rgb(8, 8) }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"], "Internal Server Error");
}

#[tokio::test]
async fn test_parameters_schema_endpoint() {
    let samples = TempDir::new().unwrap();
    let app = test_app(&MockEngineFactory::new(), &samples);

    let (status, body) = send(app, get("/parameters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["properties"]["pixel_size"]["minimum"], json!(0.1));
    assert_eq!(body["properties"]["pixel_size"]["maximum"], json!(10.0));
    assert_eq!(body["properties"]["pixel_size"]["step"], json!(0.05));
    assert_eq!(body["properties"]["model_name"]["widget_type"], "dropdown");
}

#[tokio::test]
async fn test_info_and_health_endpoints() {
    let samples = TempDir::new().unwrap();
    let factory = MockEngineFactory::new();

    let (status, body) = send(test_app(&factory, &samples), get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["algorithm_name"], "instanseg");

    let (status, body) = send(test_app(&factory, &samples), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let response = test_app(&factory, &samples)
        .oneshot(get("/version"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], env!("CARGO_PKG_VERSION").as_bytes());
}

#[tokio::test]
async fn test_sample_images_endpoint() {
    let samples = TempDir::new().unwrap();
    DynamicImage::ImageRgb8(RgbImage::new(16, 16))
        .save(samples.path().join("a.png"))
        .unwrap();
    DynamicImage::ImageRgb8(RgbImage::new(8, 4))
        .save(samples.path().join("b.png"))
        .unwrap();
    let factory = MockEngineFactory::new();

    let (status, body) = send(test_app(&factory, &samples), get("/sample_images")).await;
    assert_eq!(status, StatusCode::OK);
    let images = body["sample_images"].as_array().unwrap();
    assert_eq!(images.len(), 2);

    // a served sample can be posted back unchanged
    let (status, body) = send(
        test_app(&factory, &samples),
        process_request(json!({ "image": images[1]["sample_image"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["shape"], json!([2, 4, 8]));
}

#[tokio::test]
async fn test_unreadable_sample_is_server_error() {
    let samples = TempDir::new().unwrap();
    std::fs::write(samples.path().join("notes.txt"), b"not an image").unwrap();

    let (status, _) = send(
        test_app(&MockEngineFactory::new(), &samples),
        get("/sample_images"),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
