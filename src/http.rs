//! The HTTP API.
//!
//! | method   | path                    |                                   |
//! |----------|-------------------------|-----------------------------------|
//! | `GET`    | `/images?type=<type>`   | list records                      |
//! | `PUT`    | `/images`               | upload an image as request body   |
//! | `POST`   | `/images`               | fetch an image from a remote URL  |
//! | `GET`    | `/images/{id}`          | get a record                      |
//! | `DELETE` | `/images/{id}`          | delete content and record         |
//! | `GET`    | `/images/{id}/download` | stream the content of an image    |

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;

use crate::context::Context;
use crate::error::StoreError;
use crate::fetcher::FetchError;
use crate::image::{Image, ImageStatus, ImageType};

pub const IMAGE_TYPE_HEADER: &str = "x-image-type";
pub const IMAGE_COMMENT_HEADER: &str = "x-image-comment";

const DOWNLOAD_BUFFER: usize = 64 * 1024;

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route(
            "/images",
            get(list_images).put(receive_image).post(fetch_image),
        )
        .route("/images/{id}", get(get_image).delete(delete_image))
        .route("/images/{id}/download", get(download_image))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: u16,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        let body = ErrorBody {
            message,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::InvalidKey(_) => ApiError::BadRequest(err.to_string()),
            err => {
                tracing::error!(error = &err as &dyn std::error::Error, "store request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Validation(err) => ApiError::BadRequest(err.to_string()),
            err => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(rename = "type")]
    image_type: Option<String>,
}

async fn list_images(
    State(ctx): State<Arc<Context>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Image>>, ApiError> {
    let image_type = match params.image_type.as_deref() {
        None | Some("") => None,
        Some(ty) => Some(
            ty.parse::<ImageType>()
                .map_err(|err| ApiError::BadRequest(err.to_string()))?,
        ),
    };
    Ok(Json(ctx.metadata.list(image_type).await?))
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

async fn receive_image(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Image>, ApiError> {
    let image_type = header_str(&headers, IMAGE_TYPE_HEADER);
    let comment = header_str(&headers, IMAGE_COMMENT_HEADER);
    let declared_length = header_str(&headers, CONTENT_LENGTH.as_str()).parse().ok();

    let body = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let mut input = StreamReader::new(body);

    let image = ctx
        .fetcher
        .receive(&mut input, declared_length, image_type, comment)
        .await
        .inspect_err(|err| {
            tracing::error!(error = err as &dyn std::error::Error, "failed to receive image");
        })?;
    Ok(Json(image))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "type")]
    pub image_type: String,
    #[serde(default)]
    pub comment: String,
}

async fn fetch_image(
    State(ctx): State<Arc<Context>>,
    payload: Result<Json<FetchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;

    let image = ctx
        .fetcher
        .fetch(&request.source, &request.image_type, &request.comment)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(image)))
}

async fn get_image(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    Ok(Json(ctx.metadata.get_by_id(&id).await?))
}

async fn delete_image(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    let image = ctx.metadata.get_by_id(&id).await?;

    ctx.blobs.delete(&id).await?;
    ctx.metadata.delete(&id).await?;

    tracing::info!(image_id = %id, "image deleted");
    Ok(Json(image))
}

async fn download_image(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let image = ctx.metadata.get_by_id(&id).await?;
    if image.status != ImageStatus::Complete {
        return Err(ApiError::NotFound(format!("image {id} is not complete")));
    }

    let (mut writer, reader) = tokio::io::duplex(DOWNLOAD_BUFFER);
    let blobs = ctx.blobs.clone();
    tokio::spawn(async move {
        if let Err(err) = blobs.get(&id, &mut writer).await {
            tracing::error!(image_id = %id, error = &err as &dyn std::error::Error, "failed to stream image");
        }
    });

    let headers = [
        (CONTENT_LENGTH, image.size.to_string()),
        (CONTENT_TYPE, "application/octet-stream".to_string()),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(reader))))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    const PAYLOAD: &[u8] = b"not really a disk image..";

    fn app() -> (Router, Arc<Context>) {
        let ctx = Arc::new(Context::in_memory());
        (router(ctx.clone()), ctx)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn upload_req(image_type: &str, payload: &'static [u8]) -> Request<Body> {
        Request::put("/images")
            .header(IMAGE_TYPE_HEADER, image_type)
            .header(IMAGE_COMMENT_HEADER, "uploaded")
            .header(CONTENT_LENGTH, payload.len())
            .body(Body::from(payload))
            .unwrap()
    }

    fn fetch_req(body: &str) -> Request<Body> {
        Request::post("/images")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn upload(app: &Router, image_type: &str) -> Image {
        let (status, body) = send(app, upload_req(image_type, PAYLOAD)).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn lists_images() {
        let (app, _ctx) = app();

        let (status, body) = send(&app, get_req("/images")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");

        let kvm = upload(&app, "kvm").await;
        let container = upload(&app, "container").await;

        let (_, body) = send(&app, get_req("/images")).await;
        let images: Vec<Image> = serde_json::from_slice(&body).unwrap();
        assert_eq!(images.len(), 2);

        let (_, body) = send(&app, get_req("/images?type=kvm")).await;
        let images: Vec<Image> = serde_json::from_slice(&body).unwrap();
        assert_eq!(images, vec![kvm]);

        let (_, body) = send(&app, get_req("/images?type=container")).await;
        let images: Vec<Image> = serde_json::from_slice(&body).unwrap();
        assert_eq!(images, vec![container]);

        let (status, body) = send(&app, get_req("/images?type=floppy")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, 400);
    }

    #[tokio::test]
    async fn uploads_and_downloads() {
        let (app, _ctx) = app();

        let image = upload(&app, "kvm").await;
        assert_eq!(image.status, ImageStatus::Complete);
        assert_eq!(image.size, PAYLOAD.len() as u64);
        assert_eq!(image.expected_size, Some(PAYLOAD.len() as u64));
        assert_eq!(image.comment, "uploaded");
        assert!(image.source.is_empty());

        let (status, body) = send(&app, get_req(&format!("/images/{}", image.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Image>(&body).unwrap(), image);

        let response = app
            .clone()
            .oneshot(get_req(&format!("/images/{}/download", image.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "25");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/octet-stream");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], PAYLOAD);
    }

    #[tokio::test]
    async fn uploads_need_a_valid_type() {
        let (app, ctx) = app();

        let request = Request::put("/images").body(Body::from(PAYLOAD)).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, 400);

        let (status, _) = send(&app, upload_req("floppy", PAYLOAD)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(ctx.metadata.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_images_are_not_found() {
        let (app, _ctx) = app();

        for uri in ["/images/nope", "/images/nope/download"] {
            let (status, body) = send(&app, get_req(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            let error: ErrorBody = serde_json::from_slice(&body).unwrap();
            assert_eq!(error.code, 404);
        }

        let request = Request::delete("/images/nope").body(Body::empty()).unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn incomplete_images_cannot_be_downloaded() {
        let (app, ctx) = app();

        let image = Image::new("http://localhost/img", ImageType::Kvm, "");
        ctx.metadata.put(&image).await.unwrap();

        let (status, _) = send(&app, get_req(&format!("/images/{}/download", image.id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deletes_images() {
        let (app, ctx) = app();
        let image = upload(&app, "container").await;
        let uri = format!("/images/{}", image.id);

        let request = Request::delete(uri.as_str()).body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Image>(&body).unwrap(), image);

        assert!(ctx.blobs.stat(&image.id).await.unwrap_err().is_not_found());
        let (status, _) = send(&app, get_req(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::delete(uri.as_str()).body(Body::empty()).unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_invalid_fetch_requests() {
        let (app, ctx) = app();

        for body in [
            r#"{"type": "kvm"}"#,
            r#"{"source": "http://localhost/img"}"#,
            r#"{"source": "http://localhost/img", "type": "floppy"}"#,
            "{ not json",
        ] {
            let (status, response) = send(&app, fetch_req(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            let error: ErrorBody = serde_json::from_slice(&response).unwrap();
            assert_eq!(error.code, 400);
        }

        assert!(ctx.metadata.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetches_are_accepted_once_per_source() {
        let (app, ctx) = app();
        // nothing listens on port 9, the download itself fails in the background
        let body = r#"{"source": "http://127.0.0.1:9/img", "type": "kvm", "comment": "remote"}"#;

        let (status, response) = send(&app, fetch_req(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let image: Image = serde_json::from_slice(&response).unwrap();
        assert_eq!(image.status, ImageStatus::Pending);
        assert_eq!(image.source, "http://127.0.0.1:9/img");
        assert_eq!(image.comment, "remote");

        let (status, response) = send(&app, fetch_req(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let again: Image = serde_json::from_slice(&response).unwrap();
        assert_eq!(again.id, image.id);

        assert_eq!(ctx.metadata.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsupported_methods_are_rejected() {
        let (app, _ctx) = app();
        let request = Request::builder()
            .method(Method::PATCH)
            .uri("/images")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
