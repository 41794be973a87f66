/// Axum handlers for the image API
use axum::{
    Json,
    extract::{Multipart, State, multipart::Field},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use futures_util::future::BoxFuture;
use serde_json::json;
use std::future::Future;
use tracing::{debug, info, instrument};

use crate::AppState;
use crate::capabilities::CapabilitySet;
use crate::catalog::{Family, REALESRGAN_X4, upscale_model};
use crate::errors::{ApiError, ServiceError};
use crate::models::{
    CaptionForm, CaptionResponse, GenerateRequest, QueueStatus, ResidentSummary, UpscaleForm,
};

const PNG: &str = "image/png";

/// Submit `task` to the GPU queue and wait for it, giving up after the configured timeout.
async fn execute<F, Fut>(state: &AppState, task: F) -> Result<Vec<u8>, ServiceError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<u8>, ServiceError>> + Send + 'static,
{
    match tokio::time::timeout(state.request_timeout, state.queue.submit(task)).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(state.request_timeout)),
    }
}

type TaskFuture = BoxFuture<'static, Result<Vec<u8>, ServiceError>>;

/// Task that makes `variant` resident and runs it on `input`.
fn inference_task(
    state: &AppState,
    family: Family,
    variant: String,
    input: Vec<u8>,
) -> impl FnOnce() -> TaskFuture + Send + 'static {
    let residency = state.residency.clone();
    move || {
        Box::pin(async move {
            residency.ensure(family, &variant).await?;
            let output = residency.run(family, &variant, input).await?;
            Ok::<_, ServiceError>(output)
        })
    }
}

fn png(bytes: Vec<u8>) -> Response {
    ([(CONTENT_TYPE, PNG)], bytes).into_response()
}

async fn next_field_bytes(field: Field<'_>) -> Result<Vec<u8>, ApiError> {
    let name = field.name().unwrap_or_default().to_string();
    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart '{name}' field: {e}")))?;
    Ok(bytes.to_vec())
}

async fn next_field_text(field: Field<'_>) -> Result<String, ApiError> {
    let name = field.name().unwrap_or_default().to_string();
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart '{name}' field: {e}")))
}

fn require_image(image: Option<Vec<u8>>) -> Result<Vec<u8>, ApiError> {
    match image {
        Some(bytes) if !bytes.is_empty() => Ok(bytes),
        Some(_) => Err(ApiError::bad_request("Multipart 'image' field is empty")),
        None => Err(ApiError::bad_request(
            "Missing image in multipart request (expected 'image' file field)",
        )),
    }
}

#[instrument]
pub async fn ping() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[instrument(skip(state))]
pub async fn capabilities(State(state): State<AppState>) -> Json<CapabilitySet> {
    Json(state.oracle.detect())
}

#[instrument(skip(state))]
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(QueueStatus {
        pending: state.queue.pending(),
        accepting: state.queue.is_accepting(),
        resident: ResidentSummary {
            generation: state.residency.state(Family::Generation),
            upscale: state.residency.loaded(Family::Upscale),
            caption: state.residency.loaded(Family::Caption),
        },
    })
}

async fn read_upscale_form(mut multipart: Multipart) -> Result<UpscaleForm, ApiError> {
    let mut image = None;
    let mut scale = UpscaleForm::DEFAULT_SCALE;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart payload: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => image = Some(next_field_bytes(field).await?),
            "scale" => scale = UpscaleForm::parse_scale(&next_field_text(field).await?)?,
            // Accepted for client compatibility; upscaling takes no prompt.
            "prompt" | "negative_prompt" | "seed" | "steps" | "guidance" => {}
            other => debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    Ok(UpscaleForm {
        image: require_image(image)?,
        scale,
    })
}

#[instrument(skip(state, multipart))]
pub async fn upscale(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_upscale_form(multipart).await?;
    state
        .oracle
        .require_upscale(form.scale)
        .map_err(ServiceError::from)?;

    let model = upscale_model(form.scale).unwrap_or(REALESRGAN_X4);
    info!(model = %model, scale = form.scale, bytes = form.image.len(), "Upscaling image");
    let task = inference_task(&state, Family::Upscale, model.to_string(), form.image);
    Ok(png(execute(&state, task).await?))
}

#[instrument(skip(state, request))]
pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    request.validate()?;
    state
        .oracle
        .require_generate(&request.model)
        .map_err(ServiceError::from)?;

    let request = request.normalized();
    let input = serde_json::to_vec(&request)
        .map_err(|e| ApiError::internal(format!("Failed to encode request: {e}")))?;
    info!(model = %request.model, steps = request.steps, width = request.width, height = request.height, "Generating image");

    let task = inference_task(&state, Family::Generation, request.model, input);
    Ok(png(execute(&state, task).await?))
}

async fn read_caption_form(mut multipart: Multipart) -> Result<CaptionForm, ApiError> {
    let mut image = None;
    let mut model = CaptionForm::DEFAULT_MODEL.to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart payload: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => image = Some(next_field_bytes(field).await?),
            "model" => model = CaptionForm::parse_model(&next_field_text(field).await?)?,
            other => debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    Ok(CaptionForm {
        image: require_image(image)?,
        model,
    })
}

#[instrument(skip(state, multipart))]
pub async fn caption(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<CaptionResponse>, ApiError> {
    let form = read_caption_form(multipart).await?;
    state
        .oracle
        .require_caption(&form.model)
        .map_err(ServiceError::from)?;

    info!(model = %form.model, bytes = form.image.len(), "Captioning image");
    let task = inference_task(&state, Family::Caption, form.model.clone(), form.image);
    let output = execute(&state, task).await?;

    Ok(Json(CaptionResponse {
        caption: String::from_utf8_lossy(&output).trim().to_string(),
        model: form.model,
    }))
}
