//! The job submission endpoint: one request in, one NDJSON stream out.

use std::convert::Infallible;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{Json, State},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::application::error::HttpError;
use crate::application::progress::{ProgressEvent, progress_channel};

use super::HttpState;

const STREAM_CONTENT_TYPE: &str = "application/x-ndjson";
const EVENT_BUFFER: usize = 32;

#[derive(Debug, Deserialize)]
pub(super) struct RenderRequest {
    #[serde(default)]
    code: String,
}

/// Accept a scene submission and stream its lifecycle. Input problems are
/// rejected before any streaming starts; once the body begins, every
/// failure travels as the stream's terminal `error` event instead.
pub(super) async fn submit(
    State(state): State<HttpState>,
    Json(request): Json<RenderRequest>,
) -> Result<Response, HttpError> {
    if request.code.trim().is_empty() {
        return Err(HttpError::new(
            "infra::http::render::submit",
            StatusCode::BAD_REQUEST,
            "No code provided",
            "request body carried no scene code",
        ));
    }

    info!(
        target = "infra::http::render",
        code_bytes = request.code.len(),
        "accepted render submission"
    );

    let (sender, receiver) = progress_channel(EVENT_BUFFER);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.run(request.code, sender).await;
    });

    let mut response = Body::from_stream(ndjson_stream(receiver)).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE));
    Ok(response)
}

/// Encode events as one JSON object per line. The receiver closes right
/// after the terminal event, which ends the chunked body.
fn ndjson_stream(
    mut receiver: mpsc::Receiver<ProgressEvent>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
    stream! {
        while let Some(event) = receiver.recv().await {
            match serde_json::to_string(&event) {
                Ok(mut line) => {
                    line.push('\n');
                    yield Ok(Bytes::from(line));
                }
                Err(err) => {
                    error!(
                        target = "infra::http::render",
                        error = %err,
                        "failed to encode progress event"
                    );
                }
            }
        }
    }
}
