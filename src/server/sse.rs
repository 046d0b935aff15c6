use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};

use crate::error::{CodecError, RunError};
use crate::protocol::{Envelope, encode, error_frame};
use crate::run::{RunController, RunStream};

/// Encode a run stream into wire frames.
///
/// If an envelope cannot be encoded, the run is failed, a fallback `error`
/// frame is written and the body ends.
pub fn frames<F>(
    controller: RunController,
    stream: RunStream,
    encoder: F,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    F: Fn(&Envelope) -> Result<String, CodecError> + Send + 'static,
{
    async_stream::stream! {
        let run_id = stream.run_id().to_string();
        let mut stream = stream;
        while let Some(envelope) = stream.next().await {
            match encoder(&envelope) {
                Ok(frame) => yield Ok::<Bytes, Infallible>(Bytes::from(frame)),
                Err(err) => {
                    let err = RunError::from(err);
                    let message = err.to_string();
                    tracing::error!(run_id = %run_id, error = %message, "envelope encoding failed");
                    controller.fail(&run_id, &message, err.code());
                    yield Ok::<Bytes, Infallible>(Bytes::from(error_frame(&run_id, &message, err.code())));
                    break;
                }
            }
        }
    }
}

/// `text/event-stream` response carrying the run's envelopes.
pub fn sse_response(controller: RunController, stream: RunStream) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        "x-run-id",
        HeaderValue::from_str(stream.run_id()).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    let body = Body::from_stream(frames(controller, stream, encode));
    (headers, body).into_response()
}
