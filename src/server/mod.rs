//! The HTTP front end: error-to-response mapping, the CORS policy and route
//! registration. Handlers live in [`routes`].

use crate::codec::CodecError;
use actix_cors::Cors;
use actix_multipart::MultipartError;
use actix_web::http::header::{self, ContentType};
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, warn};

pub mod protocol;
pub mod routes;

/// Preflight responses may be cached this long, in seconds
const CORS_MAX_AGE: usize = 3600;

/// Every failure a handler can report. Client mistakes render as 400,
/// everything else as 500.
#[derive(Debug, Error)]
pub enum WebError {
    /// Malformed request: bad multipart body, missing field, bad parameter
    #[error("{0}")]
    InvalidInput(String),

    /// Validation, decode or encode failure from the codec
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Anything on the server side
    #[error("{0}")]
    Internal(String),
}

impl WebError {
    /// The text placed in the `detail` field of the response
    pub fn detail(&self) -> String {
        if self.status_code().is_server_error() {
            format!("An error occurred: {self}")
        } else {
            self.to_string()
        }
    }
}

impl ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {self}");
        } else {
            warn!("rejected request: {self}");
        }

        HttpResponse::build(status)
            .insert_header(ContentType::json())
            .json(protocol::ErrorBody {
                detail: self.detail(),
            })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            WebError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            WebError::Codec(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            WebError::Codec(_) | WebError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartError> for WebError {
    fn from(err: MultipartError) -> Self {
        WebError::InvalidInput(format!("Invalid multipart body: {err}"))
    }
}

impl From<JoinError> for WebError {
    fn from(err: JoinError) -> Self {
        WebError::Internal(format!("image worker failed: {err}"))
    }
}

/// Any origin, method and header, with credentials. `Content-Disposition` is
/// exposed so browsers can read the download name.
pub fn cors() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allow_any_method()
        .allow_any_header()
        .supports_credentials()
        .expose_headers([header::CONTENT_DISPOSITION])
        .max_age(CORS_MAX_AGE)
}

/// Register every route on `cfg`. Malformed query strings are reported in the
/// same JSON shape as every other error.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        WebError::InvalidInput(format!("Invalid query string: {err}")).into()
    }))
    .service(routes::jpg_to_png)
    .service(routes::png_to_jpg)
    .service(routes::compress_jpg)
    .service(routes::compress_png)
    .service(routes::resize)
    .service(routes::health);
}
