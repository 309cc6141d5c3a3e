//! The five transform routes plus a health probe. Each handler reads the
//! upload, resolves its parameters and hands the codec work to the blocking
//! pool.

use super::protocol::{self, QualityQuery, ResizeQuery, UploadForm};
use super::WebError;
use crate::codec::{self, Dimensions, Operation, Quality, Transformed};
use crate::config::{Settings, DEFAULT_HEIGHT, DEFAULT_QUALITY, DEFAULT_WIDTH};
use actix_multipart::Multipart;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{get, post, web, HttpResponse, Responder};
use tracing::info;

type Result<T> = std::result::Result<T, WebError>;

/// Run `op` on the blocking pool and wrap the output as an attachment
async fn respond(form: UploadForm, op: Operation, settings: &Settings) -> Result<HttpResponse> {
    let max_alloc = settings.max_decode_alloc;
    let upload = form.upload;
    let out: Transformed =
        tokio::task::spawn_blocking(move || codec::transform(&upload, op, max_alloc)).await??;

    info!("serving {} as {}", out.filename, out.mime());

    Ok(HttpResponse::Ok()
        .content_type(out.mime())
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(out.filename)],
        })
        .body(out.bytes))
}

fn resolve_quality(form: &UploadForm, query: &QualityQuery) -> Result<Quality> {
    let value = form.param("quality", query.quality)?.unwrap_or(DEFAULT_QUALITY);
    Ok(Quality::new(value)?)
}

#[post("/convert/jpg-to-png")]
pub async fn jpg_to_png(payload: Multipart, settings: web::Data<Settings>) -> Result<HttpResponse> {
    let form = protocol::read_upload(payload, settings.max_upload_bytes).await?;
    respond(form, Operation::JpegToPng, &settings).await
}

#[post("/convert/png-to-jpg")]
pub async fn png_to_jpg(payload: Multipart, settings: web::Data<Settings>) -> Result<HttpResponse> {
    let form = protocol::read_upload(payload, settings.max_upload_bytes).await?;
    respond(form, Operation::PngToJpeg, &settings).await
}

#[post("/compress/jpg")]
pub async fn compress_jpg(
    payload: Multipart,
    query: web::Query<QualityQuery>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse> {
    let form = protocol::read_upload(payload, settings.max_upload_bytes).await?;
    let quality = resolve_quality(&form, &query)?;
    respond(form, Operation::CompressJpeg(quality), &settings).await
}

#[post("/compress/png")]
pub async fn compress_png(
    payload: Multipart,
    query: web::Query<QualityQuery>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse> {
    let form = protocol::read_upload(payload, settings.max_upload_bytes).await?;
    let quality = resolve_quality(&form, &query)?;
    respond(form, Operation::CompressPng(quality), &settings).await
}

/// Resize to exactly `width`x`height`; aspect ratio is not preserved
#[post("/resize")]
pub async fn resize(
    payload: Multipart,
    query: web::Query<ResizeQuery>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse> {
    let form = protocol::read_upload(payload, settings.max_upload_bytes).await?;
    let width = form.param("width", query.width)?.unwrap_or(DEFAULT_WIDTH);
    let height = form.param("height", query.height)?.unwrap_or(DEFAULT_HEIGHT);
    let dims = Dimensions::new(width, height, settings.max_dimension)?;
    respond(form, Operation::Resize(dims), &settings).await
}

/// Liveness probe
#[get("/health")]
pub async fn health() -> impl Responder {
    web::Json(protocol::Health { status: "ok" })
}
