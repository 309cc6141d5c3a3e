//! The transform layer: detect the uploaded format, decode it under an
//! allocation limit, apply one of the five operations and re-encode. Nothing
//! here knows about HTTP.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::io::{Limits, Reader};
use image::{ColorType, DynamicImage, ImageEncoder, ImageError, ImageFormat, Rgb, RgbImage};
use std::fmt::Debug;
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, info};

/// Quality used by the conversion and resize operations
pub const FULL_QUALITY: Quality = Quality(100);

/// Stem used when the upload carries no usable filename
const FALLBACK_STEM: &str = "image";

/// The resampler's intermediate buffer holds four `f32` channels per pixel
const RESAMPLE_BYTES_PER_PIXEL: u64 = 16;

/// Transparent pixels are composited onto this before JPEG encoding
const JPEG_BACKGROUND: [u8; 3] = [255, 255, 255];

/// Everything that can go wrong between receiving bytes and producing the
/// transformed image
#[derive(Debug, Error)]
pub enum CodecError {
    /// The declared content type is not `image/*`
    #[error("File must be an image")]
    NotAnImage,

    /// The detected format is not the one the operation consumes
    #[error("File must be {}", label(.expected))]
    WrongFormat { expected: ImageFormat },

    /// Detected, but neither JPEG nor PNG
    #[error("Unsupported image format: {0:?}")]
    Unsupported(ImageFormat),

    /// A quality or dimension parameter is out of range
    #[error("{0}")]
    InvalidParameter(String),

    /// The bytes could not be decoded
    #[error("Could not decode image: {0}")]
    Decode(#[source] ImageError),

    /// The encoder failed on a decoded image
    #[error("Failed to encode {}: {source}", label(.format))]
    Encode {
        format: ImageFormat,
        #[source]
        source: ImageError,
    },
}

impl CodecError {
    /// Whether the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        !matches!(self, CodecError::Encode { .. })
    }
}

type Result<T> = std::result::Result<T, CodecError>;

/// Encoder quality, 0 (smallest) to 100 (best)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: i64) -> Result<Self> {
        match u8::try_from(value) {
            Ok(q) if q <= 100 => Ok(Quality(q)),
            _ => Err(CodecError::InvalidParameter(format!(
                "quality must be between 0 and 100, got {value}"
            ))),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The JPEG encoder's scale starts at 1
    fn jpeg(self) -> u8 {
        self.0.max(1)
    }

    /// PNG is lossless, so quality only trades encode time for size
    fn png_compression(self) -> CompressionType {
        match self.0 {
            90..=100 => CompressionType::Fast,
            0..=30 => CompressionType::Best,
            _ => CompressionType::Default,
        }
    }
}

/// Exact resize target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Both sides must lie in `1..=max`
    pub fn new(width: i64, height: i64, max: u32) -> Result<Self> {
        let side = |name: &str, value: i64| match u32::try_from(value) {
            Ok(v) if v >= 1 && v <= max => Ok(v),
            _ => Err(CodecError::InvalidParameter(format!(
                "{name} must be between 1 and {max}, got {value}"
            ))),
        };
        Ok(Dimensions {
            width: side("width", width)?,
            height: side("height", height)?,
        })
    }
}

/// The transforms the service exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    JpegToPng,
    PngToJpeg,
    CompressJpeg(Quality),
    CompressPng(Quality),
    Resize(Dimensions),
}

impl Operation {
    /// The format the operation consumes, or `None` for any supported format
    pub fn source_format(&self) -> Option<ImageFormat> {
        match self {
            Operation::JpegToPng | Operation::CompressJpeg(_) => Some(ImageFormat::Jpeg),
            Operation::PngToJpeg | Operation::CompressPng(_) => Some(ImageFormat::Png),
            Operation::Resize(_) => None,
        }
    }
}

/// A file as received from the client
#[derive(Clone, Default)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

impl Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Upload {{ bytes: <{} bytes>, content_type: {:?}, filename: {:?} }}",
            self.bytes.len(),
            self.content_type,
            self.filename
        )
    }
}

impl Upload {
    /// Whether the client declared an `image/*` content type
    pub fn declares_image(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }

    /// Base name of the upload, without any client-side directory part
    fn basename(&self) -> Option<&str> {
        self.filename
            .as_deref()
            .and_then(|name| name.rsplit(['/', '\\']).next())
            .filter(|name| !name.is_empty())
    }

    /// Everything before the first `.` of the filename
    pub fn stem(&self) -> &str {
        self.basename()
            .and_then(|name| name.split('.').next())
            .filter(|stem| !stem.is_empty())
            .unwrap_or(FALLBACK_STEM)
    }

    /// The original filename, or a fallback carrying the right extension
    fn original_name(&self, format: ImageFormat) -> String {
        match self.basename() {
            Some(name) => name.to_owned(),
            None => format!("{FALLBACK_STEM}.{}", extension(format)),
        }
    }
}

/// The result of a successful transform
#[derive(Debug, Clone)]
pub struct Transformed {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub filename: String,
}

impl Transformed {
    pub fn mime(&self) -> &'static str {
        mime(self.format)
    }
}

/// Human-facing name used in error messages
fn label(format: &ImageFormat) -> &'static str {
    match *format {
        ImageFormat::Jpeg => "JPG",
        ImageFormat::Png => "PNG",
        _ => "a supported image",
    }
}

pub fn mime(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        _ => "application/octet-stream",
    }
}

fn extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Png => "png",
        _ => "bin",
    }
}

/// Validate the upload against the operation, then decode, transform and
/// re-encode it
#[tracing::instrument(skip(upload), fields(filename = ?upload.filename, len = upload.bytes.len()))]
pub fn transform(upload: &Upload, op: Operation, max_decode_alloc: u64) -> Result<Transformed> {
    if !upload.declares_image() {
        return Err(CodecError::NotAnImage);
    }

    // Sniff the real format from the magic bytes
    let detected = image::guess_format(&upload.bytes).map_err(CodecError::Decode)?;
    match op.source_format() {
        Some(expected) if expected != detected => {
            return Err(CodecError::WrongFormat { expected })
        }
        None if !matches!(detected, ImageFormat::Jpeg | ImageFormat::Png) => {
            return Err(CodecError::Unsupported(detected))
        }
        _ => {}
    }

    let img = decode(&upload.bytes, detected, max_decode_alloc)?;
    debug!(
        "decoded {:?} {}x{} {:?}",
        detected,
        img.width(),
        img.height(),
        img.color()
    );

    let transformed = match op {
        Operation::JpegToPng => Transformed {
            bytes: encode_png(&img, FULL_QUALITY)?,
            format: ImageFormat::Png,
            filename: format!("{}.png", upload.stem()),
        },
        Operation::PngToJpeg => Transformed {
            bytes: encode_jpeg(&img, FULL_QUALITY)?,
            format: ImageFormat::Jpeg,
            filename: format!("{}.jpg", upload.stem()),
        },
        Operation::CompressJpeg(quality) => Transformed {
            bytes: encode_jpeg(&img, quality)?,
            format: ImageFormat::Jpeg,
            filename: upload.original_name(ImageFormat::Jpeg),
        },
        Operation::CompressPng(quality) => Transformed {
            bytes: encode_png(&img, quality)?,
            format: ImageFormat::Png,
            filename: upload.original_name(ImageFormat::Png),
        },
        Operation::Resize(dims) => {
            check_resize_budget(&img, dims, max_decode_alloc)?;
            let resized = img.resize_exact(dims.width, dims.height, FilterType::CatmullRom);
            Transformed {
                bytes: encode(&resized, detected, FULL_QUALITY)?,
                format: detected,
                filename: upload.original_name(detected),
            }
        }
    };

    info!(
        "{:?} produced {} ({} bytes)",
        op,
        transformed.filename,
        transformed.bytes.len()
    );
    Ok(transformed)
}

/// Refuse a resize whose output plus intermediate buffer would exceed
/// `max_alloc`
pub fn check_resize_budget(img: &DynamicImage, dims: Dimensions, max_alloc: u64) -> Result<()> {
    let output = dims.width as u64 * dims.height as u64 * img.color().bytes_per_pixel() as u64;
    // The vertical pass runs first, over the source width
    let intermediate = img.width() as u64 * dims.height as u64 * RESAMPLE_BYTES_PER_PIXEL;
    let needed = output.saturating_add(intermediate);

    if needed > max_alloc {
        return Err(CodecError::InvalidParameter(format!(
            "resizing to {}x{} needs {needed} bytes, more than the {max_alloc} byte limit",
            dims.width, dims.height
        )));
    }
    Ok(())
}

/// Decode `bytes` as `format`, refusing to allocate more than `max_alloc`
pub fn decode(bytes: &[u8], format: ImageFormat, max_alloc: u64) -> Result<DynamicImage> {
    let mut limits = Limits::default();
    limits.max_alloc = Some(max_alloc);

    let mut reader = Reader::with_format(Cursor::new(bytes), format);
    reader.limits(limits);
    reader.decode().map_err(CodecError::Decode)
}

/// Encode in `format`, which must be JPEG or PNG
pub fn encode(img: &DynamicImage, format: ImageFormat, quality: Quality) -> Result<Vec<u8>> {
    match format {
        ImageFormat::Jpeg => encode_jpeg(img, quality),
        ImageFormat::Png => encode_png(img, quality),
        other => Err(CodecError::Unsupported(other)),
    }
}

/// Encode as baseline JPEG. Grayscale stays grayscale; everything else is
/// flattened to 8-bit RGB
pub fn encode_jpeg(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.jpeg());

    let res = match img {
        DynamicImage::ImageLuma8(gray) => {
            encoder.write_image(gray.as_raw(), gray.width(), gray.height(), ColorType::L8)
        }
        _ => {
            let rgb = flatten(img);
            encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        }
    };
    res.map_err(|source| CodecError::Encode {
        format: ImageFormat::Jpeg,
        source,
    })?;

    Ok(buf.into_inner())
}

/// Encode as PNG in the image's own color type
pub fn encode_png(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder =
        PngEncoder::new_with_quality(&mut buf, quality.png_compression(), PngFilter::Adaptive);

    encoder
        .write_image(img.as_bytes(), img.width(), img.height(), img.color())
        .map_err(|source| CodecError::Encode {
            format: ImageFormat::Png,
            source,
        })?;

    Ok(buf.into_inner())
}

/// Drop the alpha channel by compositing onto the JPEG background
pub fn flatten(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8, bg: u8| {
            let (c, bg, a) = (c as u32, bg as u32, a as u32);
            ((c * a + bg * (255 - a) + 127) / 255) as u8
        };
        Rgb([
            blend(r, JPEG_BACKGROUND[0]),
            blend(g, JPEG_BACKGROUND[1]),
            blend(b, JPEG_BACKGROUND[2]),
        ])
    })
}
