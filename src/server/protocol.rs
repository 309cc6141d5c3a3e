use super::WebError;
use crate::codec::Upload;
use actix_multipart::{Field, Multipart};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_stream::StreamExt;
use tracing::debug;

/// Multipart field carrying the image
pub const FILE_FIELD: &str = "file";

/// Text fields read as parameters; any other field is drained and dropped
const PARAM_FIELDS: [&str; 3] = ["quality", "width", "height"];

/// Parameter values longer than this are rejected
const MAX_TEXT_FIELD: usize = 64;

/// The file plus every parameter, with room for a few extras
const MAX_FIELDS: usize = 8;

/// JSON body of every error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

/// Query parameters of the compress routes
#[derive(Debug, Default, Deserialize)]
pub struct QualityQuery {
    pub quality: Option<i64>,
}

/// Query parameters of the resize route
#[derive(Debug, Default, Deserialize)]
pub struct ResizeQuery {
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// A parsed multipart request: the image plus any text fields sent beside it
#[derive(Debug)]
pub struct UploadForm {
    pub upload: Upload,
    fields: HashMap<String, String>,
}

impl UploadForm {
    /// Resolve an integer parameter. A form field of the same name wins over
    /// the query string.
    pub fn param(&self, name: &str, query: Option<i64>) -> Result<Option<i64>, WebError> {
        match self.fields.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| WebError::InvalidInput(format!("{name} must be an integer, got {raw:?}"))),
            None => Ok(query),
        }
    }
}

/// Read one field to the end, failing once it passes `limit` bytes
async fn read_field(field: &mut Field, limit: usize, max_bytes: usize) -> Result<Vec<u8>, WebError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Err(WebError::InvalidInput(format!(
                "Upload exceeds the maximum upload size of {max_bytes} bytes"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Drain a multipart payload, keeping the `file` field and the known
/// parameter fields. Every field counts against `max_bytes`, and at most
/// `MAX_FIELDS` fields are read.
pub async fn read_upload(mut payload: Multipart, max_bytes: usize) -> Result<UploadForm, WebError> {
    let mut upload = None;
    let mut fields = HashMap::new();
    let mut received = 0;
    let mut count = 0;

    while let Some(field) = payload.next().await {
        count += 1;
        if count > MAX_FIELDS {
            return Err(WebError::InvalidInput(format!(
                "Too many form fields, at most {MAX_FIELDS} are accepted"
            )));
        }

        let mut field = field?;
        let disposition = field.content_disposition().clone();
        let name = disposition.get_name().unwrap_or_default().to_owned();
        let value = read_field(&mut field, max_bytes - received, max_bytes).await?;
        received += value.len();

        if name == FILE_FIELD {
            if upload.is_some() {
                return Err(WebError::InvalidInput(format!(
                    "Only one {FILE_FIELD:?} field is accepted"
                )));
            }
            let content_type = field.content_type().map(|mime| mime.essence_str().to_owned());
            let filename = disposition.get_filename().map(str::to_owned);

            debug!(
                "received {} ({} bytes, {:?})",
                filename.as_deref().unwrap_or("<unnamed>"),
                value.len(),
                content_type
            );
            upload = Some(Upload {
                bytes: value,
                content_type,
                filename,
            });
        } else if PARAM_FIELDS.contains(&name.as_str()) {
            if value.len() > MAX_TEXT_FIELD {
                return Err(WebError::InvalidInput(format!("Field {name:?} is too long")));
            }
            let value = String::from_utf8(value)
                .map_err(|_| WebError::InvalidInput(format!("Field {name:?} is not valid UTF-8")))?;
            fields.insert(name, value);
        } else {
            debug!("ignoring form field {name:?} ({} bytes)", value.len());
        }
    }

    let upload = upload
        .ok_or_else(|| WebError::InvalidInput(format!("Missing upload field {FILE_FIELD:?}")))?;
    Ok(UploadForm { upload, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(fields: &[(&str, &str)]) -> UploadForm {
        UploadForm {
            upload: Upload::default(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_param_falls_back_to_query() {
        let f = form(&[]);
        assert_eq!(f.param("quality", Some(70)).unwrap(), Some(70));
        assert_eq!(f.param("quality", None).unwrap(), None);
    }

    #[test]
    fn test_form_field_wins() {
        let f = form(&[("width", " 320 ")]);
        assert_eq!(f.param("width", Some(10)).unwrap(), Some(320));
    }

    #[test]
    fn test_non_integer_field() {
        let f = form(&[("quality", "high")]);
        let err = f.param("quality", None).unwrap_err();
        assert!(matches!(err, WebError::InvalidInput(_)));
        assert_eq!(err.to_string(), "quality must be an integer, got \"high\"");
    }
}
