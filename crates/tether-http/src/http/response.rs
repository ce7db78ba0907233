//! Responses and the assembler that builds them.

use std::any::Any;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use tempfile::TempPath;
use tether_core::logging::targets;
use url::Url;

use crate::error::{Error, HttpError, NetworkError, Result};

/// Opaque data attached to a request and handed back on its response.
pub type UserInfo = Arc<dyn Any + Send + Sync>;

/// Progress information for uploads and downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    /// Number of bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total number of bytes, if known.
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    /// Get the progress as a fraction (0.0 to 1.0), if total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                (self.bytes_transferred as f64 / total as f64).min(1.0)
            }
        })
    }

    /// Get the progress as a percentage (0 to 100), if total is known.
    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0).min(100.0) as u8)
    }
}

enum ResponseBody {
    Empty,
    Memory(Bytes),
    File(TempPath),
}

/// The outcome of one operation.
///
/// Exactly one of the memory body and the file body can be populated, chosen
/// by the request's save-to-file flag. `http_error` and `network_error` are
/// never both set.
pub struct Response {
    status: u16,
    headers: HeaderMap,
    url: Option<Url>,
    body: ResponseBody,
    encoding: &'static Encoding,
    http_error: Option<HttpError>,
    network_error: Option<NetworkError>,
    cancelled: bool,
    user_info: Option<UserInfo>,
}

impl Response {
    /// The HTTP status code, or 0 if no response arrived.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is 2xx and nothing failed.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error().is_none() && !self.cancelled
    }

    /// All response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The URL the response came from, after redirects.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// The in-memory body. Empty for file responses.
    pub fn data(&self) -> &[u8] {
        match &self.body {
            ResponseBody::Memory(bytes) => bytes,
            _ => &[],
        }
    }

    /// The in-memory body as shared bytes, if the body is held in memory.
    pub fn bytes(&self) -> Option<Bytes> {
        match &self.body {
            ResponseBody::Memory(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// The in-memory body decoded as text.
    ///
    /// Uses the `charset` of `Content-Type`, else the request's encoding
    /// (UTF-8 unless configured). Empty for file responses.
    pub fn response_string(&self) -> String {
        let ResponseBody::Memory(bytes) = &self.body else {
            return String::new();
        };
        let encoding = self
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .and_then(|mime| {
                mime.get_param(mime::CHARSET)
                    .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
            })
            .unwrap_or(self.encoding);
        let (text, _, _) = encoding.decode(bytes);
        text.into_owned()
    }

    /// Path of the temporary file holding the body, for file responses.
    ///
    /// The file is deleted when the response is dropped unless it was moved
    /// with [`move_file_to`](Self::move_file_to).
    pub fn file_path(&self) -> Option<&Path> {
        match &self.body {
            ResponseBody::File(path) => Some(path.as_ref()),
            _ => None,
        }
    }

    /// Move the body file to `destination`.
    ///
    /// Without `create_intermediates` a missing parent directory is an error
    /// and nothing is created. On success the response no longer owns a file.
    pub fn move_file_to(
        &mut self,
        destination: impl AsRef<Path>,
        create_intermediates: bool,
    ) -> Result<()> {
        let destination = destination.as_ref();
        let fail = |message: String| Error::FileMove {
            path: destination.to_path_buf(),
            message,
        };

        if !matches!(self.body, ResponseBody::File(_)) {
            return Err(fail("response has no file body".to_string()));
        }

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
            && !parent.is_dir()
        {
            if !create_intermediates {
                return Err(fail(format!(
                    "directory {} does not exist",
                    parent.display()
                )));
            }
            std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
        }

        let ResponseBody::File(temp) = std::mem::replace(&mut self.body, ResponseBody::Empty)
        else {
            return Err(fail("response has no file body".to_string()));
        };

        match temp.persist(destination) {
            Ok(()) => Ok(()),
            Err(err) if err.error.kind() == std::io::ErrorKind::CrossesDevices => {
                let temp = err.path;
                match std::fs::copy(&temp, destination) {
                    Ok(_) => Ok(()),
                    Err(copy_err) => {
                        let _ = std::fs::remove_file(destination);
                        self.body = ResponseBody::File(temp);
                        Err(fail(copy_err.to_string()))
                    }
                }
            }
            Err(err) => {
                self.body = ResponseBody::File(err.path);
                Err(fail(err.error.to_string()))
            }
        }
    }

    /// The final HTTP status error, for statuses of 300 and above.
    pub fn http_error(&self) -> Option<&HttpError> {
        self.http_error.as_ref()
    }

    /// The transport-level error, if the operation failed.
    pub fn network_error(&self) -> Option<&NetworkError> {
        self.network_error.as_ref()
    }

    /// `http_error` if set, else `network_error`.
    pub fn error(&self) -> Option<Error> {
        self.http_error
            .clone()
            .map(Error::Http)
            .or_else(|| self.network_error.clone().map(Error::Network))
    }

    /// Whether the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The request's user data.
    pub fn user_info(&self) -> Option<&UserInfo> {
        self.user_info.as_ref()
    }

    /// The request's user data, if it is a `T`.
    pub fn user_info_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_info.as_deref().and_then(|info| info.downcast_ref())
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            ResponseBody::Empty => "empty".to_string(),
            ResponseBody::Memory(bytes) => format!("{} bytes", bytes.len()),
            ResponseBody::File(path) => format!("file {}", path.display()),
        };
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("body", &body)
            .field("http_error", &self.http_error)
            .field("network_error", &self.network_error)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

enum Sink {
    Memory(BytesMut),
    File { file: File, path: TempPath },
}

/// Accumulates status, headers and body for one operation.
pub(crate) struct ResponseAssembler {
    status: u16,
    headers: HeaderMap,
    url: Option<Url>,
    sink: Sink,
    received: u64,
    encoding: &'static Encoding,
    user_info: Option<UserInfo>,
}

impl ResponseAssembler {
    /// Create an assembler with a memory sink, or a temporary file sink.
    pub(crate) fn new(
        save_to_file: bool,
        encoding: &'static Encoding,
        user_info: Option<UserInfo>,
    ) -> std::result::Result<Self, NetworkError> {
        let sink = if save_to_file {
            let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
            tracing::trace!(target: targets::RESPONSE, path = %path.display(), "response file created");
            Sink::File { file, path }
        } else {
            Sink::Memory(BytesMut::new())
        };
        Ok(Self {
            status: 0,
            headers: HeaderMap::new(),
            url: None,
            sink,
            received: 0,
            encoding,
            user_info,
        })
    }

    /// Discard anything recorded by a previous attempt.
    pub(crate) fn reset(&mut self) -> std::result::Result<(), NetworkError> {
        self.status = 0;
        self.headers.clear();
        self.received = 0;
        match &mut self.sink {
            Sink::Memory(buf) => buf.clear(),
            Sink::File { file, .. } => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
            }
        }
        Ok(())
    }

    pub(crate) fn set_url(&mut self, url: Url) {
        self.url = Some(url);
    }

    pub(crate) fn set_head(&mut self, status: u16, headers: HeaderMap) {
        self.status = status;
        self.headers = headers;
    }

    /// Append a body chunk to the sink.
    pub(crate) fn append(&mut self, chunk: &[u8]) -> std::result::Result<(), NetworkError> {
        match &mut self.sink {
            Sink::Memory(buf) => buf.extend_from_slice(chunk),
            Sink::File { file, .. } => file.write_all(chunk)?,
        }
        self.received += chunk.len() as u64;
        Ok(())
    }

    /// Body bytes received so far.
    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    /// A response carrying only what is known when headers arrive.
    pub(crate) fn partial(&self) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            url: self.url.clone(),
            body: ResponseBody::Empty,
            encoding: self.encoding,
            http_error: None,
            network_error: None,
            cancelled: false,
            user_info: self.user_info.clone(),
        }
    }

    /// Freeze a completed response. A status of 300 or above becomes `http_error`.
    pub(crate) fn finish(self) -> Response {
        let http_error = (self.status >= 300).then(|| HttpError::from_status(self.status));
        let body = match self.sink {
            Sink::Memory(buf) if buf.is_empty() => ResponseBody::Empty,
            Sink::Memory(buf) => ResponseBody::Memory(buf.freeze()),
            Sink::File { mut file, path } => {
                if let Err(err) = file.flush() {
                    tracing::warn!(target: targets::RESPONSE, error = %err, "failed to flush response file");
                }
                ResponseBody::File(path)
            }
        };
        Response {
            status: self.status,
            headers: self.headers,
            url: self.url,
            body,
            encoding: self.encoding,
            http_error,
            network_error: None,
            cancelled: false,
            user_info: self.user_info,
        }
    }

    /// Freeze a failed response. The body is discarded.
    pub(crate) fn fail(self, error: NetworkError) -> Response {
        let mut response = self.partial();
        response.network_error = Some(error);
        response
    }

    /// Freeze a cancelled response. The body is discarded.
    pub(crate) fn cancel(self) -> Response {
        let mut response = self.partial();
        response.cancelled = true;
        response
    }

    /// A response for an operation that never got an assembler.
    pub(crate) fn detached(
        network_error: Option<NetworkError>,
        cancelled: bool,
        user_info: Option<UserInfo>,
    ) -> Response {
        Response {
            status: 0,
            headers: HeaderMap::new(),
            url: None,
            body: ResponseBody::Empty,
            encoding: encoding_rs::UTF_8,
            http_error: None,
            network_error,
            cancelled,
            user_info,
        }
    }
}
