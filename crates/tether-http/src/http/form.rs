//! Form bodies: URL-encoded or multipart.
//!
//! A [`FormPost`] keeps its fields in insertion order. Setting a key that is
//! already present replaces that entry where it stands. A form with no file
//! fields is sent as `application/x-www-form-urlencoded`; as soon as one file
//! is present the whole form is sent as `multipart/form-data`, with file
//! contents streamed from disk.
//!
//! ```ignore
//! let mut form = FormPost::new();
//! form.set_value("title", "holiday");
//! form.set_file("photo", "/tmp/beach.jpg");
//!
//! let operation = Request::post("https://example.com/upload")
//!     .form(form)
//!     .start(|response| println!("{}", response.status()))?;
//! ```

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::NetworkError;
use crate::transport::TransportBody;

const URL_ENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, PartialEq, Eq)]
enum FormValue {
    Text(String),
    File(PathBuf),
}

/// An ordered set of form fields and files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormPost {
    fields: Vec<(String, FormValue)>,
}

impl FormPost {
    /// Create an empty form.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a text field, replacing an existing field with the same key.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(key.into(), FormValue::Text(value.into()));
        self
    }

    /// Set a file field, replacing an existing field with the same key.
    pub fn set_file(&mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> &mut Self {
        self.set(key.into(), FormValue::File(path.into()));
        self
    }

    fn set(&mut self, key: String, value: FormValue) {
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Remove a field. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(k, _)| k != key);
        self.fields.len() != before
    }

    /// The text value for `key`, if it is a text field.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.fields.iter().find_map(|(k, v)| match v {
            FormValue::Text(text) if k == key => Some(text.as_str()),
            _ => None,
        })
    }

    /// The file path for `key`, if it is a file field.
    pub fn file(&self, key: &str) -> Option<&Path> {
        self.fields.iter().find_map(|(k, v)| match v {
            FormValue::File(path) if k == key => Some(path.as_path()),
            _ => None,
        })
    }

    /// Field keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the form has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether any field is a file, which makes the form multipart.
    pub fn has_files(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, v)| matches!(v, FormValue::File(_)))
    }

    /// Encode the form into a body and its content type.
    ///
    /// Files are opened here; a missing or unreadable file is a
    /// [`NetworkError::BodyStream`].
    pub fn encode(&self) -> Result<EncodedForm, NetworkError> {
        if self.has_files() {
            self.encode_multipart(&new_boundary())
        } else {
            Ok(self.encode_urlencoded())
        }
    }

    fn encode_urlencoded(&self) -> EncodedForm {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.fields {
            if let FormValue::Text(text) = value {
                serializer.append_pair(key, text);
            }
        }
        let body = Bytes::from(serializer.finish());
        EncodedForm {
            content_type: URL_ENCODED.to_string(),
            length: body.len() as u64,
            body: TransportBody::Bytes(body),
        }
    }

    fn encode_multipart(&self, boundary: &str) -> Result<EncodedForm, NetworkError> {
        let mut parts: VecDeque<Box<dyn Read + Send>> = VecDeque::new();
        let mut length = 0u64;

        for (key, value) in &self.fields {
            match value {
                FormValue::Text(text) => {
                    length += push_text(
                        &mut parts,
                        format!(
                            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{text}\r\n",
                            escape_quoted(key)
                        ),
                    );
                }
                FormValue::File(path) => {
                    let file = File::open(path).map_err(|e| {
                        NetworkError::BodyStream(format!("{}: {e}", path.display()))
                    })?;
                    let size = file
                        .metadata()
                        .map_err(|e| NetworkError::BodyStream(format!("{}: {e}", path.display())))?
                        .len();
                    let filename = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    length += push_text(
                        &mut parts,
                        format!(
                            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                            escape_quoted(key),
                            escape_quoted(&filename),
                            guess_content_type(path)
                        ),
                    );
                    parts.push_back(Box::new(file.take(size)));
                    length += size;
                    length += push_text(&mut parts, "\r\n".to_string());
                }
            }
        }
        length += push_text(&mut parts, format!("--{boundary}--\r\n"));

        Ok(EncodedForm {
            content_type: format!("multipart/form-data; boundary={boundary}"),
            length,
            body: TransportBody::Reader {
                reader: Box::new(ChainedReader { parts }),
                length: Some(length),
            },
        })
    }
}

/// A form turned into bytes on the wire.
#[derive(Debug)]
pub struct EncodedForm {
    /// `Content-Type` to send, including the multipart boundary.
    pub content_type: String,
    /// Exact body length.
    pub length: u64,
    /// The body.
    pub body: TransportBody,
}

struct ChainedReader {
    parts: VecDeque<Box<dyn Read + Send>>,
}

impl Read for ChainedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while let Some(part) = self.parts.front_mut() {
            let n = part.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.parts.pop_front();
        }
        Ok(0)
    }
}

fn push_text(parts: &mut VecDeque<Box<dyn Read + Send>>, text: String) -> u64 {
    let len = text.len() as u64;
    parts.push_back(Box::new(Cursor::new(text.into_bytes())));
    len
}

fn new_boundary() -> String {
    format!(
        "tether-{:016x}{:016x}",
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Percent-escape a string for use in a URL query or form body.
///
/// Spaces become `+`, as in `application/x-www-form-urlencoded`.
pub fn percent_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Guess a MIME type from a path's extension; `application/octet-stream`
/// when unknown.
pub fn guess_content_type(path: impl AsRef<Path>) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(body: TransportBody) -> Vec<u8> {
        match body {
            TransportBody::Bytes(bytes) => bytes.to_vec(),
            TransportBody::Reader { mut reader, .. } => {
                let mut out = Vec::new();
                reader.read_to_end(&mut out).unwrap();
                out
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut form = FormPost::new();
        form.set_value("a", "1").set_value("b", "2").set_value("a", "3");
        assert_eq!(form.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(form.value("a"), Some("3"));

        form.set_file("b", "/tmp/x.txt");
        assert_eq!(form.value("b"), None);
        assert_eq!(form.file("b"), Some(Path::new("/tmp/x.txt")));
        assert_eq!(form.len(), 2);
        assert!(form.remove("a"));
        assert!(!form.remove("a"));
    }

    #[test]
    fn test_urlencoded() {
        let mut form = FormPost::new();
        form.set_value("name", "John Smith").set_value("q", "a&b=c");
        let encoded = form.encode().unwrap();
        assert_eq!(encoded.content_type, "application/x-www-form-urlencoded");
        let body = read_all(encoded.body);
        assert_eq!(body, b"name=John+Smith&q=a%26b%3Dc");
        assert_eq!(encoded.length, body.len() as u64);
    }

    #[test]
    fn test_multipart_layout_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"file contents")
            .unwrap();

        let mut form = FormPost::new();
        form.set_value("title", "hello").set_file("upload", &path);
        let encoded = form.encode_multipart("XYZ").unwrap();
        assert_eq!(encoded.content_type, "multipart/form-data; boundary=XYZ");

        let length = encoded.length;
        let body = String::from_utf8(read_all(encoded.body)).unwrap();
        assert_eq!(body.len() as u64, length);
        assert_eq!(
            body,
            "--XYZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n\
             --XYZ\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nfile contents\r\n--XYZ--\r\n"
        );
    }

    #[test]
    fn test_multipart_boundary_is_random() {
        assert_ne!(new_boundary(), new_boundary());
    }

    #[test]
    fn test_missing_file_is_body_stream_error() {
        let mut form = FormPost::new();
        form.set_file("upload", "/definitely/not/here.bin");
        assert!(matches!(form.encode(), Err(NetworkError::BodyStream(_))));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(percent_escape("a b&c"), "a+b%26c");
        assert_eq!(guess_content_type("photo.png"), "image/png");
        assert_eq!(guess_content_type("blob.unknownext"), "application/octet-stream");
    }
}
