//! `multipart/related` body writer.
//!
//! Used for documents fetched with `attachments=true`: the first part is the
//! JSON document, followed by one part per attachment.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

#[derive(Debug, Clone)]
struct Part {
    headers: Vec<(String, String)>,
    body: Bytes,
}

/// Accumulates parts and renders the final body.
#[derive(Debug, Clone)]
pub struct MultipartWriter {
    subtype: String,
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartWriter {
    /// New writer with a random boundary.
    pub fn new(subtype: &str) -> Self {
        Self {
            subtype: subtype.to_string(),
            boundary: uuid::Uuid::new_v4().simple().to_string(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/{}; boundary=\"{}\"", self.subtype, self.boundary)
    }

    pub fn add_part(&mut self, headers: Vec<(String, String)>, body: Bytes) {
        self.parts.push(Part { headers, body });
    }

    /// Add the JSON document part.
    pub fn add_json(&mut self, value: &Value) {
        let body = Bytes::from(value.to_string());
        self.add_part(
            vec![("Content-Type".to_string(), "application/json".to_string())],
            body,
        );
    }

    /// Add one attachment part.
    pub fn add_attachment(&mut self, name: &str, content_type: &str, data: Bytes) {
        self.add_part(
            vec![
                (
                    "Content-Disposition".to_string(),
                    format!("attachment; filename=\"{}\"", name),
                ),
                ("Content-Type".to_string(), content_type.to_string()),
            ],
            data,
        );
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Render the complete body.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        for part in &self.parts {
            out.put_slice(b"--");
            out.put_slice(self.boundary.as_bytes());
            out.put_slice(b"\r\n");
            for (name, value) in &part.headers {
                out.put_slice(name.as_bytes());
                out.put_slice(b": ");
                out.put_slice(value.as_bytes());
                out.put_slice(b"\r\n");
            }
            out.put_slice(b"\r\n");
            out.put_slice(&part.body);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"--");
        out.put_slice(self.boundary.as_bytes());
        out.put_slice(b"--");
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_parts() {
        let mut writer = MultipartWriter::new("related");
        writer.add_json(&json!({"_id": "doc"}));
        writer.add_attachment("a.txt", "text/plain", Bytes::from_static(b"hello"));

        let boundary = writer.boundary().to_string();
        let body = String::from_utf8(writer.to_bytes().to_vec()).unwrap();

        assert!(writer.content_type().starts_with("multipart/related; boundary="));
        assert_eq!(body.matches(&format!("--{}\r\n", boundary)).count(), 2);
        assert!(body.contains("Content-Type: application/json\r\n\r\n{\"_id\":\"doc\"}\r\n"));
        assert!(body.contains("filename=\"a.txt\""));
        assert!(body.ends_with(&format!("--{}--", boundary)));
    }
}
