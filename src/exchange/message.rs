use bytes::Bytes;
use fnv::FnvBuildHasher;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub type HeaderValue = Value;

/// Header map with case-insensitive lookup.
///
/// Names are matched ignoring ASCII case, the spelling used by the latest write is kept
/// for iteration. Writing an existing name replaces its value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, (String, HeaderValue), FnvBuildHasher>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn fold(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Option<HeaderValue> {
        let name = name.into();
        self.entries
            .insert(Self::fold(&name), (name, value.into()))
            .map(|(_, previous)| previous)
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries.get(&Self::fold(name)).map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HeaderValue> {
        self.entries
            .get_mut(&Self::fold(name))
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.entries
            .remove(&Self::fold(name))
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&Self::fold(name))
    }

    /// Iterates with the original spelling of each header name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Payload of a message.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(Value),
    /// Any other carried type. Cloned by reference.
    Object(Arc<dyn Any + Send + Sync>),
}

impl Body {
    pub fn object<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Body::Object(Arc::new(value))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Text(text) => text.is_empty(),
            Body::Bytes(bytes) => bytes.is_empty(),
            Body::Json(value) => value.is_null(),
            Body::Object(_) => false,
        }
    }

    /// Text view of the body. Binary bodies are returned only when they are valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            Body::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Binary view of the body. `Object` bodies have no binary representation.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Body::Empty => Some(Bytes::new()),
            Body::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Body::Bytes(bytes) => Some(bytes.clone()),
            Body::Json(value) => serde_json::to_vec(value).ok().map(Bytes::from),
            Body::Object(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: Any,
    {
        match self {
            Body::Object(value) => (**value).downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Body::Empty => "empty",
            Body::Text(_) => "text",
            Body::Bytes(_) => "bytes",
            Body::Json(_) => "json",
            Body::Object(_) => "object",
        }
    }
}

impl Debug for Body {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Body::Object(_) => write!(f, "Object(..)"),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Bytes(value)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

/// Named binary part carried next to the body, with its own headers.
#[derive(Debug, Clone)]
pub struct Attachment {
    data: Bytes,
    headers: Headers,
}

impl Attachment {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.headers.insert("Content-Type", content_type.into());
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_str("Content-Type")
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// One side (in or out) of an exchange.
#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: Headers,
    body: Body,
    attachments: HashMap<String, Attachment, FnvBuildHasher>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(name, value);
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.get(name)
    }

    pub fn attachments(&self) -> impl Iterator<Item = (&str, &Attachment)> {
        self.attachments
            .iter()
            .map(|(name, attachment)| (name.as_str(), attachment))
    }

    pub fn add_attachment(&mut self, name: impl Into<String>, attachment: Attachment) {
        self.attachments.insert(name.into(), attachment);
    }

    pub fn remove_attachment(&mut self, name: &str) -> Option<Attachment> {
        self.attachments.remove(name)
    }

    /// Replaces this message with a copy of `other`. Header values and the body are shared
    /// where the payload type allows it, attachments get a fresh map over the same data.
    pub fn copy_from(&mut self, other: &Message) {
        self.headers = other.headers.clone();
        self.body = other.body.clone();
        self.attachments = other.attachments.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        assert_eq!(headers.get_str("content-type"), Some("text/plain"));
        assert_eq!(headers.get_str("CONTENT-TYPE"), Some("text/plain"));

        headers.insert("CONTENT-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_str("Content-Type"), Some("application/json"));
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["CONTENT-type"]);
    }

    #[test]
    fn test_header_original_case_preserved() {
        let mut headers = Headers::new();
        headers.insert("X-Correlation-Id", 42);
        let (name, value) = headers.iter().next().unwrap();
        assert_eq!(name, "X-Correlation-Id");
        assert_eq!(value, &Value::from(42));
        assert!(headers.remove("x-correlation-id").is_some());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_body_views() {
        let body = Body::from("hello");
        assert_eq!(body.as_text(), Some("hello"));
        assert_eq!(body.to_bytes().unwrap(), Bytes::from_static(b"hello"));

        let binary = Body::from(vec![0xff, 0xfe]);
        assert!(binary.as_text().is_none());

        let object = Body::object(7u16);
        assert_eq!(object.downcast_ref::<u16>(), Some(&7));
        assert!(object.to_bytes().is_none());
        assert!(Body::Empty.is_empty());
    }

    #[test]
    fn test_copy_shares_attachment_data() {
        let mut original = Message::with_body("body");
        original.set_header("a", 1);
        original.add_attachment(
            "doc",
            Attachment::new(Bytes::from_static(b"pdf-bytes")).with_content_type("application/pdf"),
        );

        let mut copy = Message::new();
        copy.copy_from(&original);
        copy.set_header("b", 2);
        copy.remove_attachment("doc");

        assert!(original.attachment("doc").is_some());
        assert!(original.header("b").is_none());
        assert_eq!(copy.body().as_text(), Some("body"));

        let mut second = Message::new();
        second.copy_from(&original);
        let left = original.attachment("doc").unwrap().data();
        let right = second.attachment("doc").unwrap().data();
        assert_eq!(left.as_ptr(), right.as_ptr());
        assert_eq!(
            second.attachment("doc").unwrap().content_type(),
            Some("application/pdf")
        );
    }
}
