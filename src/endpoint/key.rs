use crate::endpoint::EndpointError;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

/// Normalized identity of an endpoint URI.
///
/// Two notations of the same physical endpoint produce the same key:
/// - the scheme is lower-cased,
/// - `scheme:path` and `scheme://path` are the same,
/// - query parameters are sorted by name (stable, so repeated names keep their order),
/// - parameters equal to the component's defaults are dropped.
///
/// The normalized form is always `scheme://path[?name=value&...]`.
///
/// # Examples
/// ```rust
/// use switchyard::endpoint::EndpointKey;
///
/// let a = EndpointKey::parse("Timer:tick?period=10&delay=5").unwrap();
/// let b = EndpointKey::parse("timer://tick?delay=5&period=10").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "timer://tick?delay=5&period=10");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    uri: Arc<str>,
}

impl EndpointKey {
    pub fn parse(uri: &str) -> Result<Self, EndpointError> {
        Self::normalize(uri, &[])
    }

    /// Normalizes `uri`, dropping parameters whose value equals one of `defaults`.
    pub fn normalize(uri: &str, defaults: &[(String, String)]) -> Result<Self, EndpointError> {
        let uri = uri.trim();
        let scheme = Self::scheme_of(uri)?;
        let rest = &uri[scheme.len() + 1..];
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut parameters: Vec<(&str, &str)> = query
            .map(|query| {
                query
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
                    .filter(|(name, value)| {
                        !defaults
                            .iter()
                            .any(|(default_name, default_value)| {
                                default_name.as_str() == *name
                                    && default_value.as_str() == *value
                            })
                    })
                    .collect()
            })
            .unwrap_or_default();
        parameters.sort_by(|left, right| left.0.cmp(right.0));

        let mut normalized = format!("{}://{}", scheme.to_ascii_lowercase(), path);
        for (index, (name, value)) in parameters.iter().enumerate() {
            normalized.push(if index == 0 { '?' } else { '&' });
            normalized.push_str(name);
            normalized.push('=');
            normalized.push_str(value);
        }
        Ok(Self {
            uri: Arc::from(normalized),
        })
    }

    /// Extracts the raw scheme of `uri`, validating its characters.
    pub fn scheme_of(uri: &str) -> Result<&str, EndpointError> {
        let uri = uri.trim();
        let Some((scheme, _)) = uri.split_once(':') else {
            return Err(EndpointError::invalid_uri(uri, "missing scheme separator ':'"));
        };
        if scheme.is_empty() {
            return Err(EndpointError::invalid_uri(uri, "empty scheme"));
        }
        let valid = scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid || !scheme.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(EndpointError::invalid_uri(uri, "scheme contains invalid characters"));
        }
        Ok(scheme)
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> &str {
        self.uri.split("://").next().unwrap_or_default()
    }

    /// The part between `://` and the query string.
    pub fn path(&self) -> &str {
        let rest = self
            .uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        rest.split('?').next().unwrap_or_default()
    }

    pub fn parameters(&self) -> Vec<(&str, &str)> {
        match self.uri.split_once('?') {
            Some((_, query)) => query
                .split('&')
                .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters()
            .into_iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

impl Display for EndpointKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl FromStr for EndpointKey {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
