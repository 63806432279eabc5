//! Channel URIs.
//!
//! Channels are addressed as `tek:<media>?key=value|key=value`. The media
//! part names the transport medium (`mem` for the in-memory driver, `udp`
//! or `ipc` for real drivers); parameters carry the endpoint and tuning
//! values recognised below.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

// ============================================================================
// Parameter Names
// ============================================================================

pub const ENDPOINT_PARAM: &str = "endpoint";
pub const CONTROL_MODE_PARAM: &str = "control-mode";
pub const SESSION_ID_PARAM: &str = "session-id";
pub const MTU_PARAM: &str = "mtu";
pub const TERM_LENGTH_PARAM: &str = "term-length";
pub const TAGS_PARAM: &str = "tags";
pub const INIT_TERM_ID_PARAM: &str = "init-term-id";
pub const TERM_OFFSET_PARAM: &str = "term-offset";
pub const ALIAS_PARAM: &str = "alias";

const SCHEME: &str = "tek";

// ============================================================================
// Errors
// ============================================================================

/// Errors from parsing a channel URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelParseError {
    #[error("channel must start with `{SCHEME}:`: {0}")]
    MissingScheme(String),

    #[error("channel has an empty media part: {0}")]
    EmptyMedia(String),

    #[error("malformed parameter `{param}` in channel {uri}")]
    MalformedParam { uri: String, param: String },

    #[error("parameter `{param}` of channel {uri} is not an integer")]
    NonIntegerParam { uri: String, param: String },
}

// ============================================================================
// ChannelUri
// ============================================================================

/// A parsed channel URI.
///
/// Parameters are held sorted so that equal channels render identically;
/// the canonical string form is the routing identity used by the in-memory
/// driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    media: String,
    params: BTreeMap<String, String>,
}

impl ChannelUri {
    /// Parses `tek:<media>?k=v|k=v`.
    pub fn parse(uri: &str) -> Result<Self, ChannelParseError> {
        let rest = uri
            .strip_prefix("tek:")
            .ok_or_else(|| ChannelParseError::MissingScheme(uri.to_string()))?;

        let (media, params_part) = match rest.split_once('?') {
            Some((m, p)) => (m, Some(p)),
            None => (rest, None),
        };

        if media.is_empty() {
            return Err(ChannelParseError::EmptyMedia(uri.to_string()));
        }

        let mut params = BTreeMap::new();
        if let Some(params_part) = params_part {
            for pair in params_part.split('|').filter(|p| !p.is_empty()) {
                let (key, value) =
                    pair.split_once('=')
                        .ok_or_else(|| ChannelParseError::MalformedParam {
                            uri: uri.to_string(),
                            param: pair.to_string(),
                        })?;
                if key.is_empty() {
                    return Err(ChannelParseError::MalformedParam {
                        uri: uri.to_string(),
                        param: pair.to_string(),
                    });
                }
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            media: media.to_string(),
            params,
        })
    }

    /// Starts a builder for the given media.
    pub fn builder(media: &str) -> ChannelUriBuilder {
        ChannelUriBuilder {
            uri: Self {
                media: media.to_string(),
                params: BTreeMap::new(),
            },
        }
    }

    pub fn media(&self) -> &str {
        &self.media
    }

    pub fn get(&self, param: &str) -> Option<&str> {
        self.params.get(param).map(String::as_str)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.get(ENDPOINT_PARAM)
    }

    pub fn alias(&self) -> Option<&str> {
        self.get(ALIAS_PARAM)
    }

    /// Typed accessor for an integer parameter.
    pub fn get_int(&self, param: &str) -> Result<Option<i64>, ChannelParseError> {
        match self.params.get(param) {
            None => Ok(None),
            Some(value) => value.parse::<i64>().map(Some).map_err(|_| {
                ChannelParseError::NonIntegerParam {
                    uri: self.to_string(),
                    param: param.to_string(),
                }
            }),
        }
    }

    pub fn session_id(&self) -> Result<Option<i32>, ChannelParseError> {
        Ok(self.get_int(SESSION_ID_PARAM)?.map(|v| v as i32))
    }

    /// Sets or replaces a parameter.
    pub fn put(&mut self, param: &str, value: impl Display) {
        self.params.insert(param.to_string(), value.to_string());
    }

    /// Routing identity: media plus endpoint, ignoring tuning parameters.
    pub fn routing_key(&self) -> String {
        match self.endpoint() {
            Some(endpoint) => format!("{}:{}", self.media, endpoint),
            None => self.media.clone(),
        }
    }
}

impl Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}:{}", self.media)?;
        let mut sep = '?';
        for (key, value) in &self.params {
            write!(f, "{sep}{key}={value}")?;
            sep = '|';
        }
        Ok(())
    }
}

/// Builder for [`ChannelUri`].
#[derive(Debug, Clone)]
pub struct ChannelUriBuilder {
    uri: ChannelUri,
}

impl ChannelUriBuilder {
    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.uri.put(ENDPOINT_PARAM, endpoint);
        self
    }

    pub fn session_id(mut self, session_id: i32) -> Self {
        self.uri.put(SESSION_ID_PARAM, session_id);
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.uri.put(ALIAS_PARAM, alias);
        self
    }

    pub fn param(mut self, param: &str, value: impl Display) -> Self {
        self.uri.put(param, value);
        self
    }

    pub fn build(self) -> ChannelUri {
        self.uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_media_and_params() {
        let uri = ChannelUri::parse("tek:mem?endpoint=node0-status|alias=status").expect("parse");
        assert_eq!(uri.media(), "mem");
        assert_eq!(uri.endpoint(), Some("node0-status"));
        assert_eq!(uri.alias(), Some("status"));
        assert_eq!(uri.routing_key(), "mem:node0-status");
    }

    #[test]
    fn renders_canonically_sorted() {
        let uri = ChannelUri::parse("tek:mem?term-length=65536|endpoint=a").expect("parse");
        assert_eq!(uri.to_string(), "tek:mem?endpoint=a|term-length=65536");
    }

    #[test]
    fn builder_round_trips() {
        let built = ChannelUri::builder("mem")
            .endpoint("node2-log")
            .session_id(7)
            .param(INIT_TERM_ID_PARAM, 3)
            .build();
        let reparsed = ChannelUri::parse(&built.to_string()).expect("parse");
        assert_eq!(built, reparsed);
        assert_eq!(reparsed.session_id().expect("int"), Some(7));
    }

    #[test_case("mem:endpoint=a" ; "missing scheme")]
    #[test_case("tek:" ; "empty media")]
    #[test_case("tek:mem?endpoint" ; "param without value")]
    #[test_case("tek:mem?=x" ; "param without key")]
    fn rejects_malformed(uri: &str) {
        assert!(ChannelUri::parse(uri).is_err());
    }

    #[test]
    fn non_integer_session_id_is_an_error() {
        let uri = ChannelUri::parse("tek:mem?session-id=abc").expect("parse");
        assert!(uri.session_id().is_err());
    }
}
