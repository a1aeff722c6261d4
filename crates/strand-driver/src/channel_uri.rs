//! Channel strings: `strand:<media>?key=value|key=value`.
//!
//! ```text
//! strand:udp?endpoint=localhost:40123|term-length=64k|mtu=1408
//! strand:ipc?init-term-id=-1234|term-id=-1230|term-offset=8192
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::address::{self, AddressError, Endpoint};
use crate::resolver::NameResolver;

/// Every channel starts with `strand:`.
pub const SCHEME: &str = "strand";
pub const UDP_MEDIA: &str = "udp";
pub const IPC_MEDIA: &str = "ipc";

/// Parameter keys.
pub const ENDPOINT_PARAM: &str = "endpoint";
pub const TERM_LENGTH_PARAM: &str = "term-length";
pub const MTU_LENGTH_PARAM: &str = "mtu";
pub const INITIAL_TERM_ID_PARAM: &str = "init-term-id";
pub const TERM_ID_PARAM: &str = "term-id";
pub const TERM_OFFSET_PARAM: &str = "term-offset";
pub const SESSION_ID_PARAM: &str = "session-id";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelUriError {
    #[error("channel {0:?} must start with `strand:`")]
    MissingScheme(String),

    #[error("unsupported media {0:?}")]
    UnknownMedia(String),

    #[error("malformed parameter {0:?}, expected key=value")]
    MalformedParam(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("init-term-id, term-id and term-offset must be given together")]
    IncompleteJoin,

    #[error("{0} requires an endpoint")]
    MissingEndpoint(String),

    #[error(transparent)]
    Address(#[from] AddressError),
}

/// A parsed channel string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    media: String,
    params: Vec<(String, String)>,
}

/// The join triple carried by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinParams {
    pub initial_term_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
}

impl ChannelUri {
    /// A channel with no parameters.
    pub fn new(media: &str) -> Self {
        Self {
            media: media.to_owned(),
            params: Vec::new(),
        }
    }

    /// Parse `strand:<media>[?key=value|key=value...]`.
    pub fn parse(input: &str) -> Result<Self, ChannelUriError> {
        let rest = input
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| ChannelUriError::MissingScheme(input.to_owned()))?;

        let (media, query) = match rest.split_once('?') {
            Some((media, query)) => (media, query),
            None => (rest, ""),
        };
        if media != UDP_MEDIA && media != IPC_MEDIA {
            return Err(ChannelUriError::UnknownMedia(media.to_owned()));
        }

        let mut uri = Self::new(media);
        for pair in query.split('|').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| ChannelUriError::MalformedParam(pair.to_owned()))?;
            uri.set(key, value);
        }

        if uri.media == UDP_MEDIA && uri.get(ENDPOINT_PARAM).is_none() {
            return Err(ChannelUriError::MissingEndpoint(input.to_owned()));
        }
        Ok(uri)
    }

    pub fn media(&self) -> &str {
        &self.media
    }

    /// True for `strand:ipc` channels.
    pub fn is_ipc(&self) -> bool {
        self.media == IPC_MEDIA
    }

    /// Raw value of parameter `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, replacing any earlier value.
    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_owned(),
            None => self.params.push((key.to_owned(), value.to_owned())),
        }
        self
    }

    /// `term-length`, with size suffixes applied.
    pub fn term_length(&self) -> Result<Option<i32>, ChannelUriError> {
        self.size_param(TERM_LENGTH_PARAM)
    }

    pub fn mtu_length(&self) -> Result<Option<i32>, ChannelUriError> {
        self.size_param(MTU_LENGTH_PARAM)
    }

    /// `session-id`, if the channel pins one.
    pub fn session_id(&self) -> Result<Option<i32>, ChannelUriError> {
        self.int_param(SESSION_ID_PARAM)
    }

    /// The `(init-term-id, term-id, term-offset)` triple, if present.
    pub fn join_params(&self) -> Result<Option<JoinParams>, ChannelUriError> {
        let initial_term_id = self.int_param(INITIAL_TERM_ID_PARAM)?;
        let term_id = self.int_param(TERM_ID_PARAM)?;
        let term_offset = self.int_param(TERM_OFFSET_PARAM)?;
        match (initial_term_id, term_id, term_offset) {
            (Some(initial_term_id), Some(term_id), Some(term_offset)) => Ok(Some(JoinParams {
                initial_term_id,
                term_id,
                term_offset,
            })),
            (None, None, None) => Ok(None),
            _ => Err(ChannelUriError::IncompleteJoin),
        }
    }

    /// Look up and parse the endpoint parameter, if there is one.
    pub fn endpoint(&self, resolver: &dyn NameResolver) -> Result<Option<Endpoint>, ChannelUriError> {
        let Some(value) = self.get(ENDPOINT_PARAM) else {
            return Ok(None);
        };
        let target = resolver
            .lookup(value, ENDPOINT_PARAM, false)
            .unwrap_or_else(|| value.to_owned());
        Ok(Some(address::parse(&target, resolver)?))
    }

    fn int_param(&self, key: &'static str) -> Result<Option<i32>, ChannelUriError> {
        self.get(key)
            .map(|value| {
                value.parse::<i32>().map_err(|_| ChannelUriError::InvalidValue {
                    key,
                    value: value.to_owned(),
                })
            })
            .transpose()
    }

    fn size_param(&self, key: &'static str) -> Result<Option<i32>, ChannelUriError> {
        self.get(key)
            .map(|value| {
                parse_size(value).ok_or_else(|| ChannelUriError::InvalidValue {
                    key,
                    value: value.to_owned(),
                })
            })
            .transpose()
    }
}

/// Parse sizes such as `1408`, `64k`, `16m` or `1g`.
pub fn parse_size(value: &str) -> Option<i32> {
    let (digits, multiplier) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024i64),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let size = digits.parse::<i64>().ok()?.checked_mul(multiplier)?;
    i32::try_from(size).ok()
}

impl FromStr for ChannelUri {
    type Err = ChannelUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}:{}", self.media)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '|' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticTableNameResolver;

    #[test]
    fn test_parse_udp_channel() {
        let uri: ChannelUri = "strand:udp?endpoint=localhost:40123|term-length=64k|mtu=1408"
            .parse()
            .unwrap();
        assert_eq!(uri.media(), "udp");
        assert_eq!(uri.get(ENDPOINT_PARAM), Some("localhost:40123"));
        assert_eq!(uri.term_length().unwrap(), Some(65536));
        assert_eq!(uri.mtu_length().unwrap(), Some(1408));
        assert_eq!(uri.join_params().unwrap(), None);
    }

    #[test]
    fn test_display_round_trips() {
        let text = "strand:ipc?term-length=128k|session-id=5";
        assert_eq!(ChannelUri::parse(text).unwrap().to_string(), text);
        assert_eq!(ChannelUri::new("ipc").to_string(), "strand:ipc");
    }

    #[test]
    fn test_join_params() {
        let uri = ChannelUri::parse("strand:ipc?init-term-id=-1234|term-id=-1230|term-offset=8192").unwrap();
        assert_eq!(
            uri.join_params().unwrap(),
            Some(JoinParams {
                initial_term_id: -1234,
                term_id: -1230,
                term_offset: 8192
            })
        );

        let partial = ChannelUri::parse("strand:ipc?term-id=3").unwrap();
        assert_eq!(partial.join_params(), Err(ChannelUriError::IncompleteJoin));
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            ChannelUri::parse("aeron:udp?endpoint=a:1"),
            Err(ChannelUriError::MissingScheme(_))
        ));
        assert!(matches!(
            ChannelUri::parse("strand:tcp?endpoint=a:1"),
            Err(ChannelUriError::UnknownMedia(_))
        ));
        assert!(matches!(
            ChannelUri::parse("strand:udp?endpoint"),
            Err(ChannelUriError::MalformedParam(_))
        ));
        assert!(matches!(
            ChannelUri::parse("strand:udp?mtu=1408"),
            Err(ChannelUriError::MissingEndpoint(_))
        ));
        let bad_size = ChannelUri::parse("strand:ipc?term-length=lots").unwrap();
        assert!(matches!(
            bad_size.term_length(),
            Err(ChannelUriError::InvalidValue { key: TERM_LENGTH_PARAM, .. })
        ));
    }

    #[test]
    fn test_endpoint_goes_through_lookup() {
        let resolver = StaticTableNameResolver::parse("NAME_0,endpoint,127.0.0.1:8001,127.0.0.1:8002").unwrap();
        let uri = ChannelUri::parse("strand:udp?endpoint=NAME_0").unwrap();
        let endpoint = uri.endpoint(&resolver).unwrap().unwrap();
        assert_eq!(endpoint.socket_addr(), Some("127.0.0.1:8002".parse().unwrap()));

        let bad = ChannelUri::parse("strand:udp?endpoint=localhost:").unwrap();
        assert!(matches!(bad.endpoint(&resolver), Err(ChannelUriError::Address(_))));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("64k"), Some(65536));
        assert_eq!(parse_size("1g"), Some(1 << 30));
        assert_eq!(parse_size("4g"), None);
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size("-1"), None);
    }
}
