//! The header propagation rule.
//!
//! Every request gets the configured identity header, overwriting whatever
//! the client sent, and, when the CSRF cookie is present, a token header
//! carrying the cookie's value. The rule is a pure function of the request
//! headers and the compiled settings, so applying it twice is the same as
//! applying it once.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};

use crate::config::FilterConfig;
use crate::filter::cookie;

/// Error compiling filter settings.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("user id `{0}` is not a valid header value")]
    InvalidUserId(String),

    #[error("invalid header name `{name}`: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: axum::http::header::InvalidHeaderName,
    },

    #[error("cookie name `{0}` is not a valid cookie name")]
    InvalidCookieName(String),

    #[error("identity and csrf token header are both `{0}`")]
    ConflictingHeaders(HeaderName),
}

/// What a single application of the filter did beyond the identity header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Propagated {
    /// A CSRF token was copied from the cookie into the token header.
    pub token_propagated: bool,
}

#[derive(Debug, Clone)]
struct CsrfPropagation {
    cookie: String,
    header: HeaderName,
}

/// Compiled filter settings.
#[derive(Debug, Clone)]
pub struct HeaderPropagation {
    user_id_header: HeaderName,
    user_id: HeaderValue,
    identity: String,
    csrf: Option<CsrfPropagation>,
}

impl HeaderPropagation {
    /// Compile the `[filter]` configuration section.
    pub fn from_config(config: &FilterConfig) -> Result<Self, FilterError> {
        if config.user_id.trim().is_empty() {
            return Err(FilterError::EmptyUserId);
        }

        let identity = format!("{}{}", config.user_id_prefix, config.user_id);
        let user_id = HeaderValue::from_str(&identity)
            .map_err(|_| FilterError::InvalidUserId(identity.clone()))?;
        let user_id_header = parse_header_name(&config.user_id_header)?;

        let csrf = if config.csrf_enabled {
            if !is_cookie_name(&config.csrf_cookie) {
                return Err(FilterError::InvalidCookieName(config.csrf_cookie.clone()));
            }
            let header = parse_header_name(&config.csrf_header)?;
            if header == user_id_header {
                return Err(FilterError::ConflictingHeaders(header));
            }
            Some(CsrfPropagation {
                cookie: config.csrf_cookie.clone(),
                header,
            })
        } else {
            None
        };

        Ok(Self {
            user_id_header,
            user_id,
            identity,
            csrf,
        })
    }

    /// Default header and cookie names with the given identity.
    pub fn with_user_id(user_id: &str) -> Result<Self, FilterError> {
        Self::from_config(&FilterConfig {
            user_id: user_id.to_string(),
            ..FilterConfig::default()
        })
    }

    /// Rewrite `headers` in place.
    ///
    /// Never fails: a missing or malformed cookie leaves the token header
    /// untouched.
    pub fn apply(&self, headers: &mut HeaderMap) -> Propagated {
        // `insert` drops every previous value, leaving one authoritative identity.
        headers.insert(self.user_id_header.clone(), self.user_id.clone());

        let Some(csrf) = &self.csrf else {
            return Propagated::default();
        };

        // HTTP/2 clients may split cookies across several header fields.
        let token = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| cookie::find(value, &csrf.cookie))
            .and_then(|token| HeaderValue::from_str(token).ok());

        match token {
            Some(token) => {
                headers.insert(csrf.header.clone(), token);
                Propagated {
                    token_propagated: true,
                }
            }
            None => Propagated::default(),
        }
    }

    pub fn user_id_header(&self) -> &HeaderName {
        &self.user_id_header
    }

    /// The injected identity, prefix included.
    pub fn user_id(&self) -> &str {
        &self.identity
    }

    pub fn csrf_cookie(&self) -> Option<&str> {
        self.csrf.as_ref().map(|c| c.cookie.as_str())
    }

    pub fn csrf_header(&self) -> Option<&HeaderName> {
        self.csrf.as_ref().map(|c| &c.header)
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName, FilterError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|source| FilterError::InvalidHeaderName {
        name: name.to_string(),
        source,
    })
}

/// RFC 6265 cookie-name: a token, so no separators, whitespace or controls.
fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_graphic()
                && !matches!(
                    b,
                    b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"'
                        | b'/' | b'[' | b']' | b'?' | b'=' | b'{' | b'}'
                )
        })
}
