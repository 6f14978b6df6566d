//! Credentials handed over by the platform's auth layer.
//!
//! The client never logs in by itself; it receives either the browser-style
//! session cookie or a bearer token and attaches it to the WebSocket upgrade
//! request and to history requests.

use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderValue};

use crate::error::{LinkError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    /// Raw `Cookie` header value, e.g. `sessionid=abc`.
    SessionCookie(String),
    Bearer(String),
}

impl Credentials {
    /// `(header name, header value)` for this credential, if any.
    pub fn header(&self) -> Option<(&'static str, String)> {
        match self {
            Credentials::None             => None,
            Credentials::SessionCookie(c) => Some(("cookie", c.clone())),
            Credentials::Bearer(t)        => Some(("authorization", format!("Bearer {t}"))),
        }
    }

    /// Insert the credential into an HTTP header map (WebSocket upgrade).
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        let value = |v: &str| {
            HeaderValue::from_str(v)
                .map_err(|e| LinkError::Handshake(format!("invalid credential header: {e}")))
        };
        match self {
            Credentials::None => {}
            Credentials::SessionCookie(c) => {
                headers.insert(header::COOKIE, value(c)?);
            }
            Credentials::Bearer(t) => {
                headers.insert(header::AUTHORIZATION, value(&format!("Bearer {t}"))?);
            }
        }
        Ok(())
    }
}
