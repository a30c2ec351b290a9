//! Identity rotation and cookie handling that make parser traffic look
//! like an ordinary browser session.
//!
//! A toolkit is built fresh for every run from the source's
//! [`ParserConfig`] and never carries state across runs.

use std::collections::BTreeMap;

use url::form_urlencoded;

use crate::error::AppError;
use crate::models::ParserConfig;

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Deterministic rotator cycling through the configured identities.
#[derive(Debug, Clone)]
pub struct IdentityRotator {
    identities: Vec<String>,
    position: usize,
}

impl IdentityRotator {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identities = identities
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            identities,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Returns the identity under the cursor and advances it, wrapping around.
    pub fn next_identity(&mut self) -> Result<String, AppError> {
        if self.identities.is_empty() {
            return Err(AppError::ConfigError(
                "No user agents configured for this source".into(),
            ));
        }
        let identity = self.identities[self.position].clone();
        self.position = (self.position + 1) % self.identities.len();
        Ok(identity)
    }
}

/// Cookie set for a single run, rendered as one `Cookie` header.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new<'a, I>(cookies: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut jar = Self::default();
        for (name, value) in cookies {
            jar.set(name, value);
        }
        jar
    }

    /// Insert or overwrite a cookie. Blank names are ignored.
    pub fn set(&mut self, name: &str, value: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.cookies.insert(name.to_string(), value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.cookies.clone()
    }

    /// Serialize as `name=value; name2=value2`, escaping values that
    /// contain characters a cookie value may not carry verbatim.
    pub fn header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, escape_cookie_value(value)))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Whether `c` is a valid RFC 6265 `cookie-octet`.
fn is_cookie_octet(c: char) -> bool {
    matches!(c, '\x21' | '\x23'..='\x2B' | '\x2D'..='\x3A' | '\x3C'..='\x5B' | '\x5D'..='\x7E')
}

fn escape_cookie_value(value: &str) -> String {
    if value.chars().all(is_cookie_octet) {
        value.to_string()
    } else {
        form_urlencoded::byte_serialize(value.as_bytes()).collect()
    }
}

/// Identity rotation plus cookie management for one run.
#[derive(Debug, Clone)]
pub struct AntiDetectToolkit {
    rotator: IdentityRotator,
    jar: CookieJar,
}

impl AntiDetectToolkit {
    pub fn new<I, S>(user_agents: I, cookies: &BTreeMap<String, String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rotator: IdentityRotator::new(user_agents),
            jar: CookieJar::new(cookies),
        }
    }

    pub fn from_config(config: &ParserConfig) -> Self {
        Self::new(&config.user_agents, &config.cookies)
    }

    pub fn next_identity(&mut self) -> Result<String, AppError> {
        self.rotator.next_identity()
    }

    pub fn identity_count(&self) -> usize {
        self.rotator.len()
    }

    pub fn cookie_header(&self) -> String {
        self.jar.header()
    }

    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.jar.as_map()
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.jar.set(name, value);
    }

    /// Merge cookies into the jar; later pairs win on key collision.
    pub fn update_cookies<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in pairs {
            self.jar.set(name.as_ref(), value.as_ref());
        }
    }

    /// Header view for the next request: rotates the identity once.
    pub fn request_headers(&mut self) -> Result<Vec<(&'static str, String)>, AppError> {
        let mut headers = vec![
            ("User-Agent", self.next_identity()?),
            ("Accept", DEFAULT_ACCEPT.to_string()),
            ("Accept-Language", DEFAULT_ACCEPT_LANGUAGE.to_string()),
        ];
        if !self.jar.is_empty() {
            headers.push(("Cookie", self.cookie_header()));
        }
        Ok(headers)
    }
}
