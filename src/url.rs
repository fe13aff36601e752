//! URL parsing for the virtual filesystem
//!
//! Accepts `scheme://[user[:pass]@]host[:port]/path[?query][#fragment]`,
//! opaque `scheme:rest` forms used by composite schemes, and bare local paths.

use crate::error::{RelayError, Result};
use std::fmt;

/// A parsed resource locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: String,
    user: Option<String>,
    password: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
    hierarchical: bool,
}

impl Url {
    /// Parse a URL or a bare path
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RelayError::InvalidUrl("empty URL".to_string()));
        }

        let Some((scheme, rest)) = split_scheme(input) else {
            // Bare path, served by the local filesystem
            let (path, query, fragment) = split_tail(input);
            return Ok(Self {
                scheme: String::new(),
                user: None,
                password: None,
                host: String::new(),
                port: None,
                path: path.to_string(),
                query,
                fragment,
                hierarchical: true,
            });
        };

        let scheme = scheme.to_ascii_lowercase();
        let Some(rest) = rest.strip_prefix("//") else {
            // Opaque form: everything after the colon is the path
            return Ok(Self {
                scheme,
                user: None,
                password: None,
                host: String::new(),
                port: None,
                path: rest.to_string(),
                query: None,
                fragment: None,
                hierarchical: false,
            });
        };

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(at) => (Some(&authority[..at]), &authority[at + 1..]),
            None => (None, authority),
        };

        let (user, password) = match userinfo {
            Some(info) => {
                let (user, pass) = match info.find(':') {
                    Some(colon) => (&info[..colon], Some(&info[colon + 1..])),
                    None => (info, None),
                };
                (Some(decode(user)?), pass.map(decode).transpose()?)
            }
            None => (None, None),
        };

        let (host, port) = split_host_port(hostport)?;

        let (path, query, fragment) = split_tail(tail);
        let path = if path.is_empty() { "/" } else { path };

        Ok(Self {
            scheme,
            user,
            password,
            host,
            port,
            path: path.to_string(),
            query,
            fragment,
            hierarchical: true,
        })
    }

    /// Lowercase scheme, empty for bare paths
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Explicit port or the backend default
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Path exactly as written (percent-encoding preserved)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path with percent-escapes decoded; falls back to the raw path
    pub fn decoded_path(&self) -> String {
        urlencoding::decode(&self.path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| self.path.clone())
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// False for opaque `scheme:rest` forms
    pub fn is_hierarchical(&self) -> bool {
        self.hierarchical
    }

    /// Non-empty path components
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Last path component, empty at the root
    pub fn basename(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }

    /// Lowercase extension of the basename including the dot
    pub fn extension(&self) -> Option<String> {
        extension_of(self.basename())
    }

    /// `scheme://[user[:pass]@]host[:port]` prefix
    pub fn root(&self) -> String {
        let mut out = String::new();
        if !self.scheme.is_empty() {
            out.push_str(&self.scheme);
            out.push_str(if self.hierarchical { "://" } else { ":" });
        }
        if let Some(user) = &self.user {
            out.push_str(&urlencoding::encode(user));
            if let Some(pass) = &self.password {
                out.push(':');
                out.push_str(&urlencoding::encode(pass));
            }
            out.push('@');
        }
        if self.host.contains(':') {
            out.push('[');
            out.push_str(&self.host);
            out.push(']');
        } else {
            out.push_str(&self.host);
        }
        if let Some(port) = self.port {
            out.push(':');
            out.push_str(&port.to_string());
        }
        out
    }

    /// Same location with a different path; query and fragment are dropped
    pub fn with_path(&self, path: &str) -> Url {
        let mut url = self.clone();
        url.path = if self.hierarchical && !path.starts_with('/') && !self.scheme.is_empty() {
            format!("/{}", path)
        } else {
            path.to_string()
        };
        url.query = None;
        url.fragment = None;
        url
    }

    /// Child URL one level below this one
    pub fn join(&self, name: &str) -> Url {
        let base = self.path.trim_end_matches('/');
        self.with_path(&format!("{}/{}", base, name.trim_start_matches('/')))
    }

    /// URL of the containing directory
    pub fn parent(&self) -> Url {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) | None => self.with_path("/"),
            Some(idx) => self.with_path(&trimmed[..idx]),
        }
    }

    /// `key=value&...` pairs of the fragment
    pub fn fragment_params(&self) -> Vec<(String, String)> {
        self.fragment.as_deref().map(parse_params).unwrap_or_default()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root())?;
        f.write_str(&self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}

/// A derived URL wrapping another one: `scheme:<source-url>#key=value&...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeUrl {
    pub scheme: String,
    pub source: String,
    pub params: Vec<(String, String)>,
}

impl CompositeUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let colon = input
            .find(':')
            .ok_or_else(|| RelayError::InvalidUrl(format!("missing scheme: {}", input)))?;
        let scheme = input[..colon].to_ascii_lowercase();
        let rest = &input[colon + 1..];
        let (source, params) = match rest.rfind('#') {
            Some(hash) => (&rest[..hash], parse_params(&rest[hash + 1..])),
            None => (rest, Vec::new()),
        };
        if source.is_empty() {
            return Err(RelayError::InvalidUrl(format!("missing source URL: {}", input)));
        }
        Ok(Self {
            scheme,
            source: source.to_string(),
            params,
        })
    }

    /// First value for a parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Lowercase extension of a file name including the dot
pub fn extension_of(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 == name.len() {
        return None;
    }
    Some(name[dot..].to_ascii_lowercase())
}

/// Case-insensitive filename comparison with `*` and `?` wildcards
pub fn compare_filename(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().flat_map(char::to_lowercase).collect();
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();

    let (mut n, mut p) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            n += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = n;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            n = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// True when the pattern contains wildcard characters
pub fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?'])
}

fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let colon = input.find(':')?;
    let scheme = &input[..colon];
    // A single letter before the colon is a drive, not a scheme
    if scheme.len() < 2 {
        return None;
    }
    let valid = scheme
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_alphabetic() || (i > 0 && (c.is_ascii_digit() || "+-.".contains(c))));
    if !valid {
        return None;
    }
    Some((scheme, &input[colon + 1..]))
}

fn split_tail(tail: &str) -> (&str, Option<String>, Option<String>) {
    let (before_fragment, fragment) = match tail.find('#') {
        Some(hash) => (&tail[..hash], Some(tail[hash + 1..].to_string())),
        None => (tail, None),
    };
    let (path, query) = match before_fragment.find('?') {
        Some(q) => (&before_fragment[..q], Some(before_fragment[q + 1..].to_string())),
        None => (before_fragment, None),
    };
    (path, query, fragment)
}

fn split_host_port(hostport: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| RelayError::InvalidUrl(format!("unterminated IPv6 host: {}", hostport)))?;
        let host = rest[..close].to_string();
        let after = &rest[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }
    match hostport.rfind(':') {
        Some(colon) => {
            let port = &hostport[colon + 1..];
            let port = if port.is_empty() { None } else { Some(parse_port(port)?) };
            Ok((hostport[..colon].to_ascii_lowercase(), port))
        }
        None => Ok((hostport.to_ascii_lowercase(), None)),
    }
}

fn parse_port(text: &str) -> Result<u16> {
    text.parse::<u16>()
        .map_err(|_| RelayError::InvalidUrl(format!("invalid port: {}", text)))
}

fn decode(text: &str) -> Result<String> {
    urlencoding::decode(text)
        .map(|s| s.into_owned())
        .map_err(|e| RelayError::InvalidUrl(format!("bad percent-encoding: {}", e)))
}

fn parse_params(text: &str) -> Vec<(String, String)> {
    text.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.find('=') {
            Some(eq) => (pair[..eq].to_string(), pair[eq + 1..].to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
