//! Cookies read from `Cookie`/`Set-Cookie` and written back on commit.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Parse every pair of a request `Cookie` header value.
    pub fn parse_request(header: &str) -> Vec<Cookie> {
        header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Cookie::new(name, value.trim()))
            })
            .collect()
    }

    /// Parse a response `Set-Cookie` header value.
    pub fn parse_set_cookie(header: &str) -> Option<Cookie> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let mut cookie = Cookie::new(name.trim(), value.trim());
        if cookie.name.is_empty() {
            return None;
        }
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attr.trim(), None),
            };
            match (key.to_ascii_lowercase().as_str(), val) {
                ("path", Some(v)) => cookie.path = Some(v.to_string()),
                ("domain", Some(v)) => cookie.domain = Some(v.to_string()),
                ("max-age", Some(v)) => cookie.max_age = v.parse().ok(),
                ("secure", _) => cookie.secure = true,
                ("httponly", _) => cookie.http_only = true,
                _ => {}
            }
        }
        Some(cookie)
    }

    /// `name=value` as sent in a request `Cookie` header.
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Renders the `Set-Cookie` form.
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={}", domain)?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age)?;
        }
        if self.secure {
            write!(f, "; Secure")?;
        }
        if self.http_only {
            write!(f, "; HttpOnly")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_pairs() {
        let cookies = Cookie::parse_request("a=1; b = two ;junk");
        assert_eq!(cookies, vec![Cookie::new("a", "1"), Cookie::new("b", "two")]);
    }

    #[test]
    fn set_cookie_attributes() {
        let cookie = Cookie::parse_set_cookie("sid=xyz; Path=/; Max-Age=60; HttpOnly").unwrap();
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert_eq!(cookie.max_age, Some(60));
        assert!(cookie.http_only);
        assert_eq!(cookie.to_string(), "sid=xyz; Path=/; Max-Age=60; HttpOnly");
    }
}
