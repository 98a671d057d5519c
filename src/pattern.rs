//! URL and method pattern compilation for route matching
//!
//! Glob syntax:
//! - `*` matches any run of characters except `/`
//! - `**` matches any run of characters, including `/`
//! - `{a,b}` matches either alternative
//! - `\` escapes the next character
//!
//! Every other character, `?` included, matches itself. Patterns are compiled
//! once at registration; matching is a pure function of the compiled pattern.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::{InterposeError, Result};

/// Prefix that selects verbatim regular-expression syntax in [`compile`]
pub const REGEX_PREFIX: &str = "re:";

type UrlPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
enum UrlMatcher {
    Any,
    Glob { source: String, regex: Regex },
    Regex(Regex),
    Predicate(UrlPredicate),
}

/// Compiled URL pattern with an optional method filter
#[derive(Clone)]
pub struct RoutePattern {
    url: UrlMatcher,
    method: Option<String>,
}

impl RoutePattern {
    /// Pattern matching every URL
    #[must_use]
    pub fn any() -> Self {
        Self {
            url: UrlMatcher::Any,
            method: None,
        }
    }

    /// Compile a glob pattern
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the glob is malformed
    pub fn glob(pattern: &str) -> Result<Self> {
        let source = glob_to_regex(pattern)?;
        let regex = Regex::new(&source).map_err(|e| invalid(pattern, &e.to_string()))?;

        Ok(Self {
            url: UrlMatcher::Glob {
                source: pattern.to_string(),
                regex,
            },
            method: None,
        })
    }

    /// Compile a regular expression, used verbatim (unanchored)
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the expression does not compile
    pub fn regex(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| invalid(pattern, &e.to_string()))?;
        Ok(Self {
            url: UrlMatcher::Regex(regex),
            method: None,
        })
    }

    /// Pattern backed by an arbitrary URL predicate
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            url: UrlMatcher::Predicate(Arc::new(predicate)),
            method: None,
        }
    }

    /// Restrict the pattern to one HTTP method (case-insensitive)
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if `method` is not a valid HTTP token
    pub fn with_method(mut self, method: &str) -> Result<Self> {
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(invalid(method, "method is not a valid HTTP token"));
        }
        self.method = Some(method.to_ascii_uppercase());
        Ok(self)
    }

    /// Method filter, if any
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Match a URL and method
    #[must_use]
    pub fn matches(&self, url: &str, method: &str) -> bool {
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        self.matches_url(url)
    }

    /// Match a URL, ignoring any method filter
    #[must_use]
    pub fn matches_url(&self, url: &str) -> bool {
        match &self.url {
            UrlMatcher::Any => true,
            UrlMatcher::Glob { regex, .. } | UrlMatcher::Regex(regex) => regex.is_match(url),
            UrlMatcher::Predicate(predicate) => predicate(url),
        }
    }
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePattern")
            .field("url", &self.to_string())
            .field("method", &self.method)
            .finish()
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(method) = &self.method {
            write!(f, "{method} ")?;
        }
        match &self.url {
            UrlMatcher::Any => f.write_str("**"),
            UrlMatcher::Glob { source, .. } => f.write_str(source),
            UrlMatcher::Regex(regex) => write!(f, "{REGEX_PREFIX}{}", regex.as_str()),
            UrlMatcher::Predicate(_) => f.write_str("<predicate>"),
        }
    }
}

/// Compile a textual pattern
///
/// Patterns prefixed with `re:` are regular expressions; everything else is
/// a glob.
///
/// # Errors
///
/// Returns `InvalidPattern` if the pattern is malformed
pub fn compile(pattern: &str) -> Result<RoutePattern> {
    match pattern.strip_prefix(REGEX_PREFIX) {
        Some(expression) => RoutePattern::regex(expression),
        None if pattern == "**" => Ok(RoutePattern::any()),
        None => RoutePattern::glob(pattern),
    }
}

/// Translate a glob into an anchored regular expression source
///
/// # Errors
///
/// Returns `InvalidPattern` on a trailing escape, nested or unbalanced braces
pub fn glob_to_regex(glob: &str) -> Result<String> {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    let mut in_group = false;
    let mut buf = [0u8; 4];

    out.push('^');
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let Some(next) = chars.get(i + 1) else {
                    return Err(invalid(glob, "trailing escape character"));
                };
                out.push_str(&regex::escape(next.encode_utf8(&mut buf)));
                i += 2;
                continue;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    out.push_str(".*");
                    while chars.get(i) == Some(&'*') {
                        i += 1;
                    }
                    continue;
                }
                out.push_str("[^/]*");
            }
            '{' => {
                if in_group {
                    return Err(invalid(glob, "nested '{' is not supported"));
                }
                in_group = true;
                out.push_str("(?:");
            }
            '}' => {
                if !in_group {
                    return Err(invalid(glob, "unmatched '}'"));
                }
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
        i += 1;
    }

    if in_group {
        return Err(invalid(glob, "unterminated '{'"));
    }

    out.push('$');
    Ok(out)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn invalid(pattern: &str, message: &str) -> InterposeError {
    InterposeError::InvalidPattern {
        pattern: pattern.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_double_star_crosses_segments() {
        let pattern = RoutePattern::glob("**/api/data").unwrap();
        assert!(pattern.matches_url("http://localhost:3000/api/data"));
        assert!(pattern.matches_url("https://example.com/v1/nested/api/data"));
        assert!(pattern.matches_url("/api/data"));
        assert!(!pattern.matches_url("http://localhost:3000/api/data/extra"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let pattern = RoutePattern::glob("https://example.com/*.js").unwrap();
        assert!(pattern.matches_url("https://example.com/app.js"));
        assert!(!pattern.matches_url("https://example.com/static/app.js"));
    }

    #[test]
    fn test_alternation() {
        let pattern = RoutePattern::glob("**/*.{png,jpg}").unwrap();
        assert!(pattern.matches_url("https://cdn.example.com/img/logo.png"));
        assert!(pattern.matches_url("https://cdn.example.com/photo.jpg"));
        assert!(!pattern.matches_url("https://cdn.example.com/photo.gif"));
    }

    #[test]
    fn test_question_mark_is_literal() {
        let pattern = RoutePattern::glob("**/search?q=*").unwrap();
        assert!(pattern.matches_url("https://example.com/search?q=rust"));
        assert!(!pattern.matches_url("https://example.com/searchXq=rust"));
    }

    #[test]
    fn test_escape() {
        let pattern = RoutePattern::glob(r"**/literal\*star").unwrap();
        assert!(pattern.matches_url("https://example.com/literal*star"));
        assert!(!pattern.matches_url("https://example.com/literalXstar"));
    }

    #[test]
    fn test_malformed_globs_fail_at_compile() {
        assert!(matches!(
            RoutePattern::glob("**/a{b"),
            Err(InterposeError::InvalidPattern { .. })
        ));
        assert!(RoutePattern::glob("**/a}b").is_err());
        assert!(RoutePattern::glob("**/{a,{b}}").is_err());
        assert!(RoutePattern::glob("trailing\\").is_err());
    }

    #[test]
    fn test_regex_verbatim() {
        let pattern = compile(r"re:/api/v\d+/users").unwrap();
        assert!(pattern.matches_url("https://example.com/api/v2/users?page=1"));
        assert!(!pattern.matches_url("https://example.com/api/vX/users"));

        assert!(matches!(
            compile("re:(unclosed"),
            Err(InterposeError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_method_filter() {
        let pattern = RoutePattern::glob("**/api/**")
            .unwrap()
            .with_method("post")
            .unwrap();
        assert_eq!(pattern.method(), Some("POST"));
        assert!(pattern.matches("https://example.com/api/items", "POST"));
        assert!(pattern.matches("https://example.com/api/items", "post"));
        assert!(!pattern.matches("https://example.com/api/items", "GET"));

        assert!(RoutePattern::any().with_method("").is_err());
        assert!(RoutePattern::any().with_method("GE T").is_err());
    }

    #[test]
    fn test_predicate_and_any() {
        let pattern = RoutePattern::predicate(|url| url.contains("analytics"));
        assert!(pattern.matches("https://analytics.example.com/collect", "GET"));
        assert!(!pattern.matches("https://example.com/", "GET"));

        assert!(compile("**").unwrap().matches("anything at all", "DELETE"));
    }

    #[test]
    fn test_display() {
        let pattern = compile("**/api/*").unwrap().with_method("get").unwrap();
        assert_eq!(pattern.to_string(), "GET **/api/*");
    }

    proptest! {
        #[test]
        fn prop_literal_glob_matches_itself(s in "[a-zA-Z0-9/:._?=&-]{0,48}") {
            let pattern = RoutePattern::glob(&s).unwrap();
            prop_assert!(pattern.matches_url(&s));
        }

        #[test]
        fn prop_double_star_prefix_matches_any_host(host in "[a-z]{1,12}", tail in "[a-z0-9/]{0,24}") {
            let pattern = RoutePattern::glob("**/api/data").unwrap();
            let url = format!("https://{host}.test/{tail}/api/data");
            prop_assert!(pattern.matches_url(&url));
        }
    }
}
