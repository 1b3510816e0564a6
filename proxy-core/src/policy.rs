//! Runtime traffic policy
//!
//! Two rule families live here: modification rules, which rewrite decoded
//! payloads automatically before interception, and intercept rules, which
//! decide whether an armed gate pauses a given exchange. Both match by
//! server (wildcard) and by payload pattern (text, regex, or hex bytes).

use parking_lot::RwLock;
use proxy_common::Exchange;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wildmatch::WildMatch;

use crate::error::ProxyError;
use crate::Result;

/// How a rule pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Literal text
    Simple,
    Regex,
    /// Hex-encoded bytes, e.g. `"00ff1a"`
    Binary,
}

/// Compiled form of a rule pattern
#[derive(Debug, Clone)]
enum Pattern {
    Bytes(Vec<u8>),
    Regex(Regex),
}

impl Pattern {
    fn compile(method: MatchMethod, pattern: &str) -> Result<Self> {
        match method {
            MatchMethod::Simple => Ok(Pattern::Bytes(pattern.as_bytes().to_vec())),
            MatchMethod::Regex => Regex::new(pattern)
                .map(Pattern::Regex)
                .map_err(|e| ProxyError::configuration(format!("invalid regex {}: {}", pattern, e))),
            MatchMethod::Binary => decode_hex(pattern).map(Pattern::Bytes),
        }
    }

    fn is_match(&self, data: &[u8]) -> bool {
        match self {
            Pattern::Bytes(needle) if needle.is_empty() => false,
            Pattern::Bytes(needle) => data.windows(needle.len()).any(|w| w == needle.as_slice()),
            Pattern::Regex(regex) => regex.is_match(data),
        }
    }

    fn replace_all(&self, data: &[u8], replacement: &[u8]) -> Vec<u8> {
        match self {
            Pattern::Bytes(needle) if needle.is_empty() => data.to_vec(),
            Pattern::Bytes(needle) => {
                let mut out = Vec::with_capacity(data.len());
                let mut i = 0;
                while i < data.len() {
                    if data[i..].starts_with(needle) {
                        out.extend_from_slice(replacement);
                        i += needle.len();
                    } else {
                        out.push(data[i]);
                        i += 1;
                    }
                }
                out
            }
            Pattern::Regex(regex) => regex.replace_all(data, replacement).into_owned(),
        }
    }
}

fn decode_hex(pattern: &str) -> Result<Vec<u8>> {
    let compact: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map_err(|e| ProxyError::configuration(format!("invalid hex pattern {}: {}", pattern, e)))
}

fn default_server() -> String {
    "*".to_string()
}

fn default_enabled() -> bool {
    true
}

fn server_matches(pattern: &str, server: &str) -> bool {
    pattern.is_empty() || WildMatch::new(pattern).matches(server)
}

/// Which messages a modification rule rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Request,
    Response,
    All,
}

/// Automatic match-and-replace on decoded payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Server name wildcard, `*` for every server
    #[serde(default = "default_server")]
    pub server: String,
    pub direction: RuleDirection,
    pub method: MatchMethod,
    pub pattern: String,
    /// Hex when `method` is binary; may use `$1` captures when regex
    pub replacement: String,
}

#[derive(Debug, Clone)]
struct CompiledModification {
    rule: ModificationRule,
    pattern: Pattern,
    replacement: Vec<u8>,
}

impl CompiledModification {
    fn compile(rule: ModificationRule) -> Result<Self> {
        let pattern = Pattern::compile(rule.method, &rule.pattern)?;
        let replacement = match rule.method {
            MatchMethod::Binary => decode_hex(&rule.replacement)?,
            _ => rule.replacement.as_bytes().to_vec(),
        };
        Ok(Self {
            rule,
            pattern,
            replacement,
        })
    }
}

/// Ordered, shared modification rule set
#[derive(Debug, Default)]
pub struct ModificationRules {
    rules: RwLock<Vec<CompiledModification>>,
}

impl ModificationRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole rule set. Nothing changes if any rule fails to compile.
    pub fn set(&self, rules: Vec<ModificationRule>) -> Result<()> {
        let compiled = rules
            .into_iter()
            .map(CompiledModification::compile)
            .collect::<Result<Vec<_>>>()?;
        *self.rules.write() = compiled;
        Ok(())
    }

    pub fn add(&self, rule: ModificationRule) -> Result<()> {
        let compiled = CompiledModification::compile(rule)?;
        self.rules.write().push(compiled);
        Ok(())
    }

    pub fn rules(&self) -> Vec<ModificationRule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    fn apply(
        &self,
        data: &[u8],
        server: &str,
        exchange: &mut Exchange,
        wanted: RuleDirection,
    ) -> Vec<u8> {
        let rules = self.rules.read();
        let mut current = data.to_vec();
        for compiled in rules.iter() {
            let rule = &compiled.rule;
            if !rule.enabled
                || !(rule.direction == wanted || rule.direction == RuleDirection::All)
                || !server_matches(&rule.server, server)
            {
                continue;
            }
            let next = compiled.pattern.replace_all(&current, &compiled.replacement);
            if next != current {
                debug!("modification rule {:?} rewrote {}", rule.pattern, exchange.id);
                exchange.modified = true;
                current = next;
            }
        }
        current
    }

    pub fn replace_on_request(&self, data: &[u8], server: &str, request: &mut Exchange) -> Vec<u8> {
        self.apply(data, server, request, RuleDirection::Request)
    }

    pub fn replace_on_response(
        &self,
        data: &[u8],
        server: &str,
        response: &mut Exchange,
    ) -> Vec<u8> {
        self.apply(data, server, response, RuleDirection::Response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptDirection {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Matches,
    DoesNotMatch,
    /// Response rule: the paired request would itself have been intercepted
    WasIntercepted,
}

/// One condition narrowing which exchanges an armed gate pauses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptRule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server")]
    pub server: String,
    pub direction: InterceptDirection,
    pub relationship: Relationship,
    pub method: MatchMethod,
    #[serde(default)]
    pub pattern: String,
}

#[derive(Debug, Clone)]
struct CompiledIntercept {
    rule: InterceptRule,
    pattern: Pattern,
}

impl CompiledIntercept {
    fn matches(&self, data: &[u8]) -> bool {
        match self.rule.relationship {
            Relationship::Matches => self.pattern.is_match(data),
            Relationship::DoesNotMatch => !self.pattern.is_match(data),
            Relationship::WasIntercepted => true,
        }
    }
}

/// Intercept rule set. When disabled, an armed gate pauses everything.
#[derive(Debug, Default)]
pub struct InterceptOptions {
    enabled: RwLock<bool>,
    rules: RwLock<Vec<CompiledIntercept>>,
}

impl InterceptOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.read()
    }

    pub fn set(&self, rules: Vec<InterceptRule>) -> Result<()> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let pattern = match rule.relationship {
                    Relationship::WasIntercepted => Pattern::Bytes(Vec::new()),
                    _ => Pattern::compile(rule.method, &rule.pattern)?,
                };
                Ok(CompiledIntercept { rule, pattern })
            })
            .collect::<Result<Vec<_>>>()?;
        *self.rules.write() = compiled;
        Ok(())
    }

    pub fn rules(&self) -> Vec<InterceptRule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    fn request_rules_pass(rules: &[CompiledIntercept], request: &Exchange) -> bool {
        let server = &request.addressing.server_name;
        rules
            .iter()
            .filter(|c| c.rule.enabled && c.rule.direction == InterceptDirection::Request)
            .filter(|c| c.rule.relationship != Relationship::WasIntercepted)
            .filter(|c| server_matches(&c.rule.server, server))
            .all(|c| c.matches(&request.decoded))
    }

    /// Whether an armed gate should pause this request
    pub fn intercept_on_request(&self, request: &Exchange) -> bool {
        if !self.is_enabled() {
            return true;
        }
        Self::request_rules_pass(&self.rules.read(), request)
    }

    /// Whether an armed gate should pause this response
    pub fn intercept_on_response(&self, request: Option<&Exchange>, response: &Exchange) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let rules = self.rules.read();
        let server = &response.addressing.server_name;
        rules
            .iter()
            .filter(|c| c.rule.enabled && c.rule.direction == InterceptDirection::Response)
            .filter(|c| server_matches(&c.rule.server, server))
            .all(|c| match c.rule.relationship {
                Relationship::WasIntercepted => request
                    .map(|req| Self::request_rules_pass(&rules, req))
                    .unwrap_or(false),
                _ => c.matches(&response.decoded),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_common::{Addressing, ConnectionId, Direction, GroupId, ListenerId};

    fn exchange(direction: Direction, server: &str, decoded: &[u8]) -> Exchange {
        let addressing = Addressing::new(
            ListenerId(1),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        )
        .with_server_name(server);
        let mut ex = Exchange::new(direction, addressing, "HTTP", None, ConnectionId(1), GroupId(1));
        ex.decoded = decoded.to_vec();
        ex
    }

    fn modification(direction: RuleDirection, method: MatchMethod, pattern: &str, replacement: &str) -> ModificationRule {
        ModificationRule {
            enabled: true,
            server: "*".to_string(),
            direction,
            method,
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }

    #[test]
    fn test_simple_replace_sets_modified() {
        let rules = ModificationRules::new();
        rules
            .add(modification(RuleDirection::Request, MatchMethod::Simple, "gzip", "identity"))
            .unwrap();

        let mut req = exchange(Direction::Client, "a.test", b"");
        let out = rules.replace_on_request(b"Accept-Encoding: gzip, gzip", "a.test", &mut req);
        assert_eq!(out, b"Accept-Encoding: identity, identity");
        assert!(req.modified);

        let mut resp = exchange(Direction::Server, "a.test", b"");
        let out = rules.replace_on_response(b"gzip", "a.test", &mut resp);
        assert_eq!(out, b"gzip");
        assert!(!resp.modified);
    }

    #[test]
    fn test_regex_and_binary_rules() {
        let rules = ModificationRules::new();
        rules
            .set(vec![
                modification(RuleDirection::All, MatchMethod::Regex, r"token=(\w+)", "token=[$1]"),
                modification(RuleDirection::Response, MatchMethod::Binary, "00ff", "41 42"),
            ])
            .unwrap();

        let mut resp = exchange(Direction::Server, "a.test", b"");
        let out = rules.replace_on_response(b"token=abc\x00\xff", "a.test", &mut resp);
        assert_eq!(out, b"token=[abc]AB");
        assert!(resp.modified);
    }

    #[test]
    fn test_rules_scoped_by_server_and_enabled() {
        let rules = ModificationRules::new();
        let mut scoped = modification(RuleDirection::Request, MatchMethod::Simple, "a", "b");
        scoped.server = "*.internal".to_string();
        let mut disabled = modification(RuleDirection::Request, MatchMethod::Simple, "x", "y");
        disabled.enabled = false;
        rules.set(vec![scoped, disabled]).unwrap();

        let mut req = exchange(Direction::Client, "api.internal", b"");
        assert_eq!(rules.replace_on_request(b"ax", "api.internal", &mut req), b"bx");
        let mut req = exchange(Direction::Client, "public.test", b"");
        assert_eq!(rules.replace_on_request(b"ax", "public.test", &mut req), b"ax");
    }

    #[test]
    fn test_invalid_rules_rejected_atomically() {
        let rules = ModificationRules::new();
        rules
            .add(modification(RuleDirection::All, MatchMethod::Simple, "a", "b"))
            .unwrap();
        let err = rules.set(vec![
            modification(RuleDirection::All, MatchMethod::Simple, "c", "d"),
            modification(RuleDirection::All, MatchMethod::Binary, "zz", ""),
        ]);
        assert!(err.is_err());
        assert_eq!(rules.rules().len(), 1);
        assert!(rules
            .add(modification(RuleDirection::All, MatchMethod::Regex, "(", ""))
            .is_err());
    }

    fn intercept(direction: InterceptDirection, relationship: Relationship, pattern: &str) -> InterceptRule {
        InterceptRule {
            enabled: true,
            server: "*".to_string(),
            direction,
            relationship,
            method: MatchMethod::Simple,
            pattern: pattern.to_string(),
        }
    }

    #[test]
    fn test_intercept_options_disabled_matches_everything() {
        let options = InterceptOptions::new();
        options
            .set(vec![intercept(InterceptDirection::Request, Relationship::Matches, "POST")])
            .unwrap();
        let req = exchange(Direction::Client, "a.test", b"GET /");
        assert!(options.intercept_on_request(&req));
    }

    #[test]
    fn test_intercept_request_rules() {
        let options = InterceptOptions::new();
        options.set_enabled(true);
        options
            .set(vec![
                intercept(InterceptDirection::Request, Relationship::Matches, "POST"),
                intercept(InterceptDirection::Request, Relationship::DoesNotMatch, "/static"),
            ])
            .unwrap();

        assert!(options.intercept_on_request(&exchange(Direction::Client, "a", b"POST /login")));
        assert!(!options.intercept_on_request(&exchange(Direction::Client, "a", b"GET /login")));
        assert!(!options.intercept_on_request(&exchange(Direction::Client, "a", b"POST /static/x")));
    }

    #[test]
    fn test_intercept_response_was_intercepted() {
        let options = InterceptOptions::new();
        options.set_enabled(true);
        options
            .set(vec![
                intercept(InterceptDirection::Request, Relationship::Matches, "/admin"),
                intercept(InterceptDirection::Response, Relationship::WasIntercepted, ""),
            ])
            .unwrap();

        let resp = exchange(Direction::Server, "a", b"HTTP/1.1 200 OK");
        let admin = exchange(Direction::Client, "a", b"GET /admin");
        let home = exchange(Direction::Client, "a", b"GET /");
        assert!(options.intercept_on_response(Some(&admin), &resp));
        assert!(!options.intercept_on_response(Some(&home), &resp));
        assert!(!options.intercept_on_response(None, &resp));
        // request-side evaluation ignores the response-only relationship
        assert!(options.intercept_on_request(&admin));
    }
}
