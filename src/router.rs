//! Decides which request paths belong to the dev server
//!
//! The table is built once from configuration and never mutated. Matching is
//! segment-aware prefix matching: `/@vite/` matches `/@vite/client` but not
//! `/@vitex`, and a `*` segment matches exactly one path segment so the same
//! families can be recognised under an arbitrary base path.

use crate::config::Config;

/// Build-tool internal path families that are always routed to the dev server
pub const BUILD_TOOL_PREFIXES: &[&str] = &[
    "/@vite/",
    "/@id/",
    "/@fs/",
    "/@react-refresh",
    "/__vite_ping",
    "/node_modules/.vite/",
];

/// Families recognised below a single base-path segment, e.g. `/static/@vite/client`
pub const BASED_PATTERNS: &[&str] = &["/*/@vite/", "/*/@id/", "/*/@fs/"];

/// Result of classifying a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// Path belongs to the dev server
    pub proxied: bool,
    /// Path is a WebSocket endpoint of the dev server
    pub upgrade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// One entry of the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatcher {
    pattern: String,
    segments: Vec<Segment>,
    /// Whether the last segment must match a whole path segment
    closed: bool,
    upgrade: bool,
}

impl PathMatcher {
    /// Create a matcher. A trailing `/` means "everything below this directory";
    /// without it the last segment may also match as a plain prefix
    /// (`/@react-refresh` matches `/@react-refresh.js`).
    pub fn new(pattern: &str, upgrade: bool) -> Self {
        let closed = pattern.ends_with('/');
        let segments = pattern
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "*" {
                    Segment::Any
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self {
            pattern: pattern.to_string(),
            segments,
            closed,
            upgrade,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn upgrade(&self) -> bool {
        self.upgrade
    }

    /// Test a decoded path (query string already removed)
    pub fn matches(&self, path: &str) -> bool {
        if self.segments.is_empty() {
            return path.starts_with('/');
        }

        let mut parts = path.trim_start_matches('/').split('/');
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            let Some(part) = parts.next() else {
                return false;
            };
            let is_last = i == last;
            let ok = match segment {
                Segment::Any => !part.is_empty(),
                Segment::Literal(lit) if is_last && !self.closed => part.starts_with(lit.as_str()),
                Segment::Literal(lit) => part == lit,
            };
            if !ok {
                return false;
            }
            if is_last && self.closed {
                // `/@vite/` needs something below the directory, or the bare directory itself
                return true;
            }
        }
        true
    }
}

/// Immutable routing table deciding which paths go to the dev server
#[derive(Debug, Clone, Default)]
pub struct ProxyRouter {
    matchers: Vec<PathMatcher>,
}

impl ProxyRouter {
    pub fn new(matchers: Vec<PathMatcher>) -> Self {
        Self { matchers }
    }

    /// Build the table from configuration: build-tool families, the HMR
    /// endpoint, source directories, the asset base and any extra prefixes.
    pub fn from_config(config: &Config) -> Self {
        let mut matchers: Vec<PathMatcher> = BUILD_TOOL_PREFIXES
            .iter()
            .chain(BASED_PATTERNS.iter())
            .map(|p| PathMatcher::new(p, false))
            .collect();

        matchers.push(PathMatcher::new(&config.proxy.hmr_path, true));

        for dir in &config.proxy.source_dirs {
            matchers.push(PathMatcher::new(dir, false));
        }

        let base = config.assets.normalized_base();
        if base != "/" {
            matchers.push(PathMatcher::new(&base, false));
        }

        for extra in &config.proxy.extra_prefixes {
            matchers.push(PathMatcher::new(&extra.prefix, extra.upgrade));
        }

        Self::new(matchers)
    }

    pub fn matchers(&self) -> &[PathMatcher] {
        &self.matchers
    }

    /// Classify a raw request path. The path is percent-decoded first; a path
    /// that does not decode is never proxied.
    pub fn classify(&self, raw_path: &str) -> Classification {
        let path = raw_path.split(['?', '#']).next().unwrap_or("");
        let Ok(decoded) = urlencoding::decode(path) else {
            return Classification::default();
        };

        self.matchers
            .iter()
            .filter(|m| m.matches(&decoded))
            .fold(Classification::default(), |acc, m| Classification {
                proxied: true,
                upgrade: acc.upgrade || m.upgrade,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayMode, PrefixConfig};

    fn router() -> ProxyRouter {
        let mut config = Config::for_mode(GatewayMode::DevProxied);
        config.proxy.extra_prefixes.push(PrefixConfig {
            prefix: "/__framework/refresh".to_string(),
            upgrade: false,
        });
        ProxyRouter::from_config(&config)
    }

    fn proxied(path: &str) -> bool {
        router().classify(path).proxied
    }

    #[test]
    fn test_every_table_entry_matches_its_literal_example() {
        let router = router();
        for matcher in router.matchers() {
            let example = matcher
                .pattern()
                .replace('*', "base")
                .trim_end_matches('/')
                .to_string()
                + "/example.js";
            let result = router.classify(&example);
            assert!(result.proxied, "{} should match {}", matcher.pattern(), example);
            if matcher.upgrade() {
                assert!(result.upgrade, "{} should request an upgrade", example);
            }
        }
    }

    #[test]
    fn test_known_build_tool_families() {
        for path in [
            "/@vite/client",
            "/@vite/env",
            "/@id/__x00__virtual:module",
            "/@fs/home/dev/project/node_modules/vue/dist/vue.js",
            "/@react-refresh",
            "/__vite_ping",
            "/node_modules/.vite/deps/react.js?v=1234",
            "/src/main.ts",
            "/resources/js/app.tsx",
            "/static/@vite/client",
            "/static/src/main.ts",
            "/__framework/refresh",
        ] {
            assert!(proxied(path), "{} should be proxied", path);
        }
    }

    #[test]
    fn test_paths_outside_the_table() {
        for path in [
            "/",
            "/index.html",
            "/api/users",
            "/@vitex",
            "/srcs/main.ts",
            "/node_modules/react/index.js",
            "/a/b/@vite/client",
            "/favicon.ico",
        ] {
            assert!(!proxied(path), "{} should not be proxied", path);
        }
    }

    #[test]
    fn test_hmr_endpoint_requests_upgrade() {
        let router = router();
        assert_eq!(
            router.classify("/vite-hmr"),
            Classification { proxied: true, upgrade: true }
        );
        assert_eq!(
            router.classify("/@vite/client"),
            Classification { proxied: true, upgrade: false }
        );
        assert_eq!(router.classify("/api"), Classification::default());
    }

    #[test]
    fn test_percent_encoded_at_sign() {
        let router = router();
        assert_eq!(router.classify("/%40vite/client"), router.classify("/@vite/client"));
        assert_eq!(
            router.classify("/static/%40vite/client"),
            router.classify("/static/@vite/client")
        );
        assert_eq!(router.classify("/%40fs/tmp/x.js"), router.classify("/@fs/tmp/x.js"));
    }

    #[test]
    fn test_undecodable_path_is_not_proxied() {
        // %FF is not valid UTF-8 once decoded
        assert_eq!(router().classify("/@vite/%FF"), Classification::default());
    }

    #[test]
    fn test_query_string_is_ignored() {
        assert!(proxied("/src/main.ts?import&t=123"));
        assert!(!proxied("/api?next=/src/main.ts"));
    }

    #[test]
    fn test_order_independence() {
        let forward = router();
        let mut reversed = forward.matchers().to_vec();
        reversed.reverse();
        let reversed = ProxyRouter::new(reversed);

        for path in [
            "/vite-hmr",
            "/vite-hmr/extra",
            "/@vite/client",
            "/static/@vite/client",
            "/src/a.ts",
            "/nope",
        ] {
            assert_eq!(forward.classify(path), reversed.classify(path), "{}", path);
        }
    }

    #[test]
    fn test_overlapping_prefixes_merge_upgrade() {
        let a = ProxyRouter::new(vec![
            PathMatcher::new("/live/", false),
            PathMatcher::new("/live/ws", true),
        ]);
        let b = ProxyRouter::new(vec![
            PathMatcher::new("/live/ws", true),
            PathMatcher::new("/live/", false),
        ]);
        assert_eq!(a.classify("/live/ws"), Classification { proxied: true, upgrade: true });
        assert_eq!(a.classify("/live/ws"), b.classify("/live/ws"));
        assert_eq!(a.classify("/live/page"), Classification { proxied: true, upgrade: false });
    }

    #[test]
    fn test_matcher_segment_rules() {
        let dir = PathMatcher::new("/src/", false);
        assert!(dir.matches("/src/"));
        assert!(dir.matches("/src/deep/file.ts"));
        assert!(!dir.matches("/srcx/file.ts"));

        let open = PathMatcher::new("/@react-refresh", false);
        assert!(open.matches("/@react-refresh"));
        assert!(open.matches("/@react-refresh.js"));
        assert!(!open.matches("/@react"));

        let wildcard = PathMatcher::new("/*/@id/", false);
        assert!(wildcard.matches("/static/@id/x"));
        assert!(!wildcard.matches("//@id/x"));
        assert!(!wildcard.matches("/@id/x"));
    }

    #[test]
    fn test_root_base_adds_no_catch_all() {
        let mut config = Config::for_mode(GatewayMode::DevProxied);
        config.assets.base_url = "/".to_string();
        let router = ProxyRouter::from_config(&config);
        assert!(!router.classify("/dashboard").proxied);
    }
}
