use regex::Regex;

use crate::error::RuleError;

/// Compiles a path template such as `/repos/:owner/:repo/contents/:path*`
/// into an anchored regular expression.
///
/// * `:name` matches exactly one segment
/// * `:name*` matches the rest of the path, slashes included
/// * `*` matches anything
/// * every other segment is matched literally
pub fn compile_path(template: &str) -> Result<Regex, RuleError> {
    let segments: Vec<String> = template
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                if name.ends_with('*') {
                    "(.*)".to_string()
                } else {
                    "([^/]+)".to_string()
                }
            } else if segment == "*" {
                ".*".to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect();

    let mut pattern = String::from("^");
    if template.starts_with('/') {
        pattern.push('/');
    }
    pattern.push_str(&segments.join("/"));
    pattern.push('$');

    Regex::new(&pattern).map_err(|source| RuleError::PathTemplate {
        template: template.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(template: &str, path: &str) -> bool {
        compile_path(template).unwrap().is_match(path)
    }

    #[test]
    fn named_segment_matches_exactly_one_segment() {
        assert!(matches("/repos/:owner/:repo", "/repos/snyk/broker"));
        assert!(!matches("/repos/:owner/:repo", "/repos/snyk/broker/other"));
        assert!(!matches("/repos/:owner/:repo", "/repos/snyk"));
    }

    #[test]
    fn starred_named_segment_swallows_slashes() {
        let template = "/repos/:owner/:repo/contents/:path*";
        assert!(matches(template, "/repos/snyk/broker/contents/package.json"));
        assert!(matches(template, "/repos/snyk/broker/contents/src/main.go"));
        assert!(!matches(template, "/repos/snyk/broker/other"));
    }

    #[test]
    fn bare_wildcard_matches_anything() {
        assert!(matches("/api/*", "/api/v1/users"));
        assert!(matches("/api/*", "/api/"));
        assert!(!matches("/api/*", "/other/v1"));
    }

    #[test]
    fn literal_segments_are_escaped() {
        assert!(matches("/file.json", "/file.json"));
        assert!(!matches("/file.json", "/fileXjson"));
        assert!(matches("/a+b/(c)", "/a+b/(c)"));
    }

    #[test]
    fn leading_slash_is_preserved() {
        assert!(!matches("/test", "test"));
        assert!(matches("test", "test"));
        assert!(!matches("test", "/test"));
    }

    #[test]
    fn empty_segments_are_dropped() {
        assert!(matches("/a//b/", "/a/b"));
    }
}
