//! Snippet rendering.
//!
//! Snippets may reference the certificate directory as `{{ .CertsPath }}`.
//! That is the only recognised action; anything else inside `{{ }}` is an
//! error so a typo never reaches the routing engine as literal text.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{ProxyError, Result};

const ACTION_PATTERN: &str = r"\{\{(.*?)\}\}";
const CERTS_PATH_FIELD: &str = ".CertsPath";

/// The action matcher, compiled on first use
fn actions() -> Result<&'static Regex> {
    static ACTIONS: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    ACTIONS
        .get_or_init(|| Regex::new(ACTION_PATTERN))
        .as_ref()
        .map_err(|e| ProxyError::Template(format!("invalid action pattern: {}", e)))
}

/// Render a snippet, substituting the certificate directory.
pub fn render_snippet(snippet: &str, certs_path: &Path) -> Result<String> {
    let actions = actions()?;
    let certs_path = certs_path.to_string_lossy();

    let mut rendered = String::with_capacity(snippet.len());
    let mut last = 0;
    for capture in actions.captures_iter(snippet) {
        let (Some(whole), Some(inner)) = (capture.get(0), capture.get(1)) else {
            continue;
        };
        let field = inner.as_str().trim();
        if field != CERTS_PATH_FIELD {
            return Err(ProxyError::Template(format!(
                "unknown action '{{{{{}}}}}' at offset {}",
                inner.as_str(),
                whole.start()
            )));
        }
        rendered.push_str(&snippet[last..whole.start()]);
        rendered.push_str(&certs_path);
        last = whole.end();
    }
    rendered.push_str(&snippet[last..]);

    if snippet[last..].contains("{{") {
        return Err(ProxyError::Template("unclosed action".to_string()));
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_pattern_compiled_once() {
        let first = actions().unwrap();
        let second = actions().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_render_substitutes_certs_path() {
        let snippet = "ssl_certificate {{.CertsPath}}/a.com.crt;\nssl_certificate_key {{ .CertsPath }}/a.com.key;";
        let rendered = render_snippet(snippet, Path::new("/etc/nginx/certs")).unwrap();
        assert_eq!(
            rendered,
            "ssl_certificate /etc/nginx/certs/a.com.crt;\nssl_certificate_key /etc/nginx/certs/a.com.key;"
        );
    }

    #[test]
    fn test_render_plain_text_is_untouched() {
        let snippet = "location / { proxy_pass https://backend; }";
        assert_eq!(render_snippet(snippet, Path::new("/certs")).unwrap(), snippet);
    }

    #[test]
    fn test_render_is_idempotent_on_rendered_output() {
        let once = render_snippet("{{ .CertsPath }}/x.crt", Path::new("/certs")).unwrap();
        let twice = render_snippet(&once, Path::new("/other")).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_render_rejects_unknown_action() {
        let err = render_snippet("{{ .Backend }}", Path::new("/certs")).unwrap_err();
        assert!(matches!(err, ProxyError::Template(_)));
    }

    #[test]
    fn test_render_rejects_unclosed_action() {
        let err = render_snippet("ssl_certificate {{ .CertsPath", Path::new("/certs")).unwrap_err();
        assert!(matches!(err, ProxyError::Template(_)));
    }
}
