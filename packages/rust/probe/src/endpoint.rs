//! Endpoint string normalisation.
//!
//! Raw endpoint values arrive blank, scheme-less, protocol-relative or
//! list-encoded (`['https://a/oai', 'https://b/oai']`). Everything that turns
//! such a value into something requestable lives here.

/// Strip list/bracket encoding and stray quotes, keeping the first element.
///
/// Returns `None` when nothing usable remains.
pub fn unwrap_endpoint(raw: &str) -> Option<String> {
    let mut text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if text.len() >= 2 && text.starts_with('[') && text.ends_with(']') {
        let inner = text[1..text.len() - 1].trim();
        text = inner.split(',').next().unwrap_or("").trim();
    }

    let text = text.trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '[' | ']'));
    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        return None;
    }
    Some(text.to_string())
}

/// Unwrap and ensure an `http(s)://` prefix, defaulting to `https://`.
pub fn clean_endpoint(raw: &str) -> Option<String> {
    let text = unwrap_endpoint(raw)?;
    if let Some(rest) = text.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if has_http_scheme(&text) {
        return Some(text);
    }
    Some(format!("https://{text}"))
}

/// Ordered, de-duplicated candidate URLs for a raw endpoint value.
///
/// | input                  | candidates                         |
/// |------------------------|------------------------------------|
/// | blank                  | none                               |
/// | `host/oai`, `//host/oai` | `https://host/oai`, `http://host/oai` |
/// | `http://host/oai`      | `http://host/oai`, `https://host/oai` |
/// | `https://host/oai`     | `https://host/oai`                 |
/// | other `scheme://...`   | the value as given                 |
pub fn endpoint_candidates(raw: &str) -> Vec<String> {
    let Some(text) = unwrap_endpoint(raw) else {
        return Vec::new();
    };

    let mut candidates = Vec::with_capacity(2);
    match scheme_of(&text) {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {
            let rest = &text[scheme.len() + 3..];
            candidates.push(text.clone());
            candidates.push(format!("https://{rest}"));
        }
        Some(_) => candidates.push(text),
        None => {
            let rest = text.trim_start_matches('/');
            if rest.is_empty() {
                return Vec::new();
            }
            candidates.push(format!("https://{rest}"));
            candidates.push(format!("http://{rest}"));
        }
    }

    let mut seen: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !seen.contains(&candidate) {
            seen.push(candidate);
        }
    }
    seen
}

/// Append an OAI-PMH `verb` parameter, respecting any existing query string.
pub fn build_probe_url(base: &str, verb: &str) -> String {
    if base.ends_with('?') || base.ends_with('&') {
        format!("{base}verb={verb}")
    } else if base.contains('?') {
        format!("{base}&verb={verb}")
    } else {
        format!("{base}?verb={verb}")
    }
}

fn has_http_scheme(text: &str) -> bool {
    matches!(scheme_of(text), Some(s) if s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"))
}

/// The scheme of `scheme://rest`, if the prefix is a syntactically valid scheme.
fn scheme_of(text: &str) -> Option<&str> {
    let (scheme, _) = text.split_once("://")?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}
