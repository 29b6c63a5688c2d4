use axum::http::{header::AUTHORIZATION, HeaderMap};

/// Resolve the access token of a socket upgrade request.
///
/// Browsers cannot set headers on WebSocket requests, so the `token` query
/// parameter is accepted when no bearer header is present.
pub fn extract_upgrade_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
        .map(ToOwned::to_owned)
}

pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

#[cfg(test)]
mod tests {
    use super::{extract_bearer_token, extract_upgrade_token};
    use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer  abc "), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
    }

    #[test]
    fn header_wins_over_query_parameter() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(
            extract_upgrade_token(&headers, Some("from-query")).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn query_parameter_is_used_without_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_upgrade_token(&headers, Some("abc")).as_deref(), Some("abc"));
        assert_eq!(extract_upgrade_token(&headers, Some("  ")), None);
        assert_eq!(extract_upgrade_token(&headers, None), None);
    }
}
