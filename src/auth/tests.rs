use super::*;

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let headers = headers_with("Bearer principal-7f3a");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "principal-7f3a");
    }

    #[test]
    fn valid_bearer_token_with_extra_whitespace() {
        let headers = headers_with("Bearer   principal-7f3a  ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "principal-7f3a");
    }

    #[test]
    fn case_insensitive_bearer() {
        let headers = headers_with("bearer principal-7f3a");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "principal-7f3a");
    }

    #[test]
    fn missing_authorization_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Missing));
    }

    #[test]
    fn missing_bearer_prefix() {
        let headers = headers_with("principal-7f3a");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn wrong_auth_scheme() {
        let headers = headers_with("Basic dXNlcjpwYXNz");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_with_empty_token() {
        let headers = headers_with("Bearer  ");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Empty));
    }
}

mod resolve_principal_tests {
    use super::*;

    #[test]
    fn auth_disabled_uses_default_principal() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_principal(&headers, false).unwrap(), DEFAULT_PRINCIPAL);
    }

    #[test]
    fn auth_disabled_ignores_header() {
        let headers = headers_with("Bearer someone-else");
        assert_eq!(resolve_principal(&headers, false).unwrap(), DEFAULT_PRINCIPAL);
    }

    #[test]
    fn auth_enabled_requires_token() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_principal(&headers, true), Err(TokenError::Missing));

        let headers = headers_with("Bearer u1");
        assert_eq!(resolve_principal(&headers, true).unwrap(), "u1");
    }
}

#[test]
fn token_error_messages() {
    assert_eq!(TokenError::Missing.to_string(), "Authorization token not provided");
    assert_eq!(
        TokenError::InvalidFormat.to_string(),
        "Invalid authorization token format"
    );
    assert_eq!(TokenError::Empty.to_string(), "Authorization token is empty");
}
