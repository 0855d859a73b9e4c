//! Catch-all path parsing: `/<gateway-prefix>/<service>/<rest>`.
//!
//! Grounded on `gateway/core/router.py::RequestRouter._parse_path`: strip
//! the configured prefix, split on the first remaining `/`. A path that
//! resolves to an empty service name (including the prefix alone) is
//! unparseable and this returns `None` rather than guessing at a route.

/// Splits an inbound request path into `(service, rest)`.
///
/// `prefix` is matched against the path's leading segment(s) and
/// stripped before parsing; a request path that doesn't start with the
/// prefix is parsed as-is (an empty prefix, the default, always matches).
pub fn parse_service_path<'a>(prefix: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let prefix = prefix.trim_end_matches('/');
    let stripped = if !prefix.is_empty() && path.starts_with(prefix) {
        &path[prefix.len()..]
    } else {
        path
    };
    let trimmed = stripped.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((service, rest)) if !service.is_empty() => Some((service, rest)),
        Some(_) => None,
        None => Some((trimmed, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_service_and_rest() {
        assert_eq!(parse_service_path("/api", "/api/auth/me"), Some(("auth", "me")));
    }

    #[test]
    fn service_with_no_trailing_path_has_empty_rest() {
        assert_eq!(parse_service_path("/api", "/api/auth"), Some(("auth", "")));
    }

    #[test]
    fn path_matching_only_the_prefix_is_unparseable() {
        assert_eq!(parse_service_path("/api", "/api"), None);
        assert_eq!(parse_service_path("/api", "/api/"), None);
    }

    #[test]
    fn empty_prefix_parses_the_first_segment_as_the_service() {
        assert_eq!(parse_service_path("", "/auth/me"), Some(("auth", "me")));
    }

    #[test]
    fn root_path_is_unparseable() {
        assert_eq!(parse_service_path("", "/"), None);
        assert_eq!(parse_service_path("", ""), None);
    }
}
