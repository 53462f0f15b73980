use url::Url;

/// Request verbs the gatekeeper distinguishes. Only `Get` is ever eligible
/// for caching; every other verb bypasses interception entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Other,
}

/// Credential disposition of a request, as declared by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    SameOrigin,
    Include,
}

/// A request as seen by the classifier: a pure value object that can be
/// fabricated freely in tests.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub credentials: CredentialsMode,
    pub headers: Vec<(String, String)>,
}

impl RequestDescriptor {
    /// Plain uncredentialed GET, the common case for static assets.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            credentials: CredentialsMode::Omit,
            headers: Vec::new(),
        }
    }

    /// Header presence check, case-insensitive. Presence is what matters:
    /// an `Authorization` header with an empty value still marks the request
    /// as auth-bearing.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(name))
    }
}

/// Why a request was forced past the cache untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    ApiPath,
    BackendHost,
    Method,
    Credentials,
    Authorization,
}

impl BypassReason {
    /// Stable label for log fields and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            BypassReason::ApiPath => "api_path",
            BypassReason::BackendHost => "backend_host",
            BypassReason::Method => "method",
            BypassReason::Credentials => "credentials",
            BypassReason::Authorization => "authorization",
        }
    }
}

/// Outcome of classifying one request.
///
/// `Bypass` and `Ignore` both mean "never substitute a response": `Bypass` is
/// an explicit exclusion (API, credentialed, non-GET), `Ignore` is a
/// cross-origin GET the gatekeeper simply has no business with. Only
/// `Cacheable` requests may be handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Bypass(BypassReason),
    Cacheable,
    Ignore,
}

/// Read-only classification policy, fixed at construction.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    /// The running application's own origin. Only GETs to this origin are
    /// ever cached.
    pub origin: Url,
    /// Hostname substrings that force a bypass regardless of path. Meant for
    /// deployment-specific backend domains.
    pub bypass_hosts: Vec<String>,
}

/// Decide what the gatekeeper may do with a request.
///
/// A request carrying anything dynamic or authenticated must reach the
/// network directly, unmodified: shadowing it risks serving stale
/// authenticated data, breaking auth flows, or duplicating non-idempotent
/// writes. The bypass conditions are checked in order; the first hit wins.
pub fn classify(request: &RequestDescriptor, policy: &PolicyConfig) -> Classification {
    if request.url.path().starts_with("/api/") {
        return Classification::Bypass(BypassReason::ApiPath);
    }

    if let Some(host) = request.url.host_str() {
        if policy
            .bypass_hosts
            .iter()
            .any(|fragment| host.contains(fragment.as_str()))
        {
            return Classification::Bypass(BypassReason::BackendHost);
        }
    }

    if request.method != Method::Get {
        return Classification::Bypass(BypassReason::Method);
    }

    if request.credentials == CredentialsMode::Include {
        return Classification::Bypass(BypassReason::Credentials);
    }

    if request.has_header("authorization") {
        return Classification::Bypass(BypassReason::Authorization);
    }

    if request.url.origin() == policy.origin.origin() {
        Classification::Cacheable
    } else {
        // Cross-origin GET: leave it alone. Not an explicit bypass — the
        // gatekeeper never substitutes a response for it and never caches it.
        Classification::Ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicyConfig {
        PolicyConfig {
            origin: Url::parse("https://app.example.com").unwrap(),
            bypass_hosts: vec!["onrender.com".to_string()],
        }
    }

    fn req(url: &str) -> RequestDescriptor {
        RequestDescriptor::get(Url::parse(url).unwrap())
    }

    #[test]
    fn api_paths_bypass() {
        let got = classify(&req("https://app.example.com/api/posts"), &policy());
        assert_eq!(got, Classification::Bypass(BypassReason::ApiPath));
    }

    #[test]
    fn backend_hosts_bypass_regardless_of_path() {
        let got = classify(&req("https://myapp.onrender.com/widget.js"), &policy());
        assert_eq!(got, Classification::Bypass(BypassReason::BackendHost));
    }

    #[test]
    fn non_get_bypasses() {
        let mut request = req("https://app.example.com/posts");
        request.method = Method::Post;
        let got = classify(&request, &policy());
        assert_eq!(got, Classification::Bypass(BypassReason::Method));
    }

    #[test]
    fn credentialed_requests_bypass() {
        let mut request = req("https://app.example.com/avatar.png");
        request.credentials = CredentialsMode::Include;
        let got = classify(&request, &policy());
        assert_eq!(got, Classification::Bypass(BypassReason::Credentials));
    }

    #[test]
    fn authorization_header_bypasses_even_when_empty() {
        let mut request = req("https://app.example.com/feed");
        request.headers.push(("Authorization".to_string(), String::new()));
        let got = classify(&request, &policy());
        assert_eq!(got, Classification::Bypass(BypassReason::Authorization));
    }

    #[test]
    fn authorized_api_post_bypasses_on_path_first() {
        // POST /api/posts with a bearer token: the path rule fires before the
        // method and header rules ever run.
        let mut request = req("https://app.example.com/api/posts");
        request.method = Method::Post;
        request
            .headers
            .push(("Authorization".to_string(), "Bearer xyz".to_string()));
        let got = classify(&request, &policy());
        assert_eq!(got, Classification::Bypass(BypassReason::ApiPath));
    }

    #[test]
    fn same_origin_get_is_cacheable() {
        let got = classify(&req("https://app.example.com/index.html"), &policy());
        assert_eq!(got, Classification::Cacheable);
    }

    #[test]
    fn port_mismatch_is_not_same_origin() {
        let got = classify(&req("https://app.example.com:8443/index.html"), &policy());
        assert_eq!(got, Classification::Ignore);
    }

    #[test]
    fn cross_origin_get_is_ignored() {
        let got = classify(&req("https://partner.example.com/widget.js"), &policy());
        assert_eq!(got, Classification::Ignore);
    }
}
