//! Transport facts the flows need from the current request.

use axum::http::{HeaderMap, header};
use url::Url;

/// Headers of interest plus the broker's external base URL.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub user_agent: String,
    pub referer: Option<String>,
    pub base_url: Url,
}

impl RequestContext {
    pub fn new(base_url: Url) -> Self {
        Self {
            user_agent: String::new(),
            referer: None,
            base_url,
        }
    }

    pub fn from_headers(headers: &HeaderMap, base_url: Url) -> Self {
        let read = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            user_agent: read(header::USER_AGENT).unwrap_or_default(),
            referer: read(header::REFERER).filter(|r| !r.is_empty()),
            base_url,
        }
    }

    /// Absolute URL for a path on this broker, below any path prefix of the
    /// public base URL.
    pub fn absolute(&self, path_and_query: &str) -> String {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        match base.join(path_and_query.trim_start_matches('/')) {
            Ok(url) => url.to_string(),
            Err(_) => path_and_query.to_string(),
        }
    }

    /// `target` if it is a relative path or lives on this broker's origin.
    ///
    /// Anything else (other hosts, scheme-relative `//host` paths, garbage)
    /// is rejected so the flows cannot be used as an open redirect.
    pub fn safe_return_url(&self, target: Option<&str>) -> Option<String> {
        let target = target?.trim();
        if target.is_empty() {
            return None;
        }
        if target.starts_with('/') && !target.starts_with("//") && !target.starts_with("/\\") {
            return Some(target.to_string());
        }

        let url = Url::parse(target).ok()?;
        (url.origin() == self.base_url.origin()).then(|| url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ctx() -> RequestContext {
        RequestContext::new(Url::parse("https://sso.example.com/").unwrap())
    }

    #[test]
    fn reads_user_agent_and_referer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0 DingTalk/6.0"));
        headers.insert(header::REFERER, HeaderValue::from_static("https://sso.example.com/me"));

        let ctx = RequestContext::from_headers(&headers, ctx().base_url);
        assert!(ctx.user_agent.contains("DingTalk"));
        assert_eq!(ctx.referer.as_deref(), Some("https://sso.example.com/me"));
    }

    #[test]
    fn return_url_guard() {
        let ctx = ctx();
        assert_eq!(ctx.safe_return_url(Some("/admin?x=1")).as_deref(), Some("/admin?x=1"));
        assert_eq!(
            ctx.safe_return_url(Some("https://sso.example.com/home")).as_deref(),
            Some("https://sso.example.com/home")
        );
        assert_eq!(ctx.safe_return_url(Some("https://evil.example.net/")), None);
        assert_eq!(ctx.safe_return_url(Some("//evil.example.net/")), None);
        assert_eq!(ctx.safe_return_url(Some("")), None);
        assert_eq!(ctx.safe_return_url(None), None);
    }

    #[test]
    fn absolute_joins_onto_base() {
        assert_eq!(
            ctx().absolute("/sso/login_info?r=%2F"),
            "https://sso.example.com/sso/login_info?r=%2F"
        );

        let prefixed = RequestContext::new(Url::parse("https://example.com/auth").unwrap());
        assert_eq!(prefixed.absolute("/sso/logout"), "https://example.com/auth/sso/logout");
    }
}
