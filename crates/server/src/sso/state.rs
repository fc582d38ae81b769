//! The `state` value round-tripped through upstream providers.
//!
//! Wire format is `provider` or `provider_callerState`. Provider names are
//! escaped (`%` → `%25`, `_` → `%5F`) so the first `_` always separates the
//! two halves; the caller state is carried verbatim.

/// Caller state marking a retry after a failed or repeated code exchange.
pub const REFRESH: &str = "refresh";
/// Caller state marking an explicit account-link flow.
pub const BIND: &str = "bind";

const SEPARATOR: char = '_';

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthState {
    pub provider: String,
    pub caller_state: Option<String>,
}

impl OAuthState {
    pub fn new(provider: impl Into<String>, caller_state: Option<String>) -> Self {
        Self {
            provider: provider.into(),
            caller_state: caller_state.filter(|s| !s.is_empty()),
        }
    }

    pub fn refresh(provider: &str) -> Self {
        Self::new(provider, Some(REFRESH.into()))
    }

    pub fn bind(provider: &str) -> Self {
        Self::new(provider, Some(BIND.into()))
    }

    pub fn is_refresh(&self) -> bool {
        self.caller_state.as_deref() == Some(REFRESH)
    }

    pub fn is_bind(&self) -> bool {
        self.caller_state.as_deref() == Some(BIND)
    }

    pub fn encode(&self) -> String {
        let provider = self.provider.replace('%', "%25").replace(SEPARATOR, "%5F");
        match &self.caller_state {
            Some(state) => format!("{provider}{SEPARATOR}{state}"),
            None => provider,
        }
    }

    pub fn decode(raw: &str) -> Self {
        let (provider, caller_state) = match raw.split_once(SEPARATOR) {
            Some((provider, state)) => (provider, Some(state.to_string())),
            None => (raw, None),
        };
        Self::new(unescape(provider), caller_state)
    }
}

fn unescape(provider: &str) -> String {
    // Order matters: `%25` must be decoded last
    provider.replace("%5F", "_").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_provider_and_caller_state() {
        let state = OAuthState::decode("generic_xyz");
        assert_eq!(state.provider, "generic");
        assert_eq!(state.caller_state.as_deref(), Some("xyz"));
        assert_eq!(state.encode(), "generic_xyz");

        assert_eq!(OAuthState::decode("generic"), OAuthState::new("generic", None));
        assert_eq!(OAuthState::new("generic", Some(String::new())).encode(), "generic");
    }

    #[test]
    fn sentinels() {
        assert_eq!(OAuthState::refresh("generic").encode(), "generic_refresh");
        assert!(OAuthState::decode("generic_refresh").is_refresh());
        assert!(OAuthState::decode("generic_bind").is_bind());
        assert!(!OAuthState::decode("generic_refreshed").is_refresh());
    }

    #[test]
    fn caller_state_may_contain_separator() {
        let state = OAuthState::decode("generic_a_b_c");
        assert_eq!(state.provider, "generic");
        assert_eq!(state.caller_state.as_deref(), Some("a_b_c"));
    }

    #[test]
    fn provider_names_with_separator_survive() {
        for name in ["we_chat", "odd%5Fname", "100%_sure"] {
            let state = OAuthState::new(name, Some("s_1".into()));
            let decoded = OAuthState::decode(&state.encode());
            assert_eq!(decoded, state, "{name}");
        }
        assert_eq!(OAuthState::refresh("we_chat").encode(), "we%5Fchat_refresh");
    }
}
