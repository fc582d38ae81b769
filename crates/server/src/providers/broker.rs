//! A peer instance of this broker used as an upstream provider.
//!
//! The peer speaks the downstream surface served by `sso::endpoints`, so a
//! broker is a generic provider with those endpoints as its defaults plus a
//! remote logout.

use super::GenericProvider;
use crate::config::ProviderConfig;

const AUTHORIZE: &str =
    "sso/authorize?client_id={key}&redirect_uri={redirect}&response_type=code&scope={scope}&state={state}";
const ACCESS_TOKEN: &str =
    "sso/access_token?client_id={key}&client_secret={secret}&code={code}&grant_type=authorization_code";
const USER_INFO: &str = "sso/user_info?access_token={token}";
const LOGOUT: &str = "sso/logout?client_id={key}&r={redirect}&state={state}";

pub fn provider(config: &ProviderConfig, http: reqwest::Client) -> GenericProvider {
    let mut config = config.clone();
    for (slot, default) in [
        (&mut config.authorize_url, AUTHORIZE),
        (&mut config.access_token_url, ACCESS_TOKEN),
        (&mut config.user_info_url, USER_INFO),
        (&mut config.logout_url, LOGOUT),
    ] {
        if slot.is_empty() {
            *slot = default.to_string();
        }
    }
    GenericProvider::new(config, http)
}
