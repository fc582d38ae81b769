//! Single sign-on: upstream provider logins and the downstream
//! authorization server.

pub mod context;
pub mod downstream;
pub mod endpoints;
pub mod state;
pub mod upstream;
