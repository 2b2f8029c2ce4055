//! Session and token lifecycle for JoinTrip clients.
//!
//! [`auth::TokenStore`] persists the token pair, [`auth::OAuthFlowHandler`] turns a
//! provider redirect into tokens, [`api::SessionClient`] attaches and refreshes them on
//! every request, and [`auth::SessionContext`] exposes the resulting session state.

pub mod api;
pub mod auth;
pub mod config;
