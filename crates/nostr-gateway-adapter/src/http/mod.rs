/*
[INPUT]:  HTTP client configuration, gateway endpoints and the identity manager
[OUTPUT]: Authenticated HTTP responses and the crate-wide error type
[POS]:    HTTP layer - REST communication with the gateway backend
[UPDATE]: When adding client behavior or changing request authentication
*/

pub mod auth;
pub mod client;
pub mod error;

pub use auth::{
    AUTH_SCHEME, AuthorizedHeader, LogNavigator, LoginNavigator, RequestAuthenticator,
    build_auth_event, decode_header, encode_header,
};
pub use client::{ClientConfig, DEFAULT_BASE_URL, GatewayClient};
pub use error::{GatewayError, Result};
