//! Credentials and bearer tokens for upstream Google endpoints.

pub mod google;
pub mod oauth;

pub use google::{
    AuthorizedUser, GoogleCredentials, GoogleTokenSource, ServiceAccountKey, ServiceAccountSigner,
};
pub use oauth::{AccessToken, RefreshTokenGrant};
