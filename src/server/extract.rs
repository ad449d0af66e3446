use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use super::http::AppState;
use crate::error::Error;
use crate::types::Id;

/// The caller, identified by a `Bearer` session token
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Id);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|x| x.to_str().ok())
            .ok_or(Error::Unauthorized("missing authorization"))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(Error::Unauthorized("authorization must be Bearer"))?;

        state.tokens.verify(token).map(AuthUser)
    }
}
