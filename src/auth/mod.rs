pub mod jwt;

use std::str::FromStr;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

/// Caller role as carried in the access token. Unknown roles are plain users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Leader,
    Guide,
    User,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Leader => "leader",
            Self::Guide => "guide",
            Self::User => "user",
        }
    }
}

impl FromStr for UserRole {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "leader" => Self::Leader,
            "guide" => Self::Guide,
            _ => Self::User,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub username: String,
    pub role: UserRole,
}

impl AuthenticatedUser {
    pub fn from_token(state: &AppState, token: &str) -> AppResult<Self> {
        let claims = state
            .jwt
            .verify_token(token)
            .map_err(|_| AppError::unauthorized())?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role.parse().unwrap_or(UserRole::User),
        })
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.role == UserRole::Admin {
            Ok(())
        } else {
            Err(AppError::forbidden())
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        Self::from_token(state, bearer.token())
    }
}
