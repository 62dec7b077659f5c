pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_MESA_PARTES: &str = "mesa_partes";
pub const ROLE_SUPERVISOR: &str = "supervisor";
pub const ROLE_FUNCIONARIO: &str = "funcionario";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
    pub area_id: Option<Uuid>,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// Intake staff and admins may register and route documents on
    /// behalf of any area.
    pub fn can_route(&self) -> bool {
        self.role == ROLE_ADMIN || self.role == ROLE_MESA_PARTES
    }

    pub fn is_supervisor(&self) -> bool {
        self.role == ROLE_ADMIN || self.role == ROLE_SUPERVISOR
    }

    /// Whether the caller works the inbox of `area`.
    pub fn belongs_to(&self, area: Uuid) -> bool {
        self.area_id == Some(area)
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

        let claims = state
            .jwt
            .verify_token(bearer.token())
            .map_err(|_| AppError::unauthorized())?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
            area_id: claims.area_id,
        })
    }
}
