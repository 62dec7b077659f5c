use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{Area, NewArea};
use crate::schema::areas;
use crate::state::AppState;

#[derive(Serialize)]
pub struct AreaResponse {
    pub id: Uuid,
    pub nombre: String,
    pub codigo: String,
    pub activa: bool,
}

impl From<Area> for AreaResponse {
    fn from(area: Area) -> Self {
        Self {
            id: area.id,
            nombre: area.name,
            codigo: area.code,
            activa: area.active,
        }
    }
}

pub async fn list_areas(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<AreaResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<Area> = areas::table.order(areas::name.asc()).load(&mut conn)?;
    Ok(Json(rows.into_iter().map(AreaResponse::from).collect()))
}

#[derive(Deserialize)]
pub struct CreateAreaRequest {
    pub nombre: String,
    pub codigo: String,
}

pub async fn create_area(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateAreaRequest>,
) -> AppResult<(StatusCode, Json<AreaResponse>)> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona areas"));
    }
    if payload.nombre.trim().is_empty() || payload.codigo.trim().is_empty() {
        return Err(AppError::bad_request("nombre y codigo requeridos"));
    }

    let mut conn = state.db()?;
    let row = NewArea {
        id: Uuid::new_v4(),
        name: payload.nombre.trim().to_string(),
        code: payload.codigo.trim().to_uppercase(),
    };
    diesel::insert_into(areas::table)
        .values(&row)
        .execute(&mut conn)?;
    let area: Area = areas::table.find(row.id).first(&mut conn)?;
    Ok((StatusCode::CREATED, Json(area.into())))
}

#[derive(Deserialize)]
pub struct UpdateAreaRequest {
    pub nombre: Option<String>,
    pub activa: Option<bool>,
}

pub async fn update_area(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAreaRequest>,
) -> AppResult<Json<AreaResponse>> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona areas"));
    }
    let mut conn = state.db()?;
    areas::table
        .find(id)
        .select(areas::id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if let Some(nombre) = payload.nombre {
        diesel::update(areas::table.find(id))
            .set(areas::name.eq(nombre.trim().to_string()))
            .execute(&mut conn)?;
    }
    if let Some(activa) = payload.activa {
        diesel::update(areas::table.find(id))
            .set(areas::active.eq(activa))
            .execute(&mut conn)?;
    }

    let area: Area = areas::table.find(id).first(&mut conn)?;
    Ok(Json(area.into()))
}
