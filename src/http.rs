use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    controller::{ControllerError, ControllerHandle},
    entity::GuildId,
    guild::GuildStatus,
};

#[derive(thiserror::Error, Debug)]
pub enum StatusError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let status = match &self {
            StatusError::Controller(ControllerError::InvalidId(_)) => StatusCode::BAD_REQUEST,
            StatusError::Controller(ControllerError::Resolution(_)) => StatusCode::BAD_REQUEST,
            StatusError::Controller(ControllerError::ServiceUnavailable) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, self.to_string()).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

#[axum::debug_handler]
async fn guild_status(
    Path(guild): Path<String>,
    State(controller): State<ControllerHandle>,
) -> Result<Json<GuildStatus>, StatusError> {
    let guild = GuildId::new(&guild).map_err(ControllerError::from)?;
    let status = controller.status(&guild).await?;
    Ok(Json(status))
}

pub fn router(controller: ControllerHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/guilds/{guild}", get(guild_status))
        .with_state(controller)
}
