use axum::extract::State;
use axum::Json;
use dl_agent::Specialist;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct SpecialistsResponse {
    pub specialists: Vec<Specialist>,
}

pub async fn list(State(state): State<AppState>) -> Json<SpecialistsResponse> {
    Json(SpecialistsResponse {
        specialists: state.bridge.specialists(),
    })
}
