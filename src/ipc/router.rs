use super::error::{respond, IpcError};
use super::handlers;
use super::types::{AppState, Request};

type Family = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

/// Handler families in dispatch order; the first to claim a method answers it.
const FAMILIES: [Family; 13] = [
    handlers::core::try_handle,
    handlers::auth::try_handle,
    handlers::users::try_handle,
    handlers::setup::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::results::try_handle,
    handlers::fees::try_handle,
    handlers::approvals::try_handle,
    handlers::reports::try_handle,
    handlers::notifications::try_handle,
    handlers::dashboard::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            return resp;
        }
    }
    respond(&req.id, Err(IpcError::NotImplemented(req.method.clone())))
}
