pub mod admin;
pub mod chat;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::require_admin;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/chatbots", post(admin::create_chatbot).get(admin::list_chatbots))
        .route(
            "/chatbots/:id",
            get(admin::get_chatbot)
                .patch(admin::update_chatbot)
                .delete(admin::delete_chatbot),
        )
        .route("/chatbots/:id/status", axum::routing::patch(admin::set_status))
        .route(
            "/chatbots/:id/documents",
            post(admin::upload_document).get(admin::list_documents),
        )
        .route("/chatbots/:id/documents/:doc_id", axum::routing::delete(admin::delete_document))
        .route(
            "/chatbots/:id/documents/:doc_id/progress",
            get(admin::document_progress),
        )
        .route("/chatbots/:id/versions", get(admin::list_versions))
        .route("/chatbots/:id/versions/:version/activate", post(admin::activate_version))
        .route("/chatbots/:id/stats", get(admin::stats))
        .route("/chatbots/:id/stats/rebuild", post(admin::rebuild_stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let public = Router::new()
        .route("/chat/:access_url", get(chat::chatbot_info))
        .route("/chat/:access_url/sessions", post(chat::create_session))
        .route("/chat/:access_url/sessions/:sid/messages", post(chat::send_message))
        .route("/chat/:access_url/sessions/:sid/stop", post(chat::stop));

    Router::new()
        .nest("/api/v1", admin.merge(public))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
