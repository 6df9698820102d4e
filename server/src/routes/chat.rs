//! Public chat surface: persona info, sessions, streaming messages, stop.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use uttar_rag::types::{Chatbot, ChatbotStatus};
use uttar_rag::{ChatEvent, RagError};

use crate::error::ApiResult;
use crate::sse;
use crate::state::AppState;

/// Buffer between the generation task and the transport writer.
const EVENT_BUFFER: usize = 64;

async fn active_chatbot(state: &AppState, access_url: &str) -> Result<Chatbot, RagError> {
    let chatbot = state.meta.get_chatbot_by_slug(access_url).await?;
    if chatbot.status != ChatbotStatus::Active {
        // Inactive tenants are invisible to the public surface.
        return Err(RagError::not_found(format!("chatbot {access_url:?}")));
    }
    Ok(chatbot)
}

pub async fn chatbot_info(
    State(state): State<AppState>,
    Path(access_url): Path<String>,
) -> ApiResult<Json<Value>> {
    let chatbot = active_chatbot(&state, &access_url).await?;
    Ok(Json(json!({
        "name": chatbot.name,
        "display_name": chatbot.persona.display_name,
        "greeting": chatbot.persona.greeting,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub initial_message: Option<String>,
}

/// Create a session. With an `initial_message` the response is the streamed
/// assistant answer to it (session id in the `X-Session-Id` header);
/// otherwise a JSON session document.
pub async fn create_session(
    State(state): State<AppState>,
    Path(access_url): Path<String>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<Response> {
    let chatbot = active_chatbot(&state, &access_url).await?;
    let session = state.chat.create_session(chatbot.id).await?;

    let initial = body.and_then(|Json(b)| b.initial_message).filter(|m| !m.trim().is_empty());

    if let Some(message) = initial {
        let response = start_stream(&state, chatbot, session.id, message).await?;
        let mut response = response;
        response.headers_mut().insert(
            "x-session-id",
            session
                .id
                .to_string()
                .parse()
                .expect("uuid is a valid header value"),
        );
        return Ok(response);
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": session.id,
            "expires_at": session.expires_at,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path((access_url, session_id)): Path<(String, Uuid)>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    let chatbot = active_chatbot(&state, &access_url).await?;
    start_stream(&state, chatbot, session_id, body.message).await
}

/// Spin up the generation task and hand its event channel to the transport.
/// Session/validation failures surface as plain HTTP errors before any
/// stream bytes are written.
async fn start_stream(
    state: &AppState,
    chatbot: Chatbot,
    session_id: Uuid,
    message: String,
) -> ApiResult<Response> {
    // Pre-validate so expiry and bad sessions are an HTTP status, not a
    // stream that dies immediately.
    let session = state.meta.get_session(session_id).await?;
    if session.chatbot_id != chatbot.id {
        return Err(RagError::not_found(format!("session {session_id}")).into());
    }
    if session.is_expired(chrono::Utc::now()) {
        return Err(RagError::Validation("session expired".into()).into());
    }

    let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_BUFFER);
    let chat = state.chat.clone();
    tokio::spawn(async move {
        if let Err(e) = chat.stream_response(&chatbot, session_id, &message, tx.clone()).await {
            // Pre-persistence failures: the stream carries the error event.
            let _ = tx
                .send(ChatEvent::Error {
                    kind: "validation".into(),
                    error: e.to_string(),
                })
                .await;
        }
    });

    Ok(sse::stream_response(rx))
}

pub async fn stop(
    State(state): State<AppState>,
    Path((access_url, session_id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    let chatbot = active_chatbot(&state, &access_url).await?;
    let session = state.meta.get_session(session_id).await?;
    if session.chatbot_id != chatbot.id {
        return Err(RagError::not_found(format!("session {session_id}")).into());
    }
    state.chat.request_stop(session_id);
    Ok(StatusCode::NO_CONTENT)
}
