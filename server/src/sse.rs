//! Server-push envelope: newline-framed JSON events over one long-lived
//! response, terminated by `data: [DONE]`.

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use tokio::sync::mpsc;
use uttar_rag::ChatEvent;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Frame one event as `data: <json>\n\n`.
pub fn format_event(event: &ChatEvent) -> String {
    // ChatEvent serialization cannot fail: it is a tagged enum of plain data.
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Build the streaming response for a generation. Events arrive on `rx`;
/// when the producer closes the channel the terminator frame is sent.
pub fn stream_response(rx: mpsc::Receiver<ChatEvent>) -> Response {
    let stream = futures::stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Some(event) => {
                let frame = Bytes::from(format_event(&event));
                Some((Ok::<_, std::convert::Infallible>(frame), Some(rx)))
            }
            None => Some((Ok(Bytes::from_static(DONE_FRAME.as_bytes())), None)),
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .expect("static response build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_event_framing() {
        let frame = format_event(&ChatEvent::Content {
            content: "hello".into(),
        });
        assert_eq!(frame, "data: {\"type\":\"content\",\"content\":\"hello\"}\n\n");
    }

    #[test]
    fn test_thinking_status_omits_absent_count() {
        let frame = format_event(&ChatEvent::ThinkingStatus {
            stage: "retrieval".into(),
            message: "searching".into(),
            source_count: None,
        });
        assert!(frame.contains("\"type\":\"thinking_status\""));
        assert!(!frame.contains("source_count"));
    }

    #[test]
    fn test_done_frame_terminator() {
        assert_eq!(DONE_FRAME, "data: [DONE]\n\n");
    }
}
