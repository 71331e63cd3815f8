use crate::error::AppError;
use crate::models::Membership;
use crate::state::AppState;
use crate::websocket::{run_session, ConnectionHandle, FrameSink, InboundFrame, SinkClosed};
use actix_web::{get, http::header::AUTHORIZATION, web, HttpRequest, HttpResponse};
use actix_ws::{Message, Session};
use async_trait::async_trait;
use futures_util::{future, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub conversation_id: Option<String>,
    pub token: Option<String>,
}

/// Token from the query string, falling back to a bearer header.
fn extract_token(params: &WsParams, req: &HttpRequest) -> Option<String> {
    params
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.trim().to_string())
        })
}

/// Authenticate and authorize the upgrade. Returns (subject, conversation).
async fn authorize(
    state: &AppState,
    params: &WsParams,
    req: &HttpRequest,
) -> Result<(String, String), AppError> {
    let token = extract_token(params, req).ok_or_else(|| {
        warn!("WebSocket connection rejected: no token provided");
        AppError::Unauthorized
    })?;
    let user_id = state.verifier.verify(&token).await.map_err(|e| {
        warn!(error = %e, "WebSocket connection rejected: invalid token");
        AppError::Unauthorized
    })?;
    let conversation_id = params
        .conversation_id
        .clone()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            warn!(%user_id, "WebSocket connection rejected: missing conversation_id");
            AppError::Unauthorized
        })?;

    if state
        .conversations
        .membership(&conversation_id, &user_id)
        .await?
        == Membership::NotMember
    {
        warn!(%user_id, %conversation_id, "WebSocket connection rejected: not a member");
        return Err(AppError::Forbidden);
    }
    Ok((user_id, conversation_id))
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, actix_web::Error> {
    let params = query.into_inner();
    let (user_id, conversation_id) = authorize(&state, &params, &req).await?;

    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let (handle, rx) = ConnectionHandle::new(
        &user_id,
        &conversation_id,
        state.config.websocket.outbound_queue_capacity,
    );
    debug!(connection_id = %handle.id(), %user_id, %conversation_id, "WebSocket upgrade accepted");

    let inbound = Box::pin(msg_stream.filter_map(|item| {
        future::ready(match item {
            Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text.to_string()))),
            Ok(Message::Binary(bytes)) => Some(Ok(InboundFrame::Binary(bytes.to_vec()))),
            Ok(Message::Ping(bytes)) => Some(Ok(InboundFrame::Ping(bytes.to_vec()))),
            Ok(Message::Pong(_)) => Some(Ok(InboundFrame::Pong)),
            Ok(Message::Close(_)) => Some(Ok(InboundFrame::Close)),
            Ok(Message::Continuation(_)) | Ok(Message::Nop) => None,
            Err(e) => Some(Err(e)),
        })
    }));

    actix_web::rt::spawn(run_session(
        state.session_context(),
        handle,
        rx,
        ActixSink(session),
        inbound,
    ));

    Ok(response)
}

struct ActixSink(Session);

#[async_trait]
impl FrameSink for ActixSink {
    async fn send_text(&mut self, text: &str) -> Result<(), SinkClosed> {
        self.0.text(text.to_owned()).await.map_err(|_| SinkClosed)
    }

    async fn send_ping(&mut self, payload: &[u8]) -> Result<(), SinkClosed> {
        self.0.ping(payload).await.map_err(|_| SinkClosed)
    }

    async fn send_pong(&mut self, payload: &[u8]) -> Result<(), SinkClosed> {
        self.0.pong(payload).await.map_err(|_| SinkClosed)
    }

    async fn close(&mut self) -> Result<(), SinkClosed> {
        self.0.clone().close(None).await.map_err(|_| SinkClosed)
    }
}
