use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::chat::{Conversation, ConversationSummary, Cursor, Message, MessagePage, SortOrder};
use crate::error::CourierError;
use crate::identity::Profile;
use crate::inbox::{Inbox, InboxEvent};
use crate::store::Store;

const DEFAULT_PAGE_SIZE: u32 = 50;

pub struct AppState {
    pub store: Store,
    pub inbox: Inbox,
    send_gates: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(store: Store, inbox: Inbox) -> Self {
        Self {
            store,
            inbox,
            send_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Gate serializing append-then-publish per conversation, so live
    /// subscribers see events in the same order the message log commits them.
    fn send_gate(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.send_gates.lock().unwrap();
        gates.entry(conversation_id).or_default().clone()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conversations/resolve", post(resolve_conversation))
        .route(
            "/conversations/:id/messages",
            post(send_message).get(list_messages),
        )
        .route("/conversations/:id/read", post(mark_read))
        .route("/users/:id/conversations", get(list_conversations))
        .route("/users/:id/unread", get(unread_count))
        .route("/users/:id/inbox", get(inbox_stream))
        .route("/users/:id/profile", put(upsert_profile))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// -----------------------------------------------------------------------------
// Conversations
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResolveConversationRequest {
    pub user_a: Uuid,
    pub user_b: Uuid,
}

async fn resolve_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResolveConversationRequest>,
) -> Result<Json<Conversation>, CourierError> {
    let conversation = state
        .store
        .resolve_or_create_conversation(request.user_a, request.user_b)
        .await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<ConversationSummary>>, CourierError> {
    let summaries = state.store.list_conversations(user_id).await?;
    Ok(Json(summaries))
}

// -----------------------------------------------------------------------------
// Messages
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: Uuid,
    pub content: String,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Message>, CourierError> {
    // Concurrent sends to the same conversation commit in some order; holding
    // the gate across append and publish makes the push order match it.
    let gate = state.send_gate(conversation_id);
    let _guard = gate.lock().await;

    let message = state
        .store
        .append_message(conversation_id, request.sender_id, &request.content)
        .await?;

    // Best-effort push to the recipient's live subscribers. Persistence is
    // the durability guarantee; a fan-out failure never fails the send.
    match state.store.unread_count_for(message.recipient_id).await {
        Ok(unread_count) => {
            state.inbox.publish(
                message.recipient_id,
                InboxEvent::MessageReceived {
                    message: message.clone(),
                    unread_count,
                },
            );
        }
        Err(err) => {
            error!("skipping fan-out, could not compute unread count: {err}");
        }
    }

    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    pub cursor: Option<Cursor>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<MessagePage>, CourierError> {
    let page = state
        .store
        .list_messages(
            conversation_id,
            params.cursor,
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            params.order.unwrap_or(SortOrder::Desc),
        )
        .await?;
    Ok(Json(page))
}

// -----------------------------------------------------------------------------
// Read state
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub reader_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub transitioned: u64,
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, CourierError> {
    let transitioned = state
        .store
        .mark_read(conversation_id, request.reader_id)
        .await?;
    Ok(Json(MarkReadResponse { transitioned }))
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UnreadCountResponse>, CourierError> {
    let unread_count = state.store.unread_count_for(user_id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

// -----------------------------------------------------------------------------
// Profiles
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UpsertProfileRequest {
    pub display_name: String,
}

async fn upsert_profile(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<UpsertProfileRequest>,
) -> Result<Json<Profile>, CourierError> {
    let profile = Profile::new(user_id, request.display_name.trim());
    state.store.upsert_profile(&profile).await?;
    Ok(Json(profile))
}

// -----------------------------------------------------------------------------
// Realtime inbox
// -----------------------------------------------------------------------------

async fn inbox_stream(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    info!("user {user_id} subscribed to inbox");

    let mut rx = state.inbox.subscribe(user_id);

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(payload) => yield Ok(Event::default().data(payload)),
                    Err(err) => {
                        error!("failed to serialize inbox event: {err}");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // A slow consumer catches up through the pull API.
                    tracing::warn!(
                        "inbox subscriber for {user_id} lagged, skipped {skipped} events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
