/// Messenger REST API + SSE
///
/// Endpoints (account ids and conversation ids are URL-encoded path segments):
///   GET    /api/status
///   POST   /api/users                              body: {"email","first_name","last_name"}
///   GET    /api/users/:account
///   POST   /api/users/:account/picture             raw bytes
///   GET    /api/users/:account/conversations       newest first
///   DELETE /api/users/:account/conversations/:id   hides it for this account only
///   GET    /api/directory?q=...
///   POST   /api/conversations                      body: {"initiator","counterpart","first_message"}
///   GET    /api/conversations/:id/messages
///   POST   /api/conversations/:id/messages         body: {"sender","counterpart","sender_display_name","message","message_id"?}
///   POST   /api/conversations/:id/resync           body: {"account"}
///   POST   /api/media/:kind/:message_id            raw bytes; kind is photo|video
///   GET    /events/users/:account/conversations    SSE of inbox snapshots
///   GET    /events/conversations/:id               SSE of message log snapshots
use crate::accounts::NewAccount;
use crate::error::{CreateConversationError, ErrorKind, Result, SendMessageError, StrandedWrite, SyncError};
use crate::media::MediaKind;
use crate::messenger::Messenger;
use crate::messenger_types::{MessageDraft, MessageKind};
use crate::orchestrator::CreateConversation;
use crate::store::SnapshotStream;
use futures_util::stream::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::UnsyncBoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn empty_body() -> BoxBody {
    Full::new(bytes::Bytes::new()).boxed_unsync()
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed_unsync())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_status(status: StatusCode, value: serde_json::Value) -> Resp {
    json_resp(status, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_status(status, serde_json::json!({ "error": msg }))
}

/// 400 naming the first required field that is blank
fn blank_field(fields: &[(&str, &str)]) -> Option<Resp> {
    fields
        .iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| json_err(StatusCode::BAD_REQUEST, &format!("{} must not be blank", name)))
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn sync_err(e: &SyncError) -> Resp {
    json_status(
        status_for(e.kind()),
        serde_json::json!({ "error": e.to_string(), "kind": e.kind().to_string() }),
    )
}

fn create_err(e: &CreateConversationError) -> Resp {
    match e {
        CreateConversationError::NotApplied { step, source } => json_status(
            status_for(source.kind()),
            serde_json::json!({
                "error": e.to_string(),
                "kind": source.kind().to_string(),
                "step": step.to_string(),
                "applied": false,
            }),
        ),
        CreateConversationError::PartialFailure {
            step,
            source,
            stranded,
        } => {
            let stranded: Vec<_> = stranded
                .iter()
                .map(|w| match w {
                    StrandedWrite::Summary {
                        user_key,
                        conversation_id,
                    } => serde_json::json!({
                        "user_key": user_key,
                        "conversation_id": conversation_id,
                    }),
                })
                .collect();
            json_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": e.to_string(),
                    "kind": source.kind().to_string(),
                    "step": step.to_string(),
                    "applied": "partial",
                    "stranded": stranded,
                }),
            )
        }
    }
}

fn send_err(e: &SendMessageError) -> Resp {
    let failed: Vec<String> = e.failed_steps().iter().map(|s| s.to_string()).collect();
    match e {
        SendMessageError::NotDelivered(source) => json_status(
            status_for(source.kind()),
            serde_json::json!({
                "error": e.to_string(),
                "kind": source.kind().to_string(),
                "delivered": false,
                "failed_steps": failed,
            }),
        ),
        SendMessageError::IndexStale { message_id, .. } => json_status(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": e.to_string(),
                "message_id": message_id,
                "delivered": true,
                "failed_steps": failed,
            }),
        ),
    }
}

fn sse_resp<T: Serialize + Send + 'static>(feed: SnapshotStream<T>) -> Resp {
    // Keepalive comment sent immediately so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let snapshots = feed.map(|snapshot| {
        let data = match snapshot {
            Ok(value) => format!(
                "data: {}\n\n",
                serde_json::to_string(&value).unwrap_or_default()
            ),
            Err(e) => format!(
                "event: error\ndata: {}\n\n",
                serde_json::json!({ "error": e.to_string(), "kind": e.kind().to_string() })
            ),
        };
        Ok::<_, Infallible>(Frame::data(bytes::Bytes::from(data)))
    });

    let stream = first.chain(snapshots);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no") // disable nginx buffering
        .body(StreamBody::new(stream).boxed_unsync())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_messenger_api(messenger: Messenger, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Messenger API started on http://{}", addr);
    serve(listener, messenger).await
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, messenger: Messenger) -> Result<()> {
    let messenger = Arc::new(messenger);
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let messenger = messenger.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let messenger = messenger.clone();
                        async move { Ok::<_, Infallible>(handle(req, messenger).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Ignore client-disconnect errors (normal for SSE)
                        if !e.is_incomplete_message() {
                            error!("Messenger API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Messenger API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub async fn handle<B>(req: Request<B>, messenger: Arc<Messenger>) -> Resp
where
    B: Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    debug!("{} {}", method, path);

    // CORS preflight
    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    let segments = match decode_segments(&path) {
        Ok(s) => s,
        Err(msg) => return json_err(StatusCode::BAD_REQUEST, &msg),
    };
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
    let m = messenger.as_ref();

    match (&method, parts.as_slice()) {
        (&Method::GET, ["api", "status"]) => get_status(),
        (&Method::POST, ["api", "users"]) => post_user(req, m).await,
        (&Method::GET, ["api", "users", account]) => get_profile(account, m).await,
        (&Method::POST, ["api", "users", account, "picture"]) => post_picture(account, req, m).await,
        (&Method::GET, ["api", "users", account, "conversations"]) => get_inbox(account, m).await,
        (&Method::DELETE, ["api", "users", account, "conversations", id]) => {
            delete_conversation(account, id, m).await
        }
        (&Method::GET, ["api", "directory"]) => get_directory(&query, m).await,
        (&Method::POST, ["api", "conversations"]) => post_conversation(req, m).await,
        (&Method::GET, ["api", "conversations", id, "messages"]) => get_history(id, m).await,
        (&Method::POST, ["api", "conversations", id, "messages"]) => post_message(id, req, m).await,
        (&Method::POST, ["api", "conversations", id, "resync"]) => post_resync(id, req, m).await,
        (&Method::POST, ["api", "media", kind, message_id]) => {
            post_media(kind, message_id, req, m).await
        }
        (&Method::GET, ["events", "users", account, "conversations"]) => {
            match m.feeds.watch_inbox_by_recency(account).await {
                Ok(feed) => sse_resp(feed),
                Err(e) => sync_err(&e),
            }
        }
        (&Method::GET, ["events", "conversations", id]) => {
            match m.feeds.watch_conversation(id).await {
                Ok(feed) => sse_resp(feed),
                Err(e) => sync_err(&e),
            }
        }
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn get_status() -> Resp {
    json_ok(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn post_user<B>(req: Request<B>, m: &Messenger) -> Resp
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    let account: NewAccount = match read_json(req).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match m.accounts.register(&account).await {
        Ok(key) => json_ok(serde_json::json!({ "user_key": key })),
        Err(e) => sync_err(&e),
    }
}

async fn get_profile(account: &str, m: &Messenger) -> Resp {
    match m.accounts.profile(account).await {
        Ok(profile) => json_ok(serde_json::json!({ "profile": profile })),
        Err(e) => sync_err(&e),
    }
}

async fn get_inbox(account: &str, m: &Messenger) -> Resp {
    match m.feeds.inbox_by_recency(account).await {
        Ok(inbox) => json_ok(serde_json::json!({ "conversations": inbox })),
        Err(e) => sync_err(&e),
    }
}

async fn delete_conversation(account: &str, conversation_id: &str, m: &Messenger) -> Resp {
    match m.orchestrator.delete_conversation(account, conversation_id).await {
        Ok(()) => json_ok(serde_json::json!({ "removed": conversation_id })),
        Err(e) => sync_err(&e),
    }
}

async fn get_directory(query: &str, m: &Messenger) -> Resp {
    let q = query_param(query, "q").unwrap_or_default();
    match m.feeds.search_users(&q).await {
        Ok(users) => json_ok(serde_json::json!({ "users": users })),
        Err(e) => sync_err(&e),
    }
}

async fn post_conversation<B>(req: Request<B>, m: &Messenger) -> Resp
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    let request: CreateConversation = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Some(resp) = blank_field(&[
        ("initiator.account", request.initiator.account.as_str()),
        ("counterpart.account", request.counterpart.account.as_str()),
    ]) {
        return resp;
    }
    match m.orchestrator.create_conversation(request).await {
        Ok(id) => json_ok(serde_json::json!({ "conversation_id": id })),
        Err(e) => create_err(&e),
    }
}

async fn get_history(conversation_id: &str, m: &Messenger) -> Resp {
    match m.feeds.history(conversation_id).await {
        Ok(messages) => json_ok(serde_json::json!({ "messages": messages })),
        Err(e) => sync_err(&e),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    sender: String,
    counterpart: String,
    sender_display_name: String,
    message: MessageKind,
    /// Reuse the id of an earlier attempt to resubmit safely
    message_id: Option<String>,
}

async fn post_message<B>(conversation_id: &str, req: Request<B>, m: &Messenger) -> Resp
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    let r: SendRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Some(resp) = blank_field(&[
        ("sender", r.sender.as_str()),
        ("counterpart", r.counterpart.as_str()),
    ]) {
        return resp;
    }
    let mut draft = MessageDraft::new(r.message, r.sender_display_name);
    if let Some(id) = r.message_id {
        draft = draft.with_id(id);
    }
    let message_id = draft.id.clone();
    match m
        .orchestrator
        .send_message(conversation_id, &r.sender, &r.counterpart, draft)
        .await
    {
        Ok(outcome) => json_ok(serde_json::json!({
            "message_id": message_id,
            "delivered": true,
            "duplicate": outcome.is_duplicate(),
        })),
        Err(e) => send_err(&e),
    }
}

#[derive(Deserialize)]
struct ResyncRequest {
    account: String,
}

async fn post_resync<B>(conversation_id: &str, req: Request<B>, m: &Messenger) -> Resp
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    let r: ResyncRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Some(resp) = blank_field(&[("account", r.account.as_str())]) {
        return resp;
    }
    match m.orchestrator.resync_summary(conversation_id, &r.account).await {
        Ok(latest) => json_ok(serde_json::json!({ "latest_message": latest })),
        Err(e) => sync_err(&e),
    }
}

async fn post_media<B>(kind: &str, message_id: &str, req: Request<B>, m: &Messenger) -> Resp
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    let kind: MediaKind = match kind.parse() {
        Ok(k) => k,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("{}", e)),
    };
    if kind == MediaKind::ProfilePicture {
        return json_err(
            StatusCode::BAD_REQUEST,
            "profile pictures go to /api/users/:account/picture",
        );
    }
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    match m.upload_message_media(kind, message_id, body.to_vec()).await {
        Ok(url) => json_ok(serde_json::json!({ "url": url })),
        Err(e) => sync_err(&e),
    }
}

async fn post_picture<B>(account: &str, req: Request<B>, m: &Messenger) -> Resp
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    match m.upload_profile_picture(account, body.to_vec()).await {
        Ok(url) => json_ok(serde_json::json!({ "url": url })),
        Err(e) => sync_err(&e),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body<B>(req: Request<B>) -> std::result::Result<bytes::Bytes, String>
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
{
    req.into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

async fn read_json<B, T>(req: Request<B>) -> std::result::Result<T, Resp>
where
    B: Body<Data = bytes::Bytes>,
    B::Error: std::fmt::Display,
    T: DeserializeOwned,
{
    let body = read_body(req)
        .await
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

fn decode_segments(path: &str) -> std::result::Result<Vec<String>, String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .map_err(|e| format!("bad path segment {}: {}", s, e))
        })
        .collect()
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                let v = v.replace('+', " ");
                return urlencoding::decode(&v).ok().map(|d| d.into_owned());
            }
        }
    }
    None
}
