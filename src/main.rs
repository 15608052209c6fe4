use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{FromRef, Path, State},
    http::{Request, Response, StatusCode},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use clap::Parser;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;
use upload_limiter::middleware::{
    AuthUser, QuotaState, RequestIdentity, quota_status_handler, upload_quota_middleware,
};
use upload_limiter::{FixedWindowQuota, PolicySet, QuotaPolicy, UploadGate, sweeper};

//cli argument structure
#[derive(Parser, Debug)]
#[command(name = "upload-limiter")]
#[command(about = "File sharing demo with per-identity upload quotas")]
struct Args {
    //port to run the server on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    //guest ceilings per window
    #[arg(long, default_value_t = 10)]
    guest_uploads: u32,
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    guest_bytes: u64,

    //member ceilings per window
    #[arg(long, default_value_t = 100)]
    member_uploads: u32,
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    member_bytes: u64,

    //window length in seconds
    #[arg(long, default_value_t = 3600)]
    window_secs: u64,

    //sweep interval in seconds
    #[arg(long, default_value_t = 300)]
    sweep_secs: u64,
}

// app's shared state
#[derive(Clone)]
struct AppState {
    quota: QuotaState,
    // stand-in for the durable file registry: id -> owner and size
    files: Arc<DashMap<String, StoredFile>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Clone)]
struct StoredFile {
    owner_key: String,
    size: u64,
}

impl FromRef<AppState> for QuotaState {
    fn from_ref(state: &AppState) -> QuotaState {
        state.quota.clone()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "upload_limiter=info".into()),
        )
        .init();

    let args = Args::parse();
    let window = Duration::from_secs(args.window_secs);
    let policies = PolicySet::new(
        QuotaPolicy::new(args.guest_uploads, args.guest_bytes, window),
        QuotaPolicy::new(args.member_uploads, args.member_bytes, window),
    )
    .expect("quota policy from CLI args");

    let gate = Arc::new(FixedWindowQuota::new(policies));
    let sweeper = sweeper::spawn(gate.clone(), Duration::from_secs(args.sweep_secs));

    let quota_state = QuotaState::new(gate);
    let app_state = AppState {
        quota: quota_state.clone(),
        files: Arc::new(DashMap::new()),
        next_id: Arc::new(AtomicU64::new(1)),
    };

    let app = Router::new()
        .route(
            "/upload",
            post(upload_handler).layer(middleware::from_fn_with_state(
                quota_state,
                upload_quota_middleware,
            )),
        )
        .route("/quota", get(quota_status_handler))
        .route("/files/{id}", delete(delete_handler))
        .layer(middleware::from_fn(auth_stub))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address. Is the port already in use?");
    info!(%addr, "file share demo listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();

    sweeper.shutdown();
}

/// Stand-in for the real auth layer: promotes a trusted X-User-Id header to
/// the identity extension the quota middleware reads.
async fn auth_stub(mut request: Request<Body>, next: Next) -> Response<Body> {
    if let Some(id) = request
        .headers()
        .get("X-User-Id")
        .and_then(|value| value.to_str().ok())
    {
        let id = id.to_string();
        request.extensions_mut().insert(AuthUser { id });
    }
    next.run(request).await
}

#[derive(Serialize)]
struct UploadedBody {
    id: String,
    size: u64,
}

// the quota middleware has already admitted and charged this request
async fn upload_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    body: Bytes,
) -> (StatusCode, Json<UploadedBody>) {
    let id = format!("f{}", state.next_id.fetch_add(1, Ordering::Relaxed));
    let size = body.len() as u64;
    state.files.insert(
        id.clone(),
        StoredFile {
            owner_key: identity.key,
            size,
        },
    );
    (StatusCode::CREATED, Json(UploadedBody { id, size }))
}

// deleting a stored file hands its quota charge back to the owner's window
async fn delete_handler(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match state.files.remove(&id) {
        Some((_, file)) => {
            state.quota.gate.release(&file.owner_key, file.size).await;
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}
