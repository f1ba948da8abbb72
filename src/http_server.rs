use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::receivers::{Receiver, WebhookRequest, WebhookResponse};

pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
struct RouteState {
    receiver: Arc<dyn Receiver>,
    shutdown: CancellationToken,
}

/// One `POST` route per receiver at its path, plus `GET /healthz`.
///
/// Two receivers resolving to the same path is a configuration error.
pub fn router(
    receivers: &[Arc<dyn Receiver>],
    shutdown: CancellationToken,
    max_body_bytes: usize,
) -> Result<Router, ConfigError> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    let mut app = Router::new().route("/healthz", get(healthz));

    for receiver in receivers {
        let details = receiver.details();
        if let Some(first) = seen.insert(&details.path, &details.name) {
            return Err(ConfigError::DuplicatePath {
                first: first.to_string(),
                second: details.name.clone(),
                path: details.path.clone(),
            });
        }
        let state = RouteState {
            receiver: receiver.clone(),
            shutdown: shutdown.clone(),
        };
        app = app.route(&details.path, post(handle_webhook).with_state(state));
    }

    Ok(app.layer(DefaultBodyLimit::max(max_body_bytes)))
}

/// Bind `listen` and serve until `shutdown` fires.
pub async fn serve(listen: SocketAddr, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn healthz() -> impl IntoResponse {
    WebhookResponse::msg(StatusCode::OK, "ok")
}

async fn handle_webhook(
    State(state): State<RouteState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    let receiver = state.receiver;
    let span = info_span!(
        "webhook",
        receiver = %receiver.details().name,
        provider = receiver.receiver_type(),
        delivery_id = %Uuid::new_v4(),
    );

    // Cancelled on shutdown; dropped with the request otherwise.
    let cancel = state.shutdown.child_token();
    let request = WebhookRequest::new(method, uri, headers, body);
    async move {
        info!(bytes = request.body.len(), "received webhook");
        let response = receiver.handle(&cancel, request).await;
        info!(status = response.status().as_u16(), "handled webhook");
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::receivers::test_support::context;
    use crate::receivers::{ProviderOptions, Registry, WebhookReceiverConfig};
    use crate::secrets::SecretData;

    fn github(name: &str) -> Arc<dyn Receiver> {
        let (ctx, _) = context(vec![]);
        let config = WebhookReceiverConfig {
            name: name.into(),
            secret_ref: "s".into(),
            github: Some(ProviderOptions::default()),
            ..Default::default()
        };
        Registry::with_defaults()
            .resolve(&ctx, "proj", &config, SecretData::new("s").with("secret", "x"))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = router(&[], CancellationToken::new(), DEFAULT_MAX_BODY_BYTES).unwrap();
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let receiver = github("gh");
        let path = receiver.details().path.clone();
        let app = router(&[receiver], CancellationToken::new(), 16).unwrap();
        let response = app
            .oneshot(
                Request::post(&path)
                    .header("x-github-event", "push")
                    .header("x-hub-signature-256", "sha256=00")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let err = router(&[github("gh"), github("gh")], CancellationToken::new(), DEFAULT_MAX_BODY_BYTES)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::DuplicatePath { .. }));
    }
}
