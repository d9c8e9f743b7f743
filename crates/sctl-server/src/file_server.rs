//! # Artifact File Server
//!
//! Serves `GET /<kind>/<namespace>/<name>/<file>` straight from the
//! artifact root. Read-only: other methods get 405, directories and any
//! path with a dot-prefixed segment (the current pointer, in-flight
//! temporaries, lease files) get 404. An artifact swept between lookup
//! and open is also a plain 404.

use std::path::Path;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Router serving files under `root`.
pub fn router(root: impl AsRef<Path>) -> Router {
    let files = ServeDir::new(root.as_ref()).append_index_html_on_directories(false);
    Router::new()
        .fallback_service(files)
        .layer(from_fn(reject_hidden))
        .layer(TraceLayer::new_for_http())
}

fn is_hidden_segment(segment: &str) -> bool {
    segment.starts_with('.')
        || segment
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("%2e"))
}

async fn reject_hidden(request: Request, next: Next) -> Response {
    if request.uri().path().split('/').any(is_hidden_segment) {
        return StatusCode::NOT_FOUND.into_response();
    }
    next.run(request).await
}

/// Serve `router` on `listener` until `cancel` fires, then drain open
/// connections.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let address = listener.local_addr()?;
    tracing::info!(server = name, %address, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!(server = name, "stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Method;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn fixture() -> (tempfile::TempDir, Router) {
        let tmp = tempfile::tempdir().unwrap();
        let owner = tmp.path().join("gitrepository/flux-system/podinfo");
        std::fs::create_dir_all(&owner).unwrap();
        std::fs::write(owner.join("main-abc.tar.gz"), b"artifact bytes").unwrap();
        std::fs::write(owner.join(".current"), b"main-abc.tar.gz").unwrap();
        let app = router(tmp.path());
        (tmp, app)
    }

    async fn send(app: Router, method: Method, uri: &str) -> Response {
        app.oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn serves_artifact_bytes() {
        let (_tmp, app) = fixture();
        let resp = send(app, Method::GET, "/gitrepository/flux-system/podinfo/main-abc.tar.gz").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"artifact bytes");
    }

    #[tokio::test]
    async fn missing_artifact_is_404() {
        let (_tmp, app) = fixture();
        let resp = send(app, Method::GET, "/gitrepository/flux-system/podinfo/gone.tar.gz").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pointer_and_hidden_files_are_404() {
        let (_tmp, app) = fixture();
        for uri in [
            "/gitrepository/flux-system/podinfo/.current",
            "/gitrepository/flux-system/podinfo/%2Ecurrent",
            "/gitrepository/flux-system/podinfo/.tmp-1234",
        ] {
            let resp = send(app.clone(), Method::GET, uri).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn directories_are_not_listed() {
        let (_tmp, app) = fixture();
        for uri in ["/", "/gitrepository/flux-system/podinfo/"] {
            let resp = send(app.clone(), Method::GET, uri).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn writes_are_rejected() {
        let (_tmp, app) = fixture();
        let resp = send(app, Method::PUT, "/gitrepository/flux-system/podinfo/main-abc.tar.gz").await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn hidden_segments() {
        assert!(is_hidden_segment(".current"));
        assert!(is_hidden_segment("%2e%2e"));
        assert!(!is_hidden_segment("v1.2.3.tgz"));
        assert!(!is_hidden_segment(""));
    }
}
