// Pacmesh - Cooperative LAN package cache daemon, redirecting misses to clustermates found over multicast
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use tokio_util::io::ReaderStream;

use crate::pacmesh::{Lookup, Shared};

/// Routes served by every instance: `/search` runs the cooperative lookup,
/// `/cache` exposes the local package cache to clustermates.
pub fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/search/:pkgname", get(search))
        .route("/cache/:pkgname", get(cache))
        .with_state(shared)
}

async fn search(State(shared): State<Arc<Shared>>, Path(pkgname): Path<String>) -> Response {
    match shared.lookup(&pkgname).await {
        Lookup::Local(path) => serve_file(&path).await,
        Lookup::Remote(peer) => {
            info!("Found (addr = {}) (pkg = {})", peer, pkgname);

            redirect(&shared.redirect_url(peer, &pkgname))
        }
        Lookup::Miss => {
            info!("Not found (pkg = {})", pkgname);

            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn cache(State(shared): State<Arc<Shared>>, Path(pkgname): Path<String>) -> Response {
    match shared.find_package(&pkgname) {
        Some(path) => serve_file(&path).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// 302 with the peer's cache URL, the redirect package clients follow.
fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Stream a cache hit from disk.
///
/// A file that vanished between the probe and the open degrades to a plain
/// not-found.
async fn serve_file(path: &std::path::Path) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            debug!("Cache hit disappeared (path = {}): {}", path.display(), e);

            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let length = file.metadata().await.ok().map(|meta| meta.len());
    let body = Body::from_stream(ReaderStream::new(file));

    match length {
        Some(length) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, length.to_string()),
            ],
            body,
        )
            .into_response(),
        None => (
            [(header::CONTENT_TYPE, "application/octet-stream".to_string())],
            body,
        )
            .into_response(),
    }
}
