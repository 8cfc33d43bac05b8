//! Request path routing for the socket endpoint.
//!
//! Raw WebSocket clients connect to `/websocket`; that path is rewritten
//! to `{prefix}/websocket` so the socket handler only ever sees prefixed
//! paths. `{prefix}/<server>/<session>/websocket` (SockJS-style) is
//! accepted as well. Anything else is not ours.

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Upgrade to a socket; carries the rewritten path
    Socket(String),
    NotFound,
}

/// Rewrite a bare `/websocket` request to live under `prefix`. The query
/// string is kept.
pub fn rewrite_path(path_and_query: &str, prefix: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let path = if path == "/websocket" || path == "/websocket/" {
        format!("{}/websocket", prefix.trim_end_matches('/'))
    } else {
        path.to_string()
    };
    match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

pub fn route_request(path_and_query: &str, prefix: &str) -> Route {
    let rewritten = rewrite_path(path_and_query, prefix);
    let path = rewritten.split('?').next().unwrap_or_default().trim_end_matches('/');
    let prefix = prefix.trim_end_matches('/');

    let Some(rest) = path.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) else {
        return Route::NotFound;
    };
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        ["websocket"] => Route::Socket(rewritten),
        [server, session, "websocket"] if !server.is_empty() && !session.is_empty() => Route::Socket(rewritten),
        _ => Route::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_websocket_is_rewritten() {
        assert_eq!(rewrite_path("/websocket", "/sockjs"), "/sockjs/websocket");
        assert_eq!(rewrite_path("/websocket?x=1", "/sockjs"), "/sockjs/websocket?x=1");
        assert_eq!(rewrite_path("/other", "/sockjs"), "/other");
    }

    #[test]
    fn test_routes() {
        assert_eq!(route_request("/websocket", "/sockjs"), Route::Socket("/sockjs/websocket".into()));
        assert_eq!(
            route_request("/sockjs/websocket", "/sockjs"),
            Route::Socket("/sockjs/websocket".into())
        );
        assert!(matches!(route_request("/sockjs/123/abcdef/websocket", "/sockjs"), Route::Socket(_)));
        assert_eq!(route_request("/", "/sockjs"), Route::NotFound);
        assert_eq!(route_request("/sockjs", "/sockjs"), Route::NotFound);
        assert_eq!(route_request("/sockjsx/websocket", "/sockjs"), Route::NotFound);
        assert_eq!(route_request("/api/websocket", "/sockjs"), Route::NotFound);
    }
}
