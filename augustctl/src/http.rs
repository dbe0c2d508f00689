//! HTTP front end and response helpers

use std::sync::Arc;

use tracing::{info, warn};

use augustctl::control::ControlState;

pub type HttpResult<E = std::io::Error> = Result<HttpResponse, E>;

pub type HttpResponse =
    hyper::Response<http_body_util::combinators::BoxBody<hyper::body::Bytes, std::io::Error>>;

pub async fn run_server(addr: &str, state: Arc<ControlState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "listening on http://{addr}, control at {}, voice skill at {}",
        state.base_url(),
        state.alexa_url()
    );
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::task::spawn(handle_connection(stream, state.clone()));
            }
            Err(e) => {
                warn!("failed to accept: {e:?}");
                continue;
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, state: Arc<ControlState>) {
    let io = hyper_util::rt::TokioIo::new(stream);

    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());
    let conn = builder.serve_connection(
        io,
        hyper::service::service_fn(|r| handle_request(r, state.clone())),
    );

    if let Err(e) = conn.await {
        warn!("connection error: {e:?}");
    }
}

async fn handle_request(
    r: hyper::Request<hyper::body::Incoming>,
    state: Arc<ControlState>,
) -> HttpResult {
    let path = r.uri().path().to_string();
    let query = r.uri().query().map(str::to_string);

    let body = if path == state.alexa_url() {
        match http_body_util::BodyExt::collect(r.into_body()).await {
            Ok(body) => body.to_bytes(),
            Err(e) => return augustctl::bad_request!("failed to read body: {e}"),
        }
    } else {
        hyper::body::Bytes::new()
    };

    state.route(&path, query.as_deref(), &body).await
}

pub fn json<T: serde::Serialize>(o: T) -> HttpResult {
    let bytes = match serde_json::to_vec(&o) {
        Ok(v) => v,
        Err(e) => {
            return text(
                hyper::StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to serialize json: {e:?}"),
            );
        }
    };
    let mut r = bytes_to_resp(bytes, hyper::StatusCode::OK)?;
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json;charset=UTF-8"),
    );
    Ok(r)
}

/// Plain text body with `status`, used by the error macros below
pub fn text(status: hyper::StatusCode, m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), status)
}

pub fn bytes_to_resp(bytes: Vec<u8>, status: hyper::StatusCode) -> HttpResult {
    use http_body_util::BodyExt;

    let mut r = hyper::Response::new(
        http_body_util::Full::new(hyper::body::Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    Ok(r)
}

#[macro_export]
macro_rules! server_error {
    ($($t:tt)*) => {{
        augustctl::http::text(hyper::StatusCode::INTERNAL_SERVER_ERROR, format!($($t)*))
    }};
}

#[macro_export]
macro_rules! not_found {
    ($($t:tt)*) => {{
        augustctl::http::text(hyper::StatusCode::NOT_FOUND, format!($($t)*))
    }};
}

#[macro_export]
macro_rules! bad_request {
    ($($t:tt)*) => {{
        augustctl::http::text(hyper::StatusCode::BAD_REQUEST, format!($($t)*))
    }};
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    async fn body(r: super::HttpResponse) -> String {
        let bytes = r.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_sets_the_content_type() {
        let r = super::json(serde_json::json!({"system": "locking"})).unwrap();
        assert_eq!(r.status(), hyper::StatusCode::OK);
        assert_eq!(
            r.headers()[hyper::header::CONTENT_TYPE],
            "application/json;charset=UTF-8"
        );
        assert_eq!(body(r).await, r#"{"system":"locking"}"#);
    }

    #[tokio::test]
    async fn error_macros_carry_status_and_message() {
        let r = augustctl::bad_request!("invalid relock: {}", "soon").unwrap();
        assert_eq!(r.status(), hyper::StatusCode::BAD_REQUEST);
        assert_eq!(body(r).await, "invalid relock: soon");

        let r = augustctl::not_found!("not found").unwrap();
        assert_eq!(r.status(), hyper::StatusCode::NOT_FOUND);

        let r = augustctl::server_error!("lock unreachable").unwrap();
        assert_eq!(r.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
