use http::StatusCode;
use micro_poll::handler::{BoxError, Interceptors, RequestListener};
use micro_poll::protocol::{HttpRequest, HttpResponse};
use micro_poll::server::{Server, ServerConfig};
use serde::Serialize;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

struct AccessLog;

impl RequestListener for AccessLog {
    fn destroy(&self, request: &HttpRequest, response: &HttpResponse) {
        info!(
            method = %request.method(),
            uri = %request.uri(),
            status = response.status().as_u16(),
            elapsed = ?request.elapsed(),
            "request finished"
        );
    }
}

#[derive(Serialize)]
struct Visit<'a> {
    path: &'a str,
    session: String,
    params: &'a std::collections::HashMap<String, Vec<String>>,
}

fn hello_world(request: &HttpRequest, response: &HttpResponse) -> Result<bool, BoxError> {
    if request.path() != "/" {
        return Ok(true);
    }
    response.render_text(StatusCode::OK, "hello world\r\n")?;
    Ok(false)
}

fn visit(request: &HttpRequest, response: &HttpResponse) -> Result<bool, BoxError> {
    if request.path() != "/visit" {
        return Ok(true);
    }
    let session = request.session().map(|s| s.id().to_string()).unwrap_or_default();
    let visit = Visit { path: request.path(), session, params: request.decoded_params() };
    response.render_json(StatusCode::OK, &visit)?;
    Ok(false)
}

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = ServerConfig { host: "127.0.0.1".to_string(), port: 8080, timeout: 10, ..ServerConfig::default() };
    let interceptors = Interceptors::builder().add_last(hello_world).add_last(visit).build();

    let server = Server::builder().config(config).listener(AccessLog).interceptors(interceptors).build();
    match server.start() {
        Ok(running) => {
            info!(addr = %running.local_addr(), "listening, try `curl http://127.0.0.1:8080/visit?name=me`");
            running.join();
        }
        Err(e) => error!(cause = %e, "start server error"),
    }
}
