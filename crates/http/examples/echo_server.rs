use std::sync::Arc;

use bytes::Bytes;
use http::{Response, StatusCode, header};
use tokio::net::TcpListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use void_http::connection::ReplyStream;
use void_http::handler::{RequestHandler, make_factory};
use void_http::protocol::{ConnectionError, RequestHeader};
use void_http::server::Server;

/// Largest body chunk echoed per callback, the rest waits until it was written.
const MAX_CHUNK: usize = 16 * 1024;

/// Echoes the request body back chunk by chunk.
#[derive(Default)]
struct EchoHandler {
    reply: Option<ReplyStream>,
    body_length: u64,
}

impl RequestHandler for EchoHandler {
    fn initialize(&mut self, reply: ReplyStream) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, request: RequestHeader) {
        self.body_length = request.content_length().unwrap_or(0);
        info!(method = %request.method(), path = request.uri().path(), body_length = self.body_length, "echo request");

        let Some(reply) = &self.reply else { return };
        let head = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, self.body_length)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(())
            .unwrap();
        reply.send_headers(head, Bytes::new(), |result| {
            if let Err(e) = result {
                warn!(cause = %e, "failed to send response head");
            }
        });
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        let Some(reply) = &self.reply else { return data.len() };

        let accepted = data.len().min(MAX_CHUNK);
        let chunk = Bytes::copy_from_slice(&data[..accepted]);

        if accepted < data.len() {
            // ask for the rest once this chunk is on the wire
            let resumer = reply.clone();
            reply.send_data(chunk, move |result| {
                if result.is_ok() {
                    resumer.resume();
                }
            });
        } else {
            reply.send_data(chunk, |_| {});
        }
        accepted
    }

    fn on_close(&mut self, result: Result<(), ConnectionError>) {
        match (result, &self.reply) {
            (Ok(()), Some(reply)) => {
                let closer = reply.clone();
                reply.send_data(Bytes::new(), move |result| closer.close(result));
            }
            (Err(e), _) => warn!(cause = %e, "echo request failed"),
            (Ok(()), None) => {}
        }
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let server = match Server::builder().route("/echo", make_factory(EchoHandler::default)).build() {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(cause = %e, "invalid server configuration");
            return;
        }
    };

    info!(port = 8080, "start listening");
    let tcp_listener = match TcpListener::bind("127.0.0.1:8080").await {
        Ok(tcp_listener) => tcp_listener,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };

    loop {
        let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
            Ok(stream_and_addr) => stream_and_addr,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let (reader, writer) = tcp_stream.into_split();
            Arc::clone(&server).serve_connection(reader, writer).await;
            info!(%remote_addr, open = server.counters().connections_total(), "connection closed");
        });
    }
}
