//! Minimal HTTP status page, one level above the raw counters.

use std::sync::{atomic::Ordering, Arc};

use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::{codec::FramedStream, server::Server};

/// Serves the status page forever. Bound next to the main port so operators
/// can glance at load, cache efficiency, and fault counts.
pub async fn serve(server: Arc<Server>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "status page request");
                let server = server.clone();
                tokio::spawn(async move {
                    let mut sock = FramedStream::new(stream);
                    let page = render(&server);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\n\
                         Server: shadersrv\r\n\
                         Content-Length: {}\r\n\
                         Content-Type: text/html\r\n\
                         Connection: close\r\n\r\n{page}",
                        page.len()
                    );
                    if let Err(error) = sock.send_text(&response).await {
                        warn!(%error, "failed to send status page");
                    }
                });
            }
            Err(error) => warn!(%error, "status listener accept failed"),
        }
    }
}

fn render(server: &Server) -> String {
    let hits = server.cache.hits();
    let misses = server.cache.misses();
    let lookups = hits + misses;
    let hit_rate = if lookups > 0 { hits * 100 / lookups } else { 0 };

    let mut rows = String::new();
    let mut row = |name: &str, value: String| {
        rows.push_str(&format!(
            "<tr><td>{name}</td><td align=\"right\">{value}</td></tr>\n"
        ));
    };
    row(
        "Active compile tasks",
        format!(
            "{} (max {})",
            server.active_compiles.load(Ordering::SeqCst),
            server.max_active_compiles.load(Ordering::SeqCst)
        ),
    );
    row(
        "Open connections",
        format!("{}", server.connection_count.load(Ordering::SeqCst)),
    );
    row(
        "Open sockets",
        format!("{}", FramedStream::open_socket_count()),
    );
    row(
        "Requests served",
        format!("{}", server.request_number.load(Ordering::SeqCst)),
    );
    row("Cache entries", format!("{}", server.cache.entry_count()));
    row("Cache blobs", format!("{}", server.cache.blob_count()));
    row("Cache hit rate", format!("{hit_rate}% ({hits}:{misses})"));
    row(
        "Pending cache writes",
        format!("{}", server.cache.pending_len()),
    );
    row(
        "Exceptions",
        format!("{}", server.exception_count.load(Ordering::SeqCst)),
    );

    format!(
        "<html><title>shader compile server</title><body>\
         <h2>Shader compile server</h2>\
         <table border=\"0\" cellspacing=\"0\" cellpadding=\"2\">\n{rows}</table>\
         </body></html>"
    )
}
