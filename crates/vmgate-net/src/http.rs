use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use vmgate_core::api::{ApiError, ErrorBody, ExposeRequest, UnexposeRequest};
use vmgate_core::nat::NatTable;
use vmgate_core::stats::TrafficCounters;

use crate::forwarder::inbound::InboundForwarder;

const MAX_BODY: usize = 64 * 1024;

/// Shared state behind the control endpoints.
pub struct ControlContext {
    pub forwarder: Arc<InboundForwarder>,
    pub nat: Arc<NatTable>,
    pub counters: Arc<TrafficCounters>,
}

/// Serve one HTTP/1.1 request on any byte stream and close.
///
/// The surface is small enough that a framework would be the heavier
/// option, and the same function must run over connections dialed out of
/// the in-process stack.
pub async fn serve_connection<S>(stream: S, ctx: &ControlContext) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return respond(
            reader.into_inner(),
            400,
            &ErrorBody {
                error: "malformed request line".to_string(),
            },
        )
        .await;
    };
    let method = method.to_string();
    let path = path.to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > MAX_BODY {
        return respond(
            reader.into_inner(),
            413,
            &ErrorBody {
                error: "body too large".to_string(),
            },
        )
        .await;
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    let stream = reader.into_inner();

    match (method.as_str(), path.as_str()) {
        ("GET", "/services/forwarder/all") => respond(stream, 200, &ctx.forwarder.list()).await,
        ("POST", "/services/forwarder/expose") => {
            let request: ExposeRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => return bad_request(stream, e).await,
            };
            match ctx
                .forwarder
                .expose(&request.local, &request.remote, request.protocol)
                .await
            {
                Ok(()) => respond(stream, 200, &Empty {}).await,
                Err(e) => api_error(stream, e).await,
            }
        }
        ("POST", "/services/forwarder/unexpose") => {
            let request: UnexposeRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => return bad_request(stream, e).await,
            };
            match ctx.forwarder.unexpose(&request.local, request.protocol) {
                Ok(()) => respond(stream, 200, &Empty {}).await,
                Err(e) => api_error(stream, e).await,
            }
        }
        ("GET", "/stats") => {
            let stats = StatsBody {
                counters: ctx.counters.snapshot(),
                nat_entries: ctx.nat.len(),
                forwards: ctx.forwarder.list().len(),
            };
            respond(stream, 200, &stats).await
        }
        _ => {
            respond(
                stream,
                404,
                &ErrorBody {
                    error: format!("no handler for {method} {path}"),
                },
            )
            .await
        }
    }
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct StatsBody {
    #[serde(flatten)]
    counters: vmgate_core::stats::CountersSnapshot,
    nat_entries: usize,
    forwards: usize,
}

async fn bad_request<S>(stream: S, e: serde_json::Error) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    respond(
        stream,
        400,
        &ErrorBody {
            error: format!("invalid request body: {e}"),
        },
    )
    .await
}

async fn api_error<S>(stream: S, e: ApiError) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = match &e {
        ApiError::AlreadyExposed { .. } => 409,
        ApiError::NotExposed { .. } => 404,
        ApiError::UnsupportedProtocol
        | ApiError::InvalidLocal { .. }
        | ApiError::InvalidRemote { .. } => 400,
        ApiError::Io(_) => 500,
    };
    respond(
        stream,
        status,
        &ErrorBody {
            error: e.to_string(),
        },
    )
    .await
}

async fn respond<S, B>(mut stream: S, status: u16, body: &B) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
    B: Serialize,
{
    let payload = serde_json::to_vec(body).unwrap_or_default();
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use vmgate_core::config::{Configuration, LinkDialect, MacAddress};

    use crate::stack::{spawn_stack, StackConfig};
    use crate::switch::Switch;

    fn context() -> ControlContext {
        let config = Configuration::default_plan(1500, 2222, LinkDialect::HyperKit, false).unwrap();
        let counters = Arc::new(TrafficCounters::new());
        let switch = Arc::new(Switch::new(counters.clone()));
        let token = CancellationToken::new();
        let stack = spawn_stack(
            StackConfig {
                gateway_ip: config.gateway_ip,
                gateway_mac: MacAddress([2, 0, 0, 0, 0, 1]),
                virtual_ips: vec![],
                subnet_prefix: 24,
                mtu: 1500,
            },
            switch,
            token.clone(),
        );
        let forwarder = InboundForwarder::new(stack, Duration::from_secs(5), counters.clone(), token);
        ControlContext {
            forwarder,
            nat: Arc::new(NatTable::new(config.nat)),
            counters,
        }
    }

    async fn roundtrip(ctx: &ControlContext, request: &str) -> (u16, String) {
        let (mut client, server) = tokio::io::duplex(8192);
        let serve = serve_connection(server, ctx);
        let talk = async {
            client.write_all(request.as_bytes()).await.unwrap();
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            response
        };
        let (served, response) = tokio::join!(serve, talk);
        served.unwrap();

        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        (status, body)
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let ctx = context();
        ctx.counters.add_sent(42);
        let (status, body) = roundtrip(&ctx, "GET /stats HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["bytes_sent"], 42);
        assert_eq!(parsed["nat_entries"], 1);
    }

    #[tokio::test]
    async fn test_expose_unexpose_cycle() {
        let ctx = context();
        let expose = r#"{"local":"127.0.0.1:0","remote":"192.168.127.2:80","protocol":"tcp"}"#;
        let request = format!(
            "POST /services/forwarder/expose HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            expose.len(),
            expose
        );
        let (status, _) = roundtrip(&ctx, &request).await;
        assert_eq!(status, 200);
        assert_eq!(ctx.forwarder.list().len(), 1);

        // exposing the same local again conflicts
        let (status, body) = roundtrip(&ctx, &request).await;
        assert_eq!(status, 409, "{body}");

        let unexpose = r#"{"local":"127.0.0.1:0","protocol":"tcp"}"#;
        let request = format!(
            "POST /services/forwarder/unexpose HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            unexpose.len(),
            unexpose
        );
        let (status, _) = roundtrip(&ctx, &request).await;
        assert_eq!(status, 200);
        assert!(ctx.forwarder.list().is_empty());

        // unexposing twice is an error
        let (status, _) = roundtrip(&ctx, &request).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_udp_expose_rejected() {
        let ctx = context();
        let expose = r#"{"local":":9053","remote":"192.168.127.2:53","protocol":"udp"}"#;
        let request = format!(
            "POST /services/forwarder/expose HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            expose.len(),
            expose
        );
        let (status, _) = roundtrip(&ctx, &request).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_unknown_path_404() {
        let ctx = context();
        let (status, _) = roundtrip(&ctx, "GET /nope HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_malformed_body_400() {
        let ctx = context();
        let request = "POST /services/forwarder/expose HTTP/1.1\r\nContent-Length: 3\r\n\r\n{{{";
        let (status, _) = roundtrip(&ctx, request).await;
        assert_eq!(status, 400);
    }
}
