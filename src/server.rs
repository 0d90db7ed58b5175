//! HTTP front door: `POST /api/chat` runs validate → moderate → dispatch →
//! encode and streams the frames back with chunked transfer encoding.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use futures_util::stream::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, OpenRouterBackend};
use crate::encoder::encode;
use crate::error::{RelayError, Result};
use crate::message::ErrorBody;
use crate::moderation::{moderate, ChatClassifier, Classifier};
use crate::simulate::{seed_text, simulate, word_count_for_body};
use crate::validator::{validate, ChallengeVerifier, SiteVerifier};

pub const CHAT_PATH: &str = "/api/chat";
const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Encoded wire frames for one response.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The request pipeline and its collaborators. Shared read-only across
/// connections.
pub struct Relay {
    verifier: Arc<dyn ChallengeVerifier>,
    classifier: Arc<dyn Classifier>,
    dispatcher: Dispatcher,
    /// Cadence of the lorem ipsum generator, when it replaces the pipeline.
    simulation: Option<Duration>,
    max_body_bytes: usize,
}

impl Relay {
    pub fn new(
        verifier: Arc<dyn ChallengeVerifier>,
        classifier: Arc<dyn Classifier>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            verifier,
            classifier,
            dispatcher,
            simulation: None,
            max_body_bytes: Config::default().max_body_bytes,
        }
    }

    pub fn with_simulation(mut self, cadence: Option<Duration>) -> Self {
        self.simulation = cadence;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Wire the production collaborators from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;

        let secrets = &config.secrets;
        if secrets.challenge_secret.is_none() && !config.simulation_enabled() {
            warn!("challenge secret not set; every token will fail verification");
        }
        if secrets.moderation_api_key.is_none() && !config.simulation_enabled() {
            warn!("moderation key not set; moderation will fail open");
        }

        let verifier = SiteVerifier::new(
            http.clone(),
            config.verify_url.clone(),
            secrets.challenge_secret.clone().unwrap_or_default(),
        );
        let classifier = ChatClassifier::new(
            http.clone(),
            config.moderation_url.clone(),
            config.moderation_model.clone(),
            secrets.moderation_api_key.clone().unwrap_or_default(),
        );
        let backend = OpenRouterBackend::new(
            http,
            config.completions_url.clone(),
            secrets.provider_api_key.clone().unwrap_or_default(),
        );
        let dispatcher = Dispatcher::new(
            Arc::new(backend),
            config.models.clone(),
            config.system_prompt.clone(),
        );

        let simulation = config.simulation_enabled().then(|| config.simulate_cadence());
        Ok(Self::new(Arc::new(verifier), Arc::new(classifier), dispatcher)
            .with_simulation(simulation)
            .with_max_body_bytes(config.max_body_bytes))
    }

    pub fn is_simulated(&self) -> bool {
        self.simulation.is_some()
    }

    /// Run the pipeline up to the first frame. Any error here is reported
    /// as a JSON body; errors after this point end the stream instead.
    pub async fn open(&self, raw: &[u8]) -> Result<FrameStream> {
        if let Some(cadence) = self.simulation {
            let text = seed_text(word_count_for_body(raw));
            debug!(words = text.split_whitespace().count(), "simulating response");
            return Ok(Box::pin(simulate(&text, cadence).map(Ok)));
        }

        let request = validate(raw, self.verifier.as_ref()).await?;
        moderate(&request.messages, self.classifier.as_ref()).await?;
        let events = self.dispatcher.dispatch(&request.messages).await?;
        Ok(Box::pin(encode(events)))
    }
}

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Debug)]
enum ReadOutcome {
    Request(HttpRequest),
    TooLarge,
    Malformed,
    Closed,
}

struct Head {
    method: String,
    path: String,
    content_length: usize,
    len: usize,
}

fn parse_head(buf: &[u8]) -> std::result::Result<Option<Head>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let httparse::Status::Complete(len) = req.parse(buf)? else {
        return Ok(None);
    };
    let content_length = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let target = req.path.unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target).to_string();
    Ok(Some(Head {
        method: req.method.unwrap_or("").to_string(),
        path,
        content_length,
        len,
    }))
}

/// Read one request from `stream`. `buf` carries bytes already received on
/// this connection; anything past the request stays in it for the next call.
async fn read_request<R>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max_body: usize,
) -> std::io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];

    let head = loop {
        match parse_head(buf) {
            Ok(Some(head)) => break head,
            Ok(None) if buf.len() > MAX_HEAD_BYTES => return Ok(ReadOutcome::Malformed),
            Ok(None) => {}
            Err(_) => return Ok(ReadOutcome::Malformed),
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(if buf.is_empty() {
                ReadOutcome::Closed
            } else {
                ReadOutcome::Malformed
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if head.content_length > max_body {
        return Ok(ReadOutcome::TooLarge);
    }

    let total = head.len + head.content_length;
    while buf.len() < total {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(ReadOutcome::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let rest = buf.split_off(total);
    let mut request = std::mem::replace(buf, rest);
    let body = request.split_off(head.len);

    Ok(ReadOutcome::Request(HttpRequest {
        method: head.method,
        path: head.path,
        body,
    }))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

fn json_response(status: u16, message: &str) -> String {
    let body = serde_json::to_string(&ErrorBody::new(message)).unwrap_or_else(|_| "{}".to_string());
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        body.len(),
        body
    )
}

const STREAM_HEADERS: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n\r\n";

fn chunk(frame: &str) -> String {
    format!("{:x}\r\n{}\r\n", frame.len(), frame)
}

/// Write `frames` as chunks. Returns `false` if the stream failed and the
/// connection was closed without the terminating chunk.
async fn write_stream<W>(stream: &mut W, mut frames: FrameStream) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(STREAM_HEADERS.as_bytes()).await?;
    let mut count = 0usize;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                stream.write_all(chunk(&frame).as_bytes()).await?;
                count += 1;
            }
            Err(e) => {
                warn!(error = %e, frames = count, "upstream failed mid-stream; closing");
                let _ = stream.shutdown().await;
                return Ok(false);
            }
        }
    }
    stream.write_all(b"0\r\n\r\n").await?;
    info!(frames = count, "stream complete");
    Ok(true)
}

async fn handle_connection(mut stream: TcpStream, relay: Arc<Relay>) -> std::io::Result<()> {
    let mut pending = Vec::with_capacity(4096);
    loop {
        let request = match read_request(&mut stream, &mut pending, relay.max_body_bytes).await? {
            ReadOutcome::Request(r) => r,
            ReadOutcome::Closed => return Ok(()),
            ReadOutcome::TooLarge => {
                warn!(max = relay.max_body_bytes, "request body too large");
                stream.write_all(json_response(413, "Payload too large").as_bytes()).await?;
                return Ok(());
            }
            ReadOutcome::Malformed => {
                stream.write_all(json_response(400, "Bad request").as_bytes()).await?;
                return Ok(());
            }
        };

        if request.path != CHAT_PATH {
            debug!(path = %request.path, "no route");
            stream.write_all(json_response(404, "Not found").as_bytes()).await?;
            return Ok(());
        }
        if request.method != "POST" {
            stream.write_all(json_response(405, "Method not allowed").as_bytes()).await?;
            return Ok(());
        }

        info!(bytes = request.body.len(), "chat request");
        match relay.open(&request.body).await {
            Ok(frames) => {
                if !write_stream(&mut stream, frames).await? {
                    return Ok(());
                }
            }
            Err(e) => {
                let status = e.status_code();
                warn!(status, error = %e, "chat request failed");
                stream.write_all(json_response(status, &e.to_string()).as_bytes()).await?;
                return Ok(());
            }
        }
    }
}

/// Accept connections forever, one task per connection.
pub async fn run(listener: TcpListener, relay: Arc<Relay>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let relay = Arc::clone(&relay);
        let span = info_span!("request", id = %Uuid::new_v4(), peer = %peer);
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(stream, relay).await {
                    debug!(error = %e, "connection error");
                }
            }
            .instrument(span),
        );
    }
}

/// Bind `config.bind_addr()` and serve until the process exits.
pub async fn serve(config: Config) -> Result<()> {
    let relay = Arc::new(Relay::from_config(&config)?);
    let listener = TcpListener::bind(config.bind_addr()).await?;
    let addr: SocketAddr = listener.local_addr()?;

    eprintln!(
        "{}",
        format!("  Chat relay listening on http://{addr}{CHAT_PATH}").bright_green()
    );
    if relay.is_simulated() {
        eprintln!("{}", "  Simulation mode: serving lorem ipsum streams.".bright_yellow());
    }
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

    run(listener, relay).await
}
