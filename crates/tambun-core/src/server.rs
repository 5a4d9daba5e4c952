//! ============================================================================
//! Webhook Server - HTTP transport
//! ============================================================================
//! Blocking `tiny_http` listener that hands work to the tokio runtime.
//!
//! Routes:
//! - POST /webhook                signed platform events, always acknowledged
//! - PUT  /donations/{id}/amount  edit-amount page confirmation
//! - GET  /donations/{id}         record lookup for the edit-amount page
//! - GET  /health
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use tiny_http::{Header, Request, Response, Server};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::events::{parse_webhook, verify_signature, SIGNATURE_HEADER};
use crate::handler::EventHandler;
use crate::types::{parse_amount, TambunError};

/// Requests larger than this are cut off
const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Transport-independent view of a request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

impl HttpReply {
    fn ok(data: Value) -> Self {
        Self { status: 200, body: json!({"success": true, "data": data}) }
    }

    fn error(status: u16, message: &str) -> Self {
        Self { status, body: json!({"success": false, "error": message}) }
    }
}

#[derive(Debug, Deserialize)]
struct AmountRequest {
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    recipient_name: Option<String>,
}

/// Number or numeric string; anything else is invalid
fn amount_from_json(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite() && *v > 0.0),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Bind the listener
pub fn listen(addr: &str) -> Result<Arc<Server>> {
    let server = Server::http(addr).map_err(|e| anyhow!("Failed to start server on {}: {}", addr, e))?;
    info!("Listening on {}", addr);
    Ok(Arc::new(server))
}

pub struct WebhookServer {
    handler: Arc<EventHandler>,
    channel_secret: String,
    runtime: Handle,
}

impl WebhookServer {
    pub fn new(handler: Arc<EventHandler>, channel_secret: String, runtime: Handle) -> Self {
        Self { handler, channel_secret, runtime }
    }

    /// Serve until the listener is unblocked. Call from a plain thread,
    /// not from inside the runtime. Every request is read, handled and
    /// answered on its own blocking-pool thread, so a slow confirmation
    /// never holds up webhook acknowledgements.
    pub fn run(self: Arc<Self>, server: &Server) {
        for request in server.incoming_requests() {
            let this = Arc::clone(&self);
            self.runtime.spawn_blocking(move || this.serve_one(request));
        }
        info!("Webhook server stopped");
    }

    fn serve_one(&self, mut request: Request) {
        let signature = request
            .headers()
            .iter()
            .find(|h| h.field.equiv(SIGNATURE_HEADER))
            .map(|h| h.value.as_str().to_string());

        let mut body = Vec::new();
        if let Err(e) = request.as_reader().take(MAX_BODY_BYTES).read_to_end(&mut body) {
            warn!("Failed to read request body: {}", e);
        }

        let incoming = HttpRequest {
            method: request.method().as_str().to_uppercase(),
            path: request.url().to_string(),
            signature,
            body,
        };
        debug!("{} {}", incoming.method, incoming.path);

        let reply = self.runtime.block_on(self.handle(incoming));
        let mut response = Response::from_string(reply.body.to_string()).with_status_code(reply.status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json; charset=utf-8"[..]) {
            response = response.with_header(header);
        }
        if let Err(e) = request.respond(response) {
            warn!("Failed to send response: {}", e);
        }
    }

    /// Route one request
    pub async fn handle(&self, request: HttpRequest) -> HttpReply {
        let path = request.path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["webhook"]) => self.webhook(&request),
            ("PUT", ["donations", id, "amount"]) => self.confirm_amount(id, &request.body).await,
            ("GET", ["donations", id]) => self.get_donation(id),
            ("GET", ["health"]) => HttpReply {
                status: 200,
                body: json!({"status": "ok", "timestamp": chrono::Utc::now().to_rfc3339()}),
            },
            _ => HttpReply::error(404, "Not found"),
        }
    }

    fn webhook(&self, request: &HttpRequest) -> HttpReply {
        let signed = request
            .signature
            .as_deref()
            .map(|sig| !self.channel_secret.is_empty() && verify_signature(&self.channel_secret, &request.body, sig))
            .unwrap_or(false);
        if !signed {
            warn!("Rejected webhook with missing or invalid signature");
            return HttpReply::error(401, "Invalid signature");
        }

        // Acknowledge regardless of what happens downstream
        match parse_webhook(&request.body) {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                let handler = Arc::clone(&self.handler);
                self.runtime.spawn(async move { handler.handle_events(events).await });
            }
            Err(e) => warn!("Dropping malformed webhook: {}", e),
        }
        HttpReply { status: 200, body: json!({"status": "ok"}) }
    }

    async fn confirm_amount(&self, donation_id: &str, body: &[u8]) -> HttpReply {
        let request: AmountRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(_) => return HttpReply::error(400, "Valid amount is required"),
        };
        let Some(amount) = amount_from_json(request.amount.as_ref()) else {
            return HttpReply::error(400, "Valid amount is required");
        };

        match self
            .handler
            .confirm_by_amount(donation_id, amount, request.recipient_name.as_deref())
            .await
        {
            Ok(record) => match serde_json::to_value(&record) {
                Ok(data) => HttpReply::ok(data),
                Err(e) => HttpReply::error(500, &e.to_string()),
            },
            Err(TambunError::InvalidAmount(_)) | Err(TambunError::MissingField(_)) => {
                HttpReply::error(400, "Valid amount is required")
            }
            Err(TambunError::NotFound(_)) => HttpReply::error(404, "Donation not found"),
            Err(TambunError::AlreadyConfirmed(_)) => HttpReply::error(409, "Donation already confirmed"),
            Err(TambunError::Internal(e)) => {
                error!("Failed to confirm donation {}: {:#}", donation_id, e);
                HttpReply::error(500, "Failed to confirm donation")
            }
        }
    }

    fn get_donation(&self, donation_id: &str) -> HttpReply {
        match self.handler.ledger().db().get_donation(donation_id) {
            Ok(Some(record)) => match serde_json::to_value(&record) {
                Ok(data) => HttpReply::ok(data),
                Err(e) => HttpReply::error(500, &e.to_string()),
            },
            Ok(None) => HttpReply::error(404, "Donation not found"),
            Err(e) => {
                error!("Failed to load donation {}: {:#}", donation_id, e);
                HttpReply::error(500, "Failed to load donation")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::db::LedgerDb;
    use crate::events::sign_body;
    use crate::testing::RecordingMessenger;
    use crate::types::{ConversationKey, ConversationType, NewProject};
    use std::time::{Duration, Instant};

    const SECRET: &str = "channel-secret";

    fn server() -> (WebhookServer, Arc<RecordingMessenger>) {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let mock = Arc::new(RecordingMessenger::default());
        let handler = Arc::new(EventHandler::new(db, mock.clone(), &BotConfig::default()));
        (WebhookServer::new(handler, SECRET.into(), Handle::current()), mock)
    }

    fn request(method: &str, path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            path: path.into(),
            signature: None,
            body: body.as_bytes().to_vec(),
        }
    }

    fn pending(server: &WebhookServer) -> String {
        let ledger = server.handler.ledger();
        let project = ledger
            .db()
            .create_project(NewProject { name: "Roof".into(), ..Default::default() })
            .unwrap();
        ledger
            .create_pending(&ConversationKey::new("U1", "U1"), ConversationType::Direct, &project.id, "x")
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_webhook_requires_signature() {
        let (server, _) = server();
        let body = r#"{"destination":"x","events":[]}"#;

        let unsigned = server.handle(request("POST", "/webhook", body)).await;
        assert_eq!(unsigned.status, 401);

        let mut forged = request("POST", "/webhook", body);
        forged.signature = Some(sign_body("other", body.as_bytes()).unwrap());
        assert_eq!(server.handle(forged).await.status, 401);

        let mut signed = request("POST", "/webhook", body);
        signed.signature = Some(sign_body(SECRET, body.as_bytes()).unwrap());
        assert_eq!(server.handle(signed).await.status, 200);
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_still_acknowledged() {
        let (server, _) = server();
        let body = "{not json";
        let mut signed = request("POST", "/webhook", body);
        signed.signature = Some(sign_body(SECRET, body.as_bytes()).unwrap());
        assert_eq!(server.handle(signed).await.status, 200);
    }

    #[tokio::test]
    async fn test_amount_route_status_codes() {
        let (server, mock) = server();
        let id = pending(&server);
        let path = format!("/donations/{}/amount", id);

        assert_eq!(server.handle(request("PUT", &path, r#"{"amount":0}"#)).await.status, 400);
        assert_eq!(server.handle(request("PUT", &path, "nope")).await.status, 400);
        assert_eq!(
            server.handle(request("PUT", "/donations/missing/amount", r#"{"amount":5}"#)).await.status,
            404
        );

        let ok = server
            .handle(request("PUT", &path, r#"{"amount":"1,200","recipient_name":"Abbot"}"#))
            .await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body["data"]["final_amount"], 1200.0);
        assert_eq!(ok.body["data"]["recipient_label"], "Abbot");
        assert_eq!(mock.pushes().len(), 1);

        let again = server.handle(request("PUT", &path, r#"{"amount":1200}"#)).await;
        assert_eq!(again.status, 409);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_webhook_ack_not_held_up_by_slow_confirm() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let slow = Arc::new(RecordingMessenger {
            push_delay: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        let handler = Arc::new(EventHandler::new(db, slow, &BotConfig::default()));
        let webhook = Arc::new(WebhookServer::new(handler, SECRET.into(), Handle::current()));
        let id = pending(&webhook);

        let listener = listen("127.0.0.1:0").unwrap();
        let addr = listener.server_addr().to_ip().unwrap();
        let serving = {
            let webhook = Arc::clone(&webhook);
            let listener = Arc::clone(&listener);
            std::thread::spawn(move || webhook.run(&listener))
        };

        let client = reqwest::Client::new();
        let confirm = {
            let client = client.clone();
            let url = format!("http://{}/donations/{}/amount", addr, id);
            tokio::spawn(async move {
                client.put(url).body(r#"{"amount":500}"#).send().await.unwrap().status().as_u16()
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let body = r#"{"destination":"x","events":[]}"#;
        let started = Instant::now();
        let ack = client
            .post(format!("http://{}/webhook", addr))
            .header(SIGNATURE_HEADER, sign_body(SECRET, body.as_bytes()).unwrap())
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(ack.status().as_u16(), 200);
        assert!(started.elapsed() < Duration::from_secs(1), "ack took {:?}", started.elapsed());

        assert_eq!(confirm.await.unwrap(), 200);
        listener.unblock();
        tokio::task::spawn_blocking(move || serving.join()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lookup_and_health() {
        let (server, _) = server();
        let id = pending(&server);

        let found = server.handle(request("GET", &format!("/donations/{}", id), "")).await;
        assert_eq!(found.status, 200);
        assert_eq!(found.body["data"]["status"], "waiting_confirmation");

        assert_eq!(server.handle(request("GET", "/donations/missing", "")).await.status, 404);
        let health = server.handle(request("GET", "/health?check=1", "")).await;
        assert_eq!(health.body["status"], "ok");
        assert_eq!(server.handle(request("DELETE", "/health", "")).await.status, 404);
    }
}
