//! [`Backend`] over a hosted Postgres REST API, edge functions, and the
//! realtime WebSocket channel.

use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::backend::{Backend, RowEvent, Subscription, SubscriptionHandle};
use crate::config::RemoteConfig;
use crate::error::BackendError;

/// Async client for the hosted backend.
///
/// # Example
/// ```no_run
/// use rams_coordinator::{RemoteBackend, RemoteConfig};
///
/// # fn example() -> Result<(), rams_coordinator::BackendError> {
/// let backend = RemoteBackend::new(RemoteConfig::from_env()?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    http: Client,
    config: RemoteConfig,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.config.api_key)
            .bearer_auth(self.config.bearer())
            .timeout(self.config.request_timeout)
    }

    async fn send(&self, req: RequestBuilder, context: String) -> Result<Response, BackendError> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| BackendError::Network { context, source: e })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Http { status, body });
        }
        Ok(resp)
    }

    async fn join(
        &self,
        table: &str,
        id: &str,
        event: RowEvent,
    ) -> Result<(RealtimeSocket, String), BackendError> {
        let url = realtime_url(&self.config.base_url, &self.config.api_key)?;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| BackendError::WebSocket(e.to_string()))?;

        let topic = channel_topic(table, id);
        let join = join_message(&topic, table, id, event, self.config.bearer());
        ws.send(Message::Text(join.to_string()))
            .await
            .map_err(|e| BackendError::WebSocket(e.to_string()))?;

        let reply = tokio::time::timeout(self.config.request_timeout, async {
            while let Some(msg) = ws.next().await {
                let text = match msg {
                    Ok(m) if m.is_text() => m.into_text().unwrap_or_default(),
                    Ok(m) if m.is_close() => break,
                    Ok(_) => continue,
                    Err(e) => return Err(BackendError::WebSocket(e.to_string())),
                };
                match parse_realtime(&text) {
                    Some(RealtimeMessage::JoinReply { ok: true, .. }) => return Ok(()),
                    Some(RealtimeMessage::JoinReply { ok: false, reason })
                    | Some(RealtimeMessage::ChannelError { reason }) => {
                        return Err(BackendError::WebSocket(
                            reason.unwrap_or_else(|| "Channel join rejected".into()),
                        ))
                    }
                    _ => {}
                }
            }
            Err(BackendError::Closed)
        })
        .await
        .map_err(|_| BackendError::WebSocket("Timed out joining realtime channel".into()))?;

        reply?;
        Ok((ws, topic))
    }
}

type RealtimeSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl Backend for RemoteBackend {
    async fn create_record(&self, table: &str, fields: Value) -> Result<Value, BackendError> {
        let url = format!("{}/rest/v1/{}", self.config.base_url, table);
        let req = self
            .http
            .post(&url)
            .header("Prefer", "return=representation")
            .json(&fields);
        let resp = self
            .send(req, format!("Failed to create {} record", table))
            .await?;

        let body: Value = resp.json().await.map_err(|e| BackendError::Network {
            context: format!("Failed to parse {} insert response", table),
            source: e,
        })?;
        first_row(body)
    }

    async fn update_record(&self, table: &str, id: &str, fields: Value) -> Result<(), BackendError> {
        let url = format!("{}/rest/v1/{}", self.config.base_url, table);
        let req = self
            .http
            .patch(&url)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=minimal")
            .json(&fields);
        self.send(req, format!("Failed to update {} record {}", table, id))
            .await?;
        Ok(())
    }

    async fn subscribe_to_row_updates(
        &self,
        table: &str,
        id: &str,
        event: RowEvent,
    ) -> Result<Subscription, BackendError> {
        let (ws, topic) = self.join(table, id, event).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(pump(ws, topic, event, tx, stop_rx, self.config.heartbeat_interval));

        let handle = SubscriptionHandle::new(move || {
            let _ = stop_tx.send(());
        });
        Ok(Subscription::new(rx, handle))
    }

    async fn invoke_function(&self, name: &str, payload: Value) -> Result<(), BackendError> {
        let url = format!("{}/functions/v1/{}", self.config.base_url, name);
        let req = self.http.post(&url).json(&payload);
        self.send(req, format!("Failed to invoke {}", name)).await?;
        Ok(())
    }
}

/// Forward row changes until the handle is released or the socket dies.
async fn pump(
    ws: RealtimeSocket,
    topic: String,
    event: RowEvent,
    tx: mpsc::UnboundedSender<Value>,
    mut stop_rx: oneshot::Receiver<()>,
    heartbeat_interval: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                let _ = sink
                    .send(Message::Text(leave_message(&topic, next_ref).to_string()))
                    .await;
                let _ = sink.close().await;
                tracing::debug!(topic = %topic, "Left realtime channel");
                return;
            }
            _ = heartbeat.tick() => {
                let msg = heartbeat_message(next_ref);
                next_ref += 1;
                if let Err(e) = sink.send(Message::Text(msg.to_string())).await {
                    tracing::warn!(topic = %topic, error = %e, "Realtime heartbeat failed");
                    return;
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(m)) if m.is_text() => m.into_text().unwrap_or_default(),
                    Some(Ok(m)) if m.is_close() => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(topic = %topic, error = %e, "Realtime socket error");
                        break;
                    }
                    None => break,
                };
                match parse_realtime(&text) {
                    Some(RealtimeMessage::Change { event: change, record }) if event.matches(change) => {
                        if tx.send(record).is_err() {
                            return;
                        }
                    }
                    Some(RealtimeMessage::ChannelError { reason }) => {
                        tracing::warn!(
                            topic = %topic,
                            reason = reason.as_deref().unwrap_or("unknown"),
                            "Realtime channel error"
                        );
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    tracing::debug!(topic = %topic, "Realtime stream ended");
}

/// A decoded realtime frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeMessage {
    JoinReply { ok: bool, reason: Option<String> },
    Change { event: RowEvent, record: Value },
    ChannelError { reason: Option<String> },
    Other,
}

fn channel_topic(table: &str, id: &str) -> String {
    format!("realtime:public:{}:id=eq.{}", table, id)
}

/// Realtime WebSocket URL for a project base URL. The API key is
/// query-encoded.
pub fn realtime_url(base_url: &str, api_key: &str) -> Result<String, BackendError> {
    let ws_base = base_url
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let mut url = Url::parse(&format!("{}/realtime/v1/websocket", ws_base))
        .map_err(|e| BackendError::WebSocket(format!("Invalid realtime URL {}: {}", ws_base, e)))?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url.into())
}

pub fn join_message(topic: &str, table: &str, id: &str, event: RowEvent, token: &str) -> Value {
    json!({
        "topic": topic,
        "event": "phx_join",
        "ref": "1",
        "join_ref": "1",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": event.as_str(),
                    "schema": "public",
                    "table": table,
                    "filter": format!("id=eq.{}", id),
                }],
            },
            "access_token": token,
        },
    })
}

pub fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

pub fn leave_message(topic: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

/// Decode a realtime frame. Returns `None` for text that is not JSON.
pub fn parse_realtime(text: &str) -> Option<RealtimeMessage> {
    let json: Value = serde_json::from_str(text).ok()?;
    let event = json.get("event").and_then(|v| v.as_str()).unwrap_or("");
    let payload = json.get("payload");

    let message = match event {
        "phx_reply" if json.get("ref").and_then(|v| v.as_str()) == Some("1") => {
            let status = payload
                .and_then(|p| p.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let reason = payload
                .and_then(|p| p.pointer("/response/reason"))
                .and_then(|v| v.as_str())
                .map(String::from);
            RealtimeMessage::JoinReply {
                ok: status == "ok",
                reason,
            }
        }
        "postgres_changes" => {
            let data = payload.and_then(|p| p.get("data"));
            let change = match data.and_then(|d| d.get("type")).and_then(|v| v.as_str()) {
                Some("INSERT") => RowEvent::Insert,
                Some("UPDATE") => RowEvent::Update,
                _ => return Some(RealtimeMessage::Other),
            };
            match data.and_then(|d| d.get("record")) {
                Some(record) if record.is_object() => RealtimeMessage::Change {
                    event: change,
                    record: record.clone(),
                },
                _ => RealtimeMessage::Other,
            }
        }
        "phx_error" | "phx_close" | "system"
            if event != "system"
                || payload.and_then(|p| p.get("status")).and_then(|v| v.as_str())
                    == Some("error") =>
        {
            let reason = payload
                .and_then(|p| p.get("message").or_else(|| p.get("reason")))
                .and_then(|v| v.as_str())
                .map(String::from);
            RealtimeMessage::ChannelError { reason }
        }
        _ => RealtimeMessage::Other,
    };
    Some(message)
}

fn first_row(body: Value) -> Result<Value, BackendError> {
    match body {
        Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
        Value::Object(_) => Ok(body),
        _ => Err(BackendError::InvalidResponse(
            "Insert returned no rows".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url() {
        assert_eq!(
            realtime_url("https://abc.supabase.co/", "key").unwrap(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
        assert_eq!(
            realtime_url("http://localhost:54321", "k").unwrap(),
            "ws://localhost:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn test_realtime_url_encodes_key() {
        let url = realtime_url("https://abc.supabase.co", "a+b/c=d&e").unwrap();
        assert_eq!(
            url,
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=a%2Bb%2Fc%3Dd%26e&vsn=1.0.0"
        );
        assert!(realtime_url("not a url", "k").is_err());
    }

    #[test]
    fn test_channel_topic_names_the_row() {
        assert_eq!(
            channel_topic("rams_generation_jobs", "job-1"),
            "realtime:public:rams_generation_jobs:id=eq.job-1"
        );
    }

    #[test]
    fn test_join_message_filters_by_row() {
        let msg = join_message(
            "realtime:public:rams_generation_jobs:id=eq.job-1",
            "rams_generation_jobs",
            "job-1",
            RowEvent::Update,
            "jwt",
        );
        assert_eq!(msg["event"], "phx_join");
        let change = &msg["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "UPDATE");
        assert_eq!(change["table"], "rams_generation_jobs");
        assert_eq!(change["filter"], "id=eq.job-1");
        assert_eq!(msg["payload"]["access_token"], "jwt");
    }

    #[test]
    fn test_heartbeat_and_leave() {
        let hb = heartbeat_message(7);
        assert_eq!(hb["topic"], "phoenix");
        assert_eq!(hb["ref"], "7");

        let leave = leave_message("realtime:t", 8);
        assert_eq!(leave["event"], "phx_leave");
        assert_eq!(leave["topic"], "realtime:t");
    }

    #[test]
    fn test_parse_join_reply() {
        let ok = r#"{"event":"phx_reply","ref":"1","topic":"realtime:x",
            "payload":{"status":"ok","response":{"postgres_changes":[{"id":1}]}}}"#;
        assert_eq!(
            parse_realtime(ok),
            Some(RealtimeMessage::JoinReply { ok: true, reason: None })
        );

        let err = r#"{"event":"phx_reply","ref":"1","topic":"realtime:x",
            "payload":{"status":"error","response":{"reason":"unauthorized"}}}"#;
        assert_eq!(
            parse_realtime(err),
            Some(RealtimeMessage::JoinReply {
                ok: false,
                reason: Some("unauthorized".into())
            })
        );
    }

    #[test]
    fn test_heartbeat_reply_is_not_a_join_reply() {
        let reply = r#"{"event":"phx_reply","ref":"5","topic":"phoenix","payload":{"status":"ok"}}"#;
        assert_eq!(parse_realtime(reply), Some(RealtimeMessage::Other));
    }

    #[test]
    fn test_parse_postgres_change() {
        let text = r#"{
            "event": "postgres_changes",
            "topic": "realtime:x",
            "payload": {
                "ids": [123],
                "data": {
                    "type": "UPDATE",
                    "schema": "public",
                    "table": "rams_generation_jobs",
                    "record": {"id": "job-1", "status": "in_progress", "progress": 40},
                    "old_record": {"id": "job-1"}
                }
            }
        }"#;
        match parse_realtime(text) {
            Some(RealtimeMessage::Change { event, record }) => {
                assert_eq!(event, RowEvent::Update);
                assert_eq!(record["progress"], 40);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_is_ignored() {
        let text = r#"{"event":"postgres_changes","payload":{"data":{"type":"DELETE","old_record":{"id":"j"}}}}"#;
        assert_eq!(parse_realtime(text), Some(RealtimeMessage::Other));
    }

    #[test]
    fn test_parse_channel_error() {
        let text = r#"{"event":"system","payload":{"status":"error","message":"RLS denied"}}"#;
        assert_eq!(
            parse_realtime(text),
            Some(RealtimeMessage::ChannelError {
                reason: Some("RLS denied".into())
            })
        );

        let ok = r#"{"event":"system","payload":{"status":"ok","message":"subscribed"}}"#;
        assert_eq!(parse_realtime(ok), Some(RealtimeMessage::Other));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_realtime("not json"), None);
    }

    #[test]
    fn test_first_row() {
        let row = first_row(json!([{"id": "job-1"}])).unwrap();
        assert_eq!(row["id"], "job-1");
        assert!(first_row(json!([])).is_err());
        assert_eq!(first_row(json!({"id": "x"})).unwrap()["id"], "x");
    }

    #[test]
    fn test_client_builder() {
        let backend = RemoteBackend::new(RemoteConfig::new("https://abc.supabase.co/", "key"));
        assert_eq!(backend.config().base_url, "https://abc.supabase.co");
    }
}
