//! Payload injection through the host's DevTools endpoint.

use super::{Discovery, HostDebugger, InjectError};
use futures_util::SinkExt;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Build the DevTools command that evaluates `expression` in the target.
pub fn evaluate_command(expression: &str) -> serde_json::Value {
    json!({
        "id": 1,
        "method": "Runtime.evaluate",
        "params": {
            "expression": expression,
            "awaitPromise": true
        }
    })
}

/// Open a DevTools connection to `url` and evaluate `payload` there.
pub async fn send_payload(url: &str, payload: &str) -> Result<(), InjectError> {
    let (mut ws, _) = connect_async(url).await.map_err(classify_connect_error)?;

    let command = evaluate_command(payload).to_string();
    ws.send(Message::text(command))
        .await
        .map_err(|e| InjectError::NotSent(e.to_string()))?;

    debug!(url = %url, "injected payload");
    let _ = ws.close(None).await;
    Ok(())
}

fn classify_connect_error(err: WsError) -> InjectError {
    match err {
        WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            InjectError::Refused(e.to_string())
        }
        WsError::Http(resp) => InjectError::BadStatus(resp.status().as_u16()),
        other => InjectError::Connect(other.to_string()),
    }
}

/// The real host: rediscovers the debugger URL on every delivery, since it
/// changes whenever the host restarts.
pub struct DevToolsHost {
    discovery: Discovery,
}

impl DevToolsHost {
    pub fn new(discovery: Discovery) -> Self {
        Self { discovery }
    }
}

impl HostDebugger for DevToolsHost {
    fn inject<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), InjectError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.discovery.find_debugger_url().await?;
            send_payload(&url, payload).await
        })
    }
}
