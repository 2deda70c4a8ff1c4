// ─── WebSocket sobre esp_websocket_client ───
//
// El cliente de ESP-IDF entrega los eventos en su propia task; el
// callback solo los traduce y los encola. La sesión los drena en `poll`.

use anyhow::{anyhow, bail, Result};
use embedded_svc::ws::FrameType;
use esp_idf_svc::io::EspIOError;
use esp_idf_svc::ws::client::{EspWebSocketClient, EspWebSocketClientConfig, WebSocketEvent, WebSocketEventType};
use log::{debug, info};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::platform::{DuplexTransport, TransportEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct EspDuplex {
    client: Option<EspWebSocketClient<'static>>,
    events: Option<Receiver<TransportEvent>>,
}

fn translate(event: &Result<WebSocketEvent<'_>, EspIOError>) -> Option<TransportEvent> {
    let event = match event {
        Ok(event) => event,
        Err(e) => return Some(TransportEvent::Error(format!("{:?}", e))),
    };
    match &event.event_type {
        WebSocketEventType::Connected => Some(TransportEvent::Opened),
        WebSocketEventType::Disconnected | WebSocketEventType::Closed => Some(TransportEvent::Closed(None)),
        WebSocketEventType::Close(reason) => Some(TransportEvent::Closed(reason.as_ref().map(|r| format!("{:?}", r)))),
        WebSocketEventType::Text(text) => Some(TransportEvent::Text(text.to_string())),
        WebSocketEventType::Ping => Some(TransportEvent::Ping),
        WebSocketEventType::Pong => Some(TransportEvent::Pong),
        _ => None,
    }
}

impl DuplexTransport for EspDuplex {
    fn open(&mut self, url: &str) -> Result<()> {
        self.close();

        let (tx, rx): (Sender<TransportEvent>, Receiver<TransportEvent>) = mpsc::channel();
        let config = EspWebSocketClientConfig {
            // La sesión maneja sus propios reintentos con backoff.
            disable_auto_reconnect: true,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };

        info!("Opening WebSocket {}", url);
        let client = EspWebSocketClient::new(url, &config, CONNECT_TIMEOUT, move |event| {
            if let Some(event) = translate(event) {
                // El receptor ya no existe si la sesión cerró: nada que hacer.
                let _ = tx.send(event);
            }
        })
        .map_err(|e| anyhow!("failed to start WebSocket client: {:?}", e))?;

        self.client = Some(client);
        self.events = Some(rx);
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.events.as_ref()?.try_recv().ok()
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        let Some(client) = self.client.as_mut() else {
            bail!("WebSocket is not open");
        };
        client
            .send(FrameType::Text(false), text.as_bytes())
            .map_err(|e| anyhow!("WebSocket send failed: {:?}", e))?;
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        let Some(client) = self.client.as_mut() else {
            bail!("WebSocket is not open");
        };
        client
            .send(FrameType::Ping, &[])
            .map_err(|e| anyhow!("WebSocket ping failed: {:?}", e))?;
        Ok(())
    }

    fn close(&mut self) {
        // Drop del cliente = esp_websocket_client_destroy.
        if self.client.take().is_some() {
            debug!("WebSocket client destroyed");
        }
        self.events = None;
    }
}
