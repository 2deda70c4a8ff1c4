// ─── Sesión con el servidor sobre el canal dúplex ───
//
// DISCONNECTED → CONNECTING → REGISTERING → READY, y cualquier error o
// conexión muerta lleva a BACKOFF_WAIT. Todo corre dentro de `tick`:
// primero se drenan los eventos del transporte en orden de llegada,
// después los timers (conexión colgada, pong vencido, heartbeat).

use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::rc::Rc;

use super::backoff::Backoff;
use super::protocol::{
    DeviceStatus, FactoryResetAcknowledged, InboundEvent, LightingSystemStatus, LightingSystemTest,
    OutboundMessage, RegisterDevice, UserActionRequired,
};
use crate::config::Timing;
use crate::identity::IdentityStore;
use crate::lighting::{to_hex, ColorPalette, DriverStatus, LightManager, LightingConfig, SystemType, UserAction};
use crate::platform::{Clock, DuplexTransport, Telemetry, TransportEvent};

/// Cada cuántos heartbeats se reenvía el estado completo.
pub const STATUS_EVERY_HEARTBEATS: u32 = 10;

/// Sin pong durante este múltiplo del heartbeat la conexión está muerta.
pub const STALE_HEARTBEATS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registering,
    Ready,
    BackoffWait,
}

/// Lo que la sesión le pide al orquestador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// El dispositivo fue reclamado por un usuario.
    Claimed,
    /// Se aplicó una config de iluminación nueva.
    LightingConfigured,
    /// Ya se mandó el ack; falta borrar y reiniciar.
    FactoryResetRequested,
}

/// Lo que la sesión toca del resto del sistema durante un `tick`.
pub struct SessionContext<'a> {
    pub identity: &'a mut IdentityStore,
    pub lights: &'a mut LightManager,
    pub telemetry: &'a Telemetry,
}

/// Transporte compartido con el notificador del driver.
struct Link {
    transport: Box<dyn DuplexTransport>,
    connected: bool,
    device_id: String,
}

impl Link {
    fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        if !self.connected {
            bail!("cannot send {}: not connected", message.event_name());
        }
        self.transport.send_text(&message.to_json()?)?;
        debug!("Sent {}", message.event_name());
        Ok(())
    }
}

pub struct CloudSession {
    link: Rc<RefCell<Link>>,
    clock: Rc<dyn Clock>,
    url: String,
    state: SessionState,
    heartbeat_interval_ms: u64,
    connect_timeout_ms: u64,
    backoff: Backoff,
    connect_started_at: u64,
    last_heartbeat_at: u64,
    last_pong_at: u64,
    heartbeat_count: u32,
    reported_lighting: Option<DriverStatus>,
}

impl CloudSession {
    pub fn new(transport: Box<dyn DuplexTransport>, url: &str, timing: &Timing, clock: Rc<dyn Clock>) -> Self {
        Self {
            link: Rc::new(RefCell::new(Link {
                transport,
                connected: false,
                device_id: String::new(),
            })),
            clock,
            url: url.to_string(),
            state: SessionState::Disconnected,
            heartbeat_interval_ms: timing.heartbeat_interval_ms,
            connect_timeout_ms: timing.session_connect_timeout_ms,
            backoff: Backoff::new(
                timing.session_retry_base_ms,
                timing.session_retry_max_ms,
                timing.session_retry_reset_ms,
            ),
            connect_started_at: 0,
            last_heartbeat_at: 0,
            last_pong_at: 0,
            heartbeat_count: 0,
            reported_lighting: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Registra en el driver el callback de acciones de usuario.
    ///
    /// El callback solo toma el transporte prestado mientras envía.
    pub fn attach_lights(&self, lights: &mut LightManager) {
        let link = Rc::clone(&self.link);
        let clock = Rc::clone(&self.clock);
        lights.set_user_notifier(Box::new(move |action: &UserAction| {
            info!("User action required: {}", action.action);
            let mut link = link.borrow_mut();
            let message = OutboundMessage::UserActionRequired(user_action_message(
                &link.device_id,
                action,
                clock.now_ms(),
            ));
            if let Err(e) = link.send(&message) {
                warn!("Could not forward user action: {:?}", e);
            }
        }));
    }

    /// Abre el canal. Nunca hay más de un intento en curso.
    pub fn connect(&mut self) {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Registering | SessionState::Ready
        ) {
            debug!("Connect ignored, session is {:?}", self.state);
            return;
        }
        let now = self.clock.now_ms();
        info!("Connecting to {}", self.url);

        let opened = self.link.borrow_mut().transport.open(&self.url);
        match opened {
            Ok(()) => {
                self.state = SessionState::Connecting;
                self.connect_started_at = now;
            }
            Err(e) => {
                warn!("WebSocket connect failed: {:?}", e);
                self.enter_backoff(now);
            }
        }
    }

    /// Cierra el canal sin reintentar.
    pub fn disconnect(&mut self) {
        let mut link = self.link.borrow_mut();
        link.transport.close();
        link.connected = false;
        self.state = SessionState::Disconnected;
    }

    pub fn tick(&mut self, ctx: &mut SessionContext<'_>) -> Vec<SessionSignal> {
        let mut signals = Vec::new();

        loop {
            let event = self.link.borrow_mut().transport.poll();
            let Some(event) = event else { break };
            let now = self.clock.now_ms();
            self.handle_transport_event(event, now, ctx, &mut signals);
        }

        let now = self.clock.now_ms();
        match self.state {
            SessionState::Connecting => {
                if now.saturating_sub(self.connect_started_at) > self.connect_timeout_ms {
                    warn!("WebSocket connect timed out");
                    self.enter_backoff(now);
                }
            }
            SessionState::Ready => self.tick_ready(now, ctx),
            SessionState::BackoffWait => {
                if self.backoff.ready(now) {
                    // Solo los reintentos agrandan el próximo delay.
                    self.backoff.record_attempt();
                    info!("Attempting WebSocket reconnection (retry {})", self.backoff.retry_count());
                    self.connect();
                }
            }
            SessionState::Disconnected | SessionState::Registering => {}
        }

        ctx.identity.set_online(self.is_ready());
        signals
    }

    fn tick_ready(&mut self, now: u64, ctx: &mut SessionContext<'_>) {
        // La conexión muerta se detecta antes de mandar otro heartbeat.
        let silence = now.saturating_sub(self.last_pong_at);
        if silence > STALE_HEARTBEATS * self.heartbeat_interval_ms {
            warn!("No pong for {} s, connection is stale", silence / 1_000);
            self.enter_backoff(now);
            return;
        }

        if now.saturating_sub(self.last_heartbeat_at) >= self.heartbeat_interval_ms {
            self.last_heartbeat_at = now;
            let pinged = self.link.borrow_mut().transport.ping();
            if let Err(e) = pinged {
                warn!("Heartbeat failed: {:?}", e);
                self.enter_backoff(now);
                return;
            }
            debug!("Heartbeat sent");

            self.heartbeat_count += 1;
            if self.heartbeat_count >= STATUS_EVERY_HEARTBEATS {
                self.heartbeat_count = 0;
                info!("Sending periodic status updates");
                self.send_device_status(ctx);
                self.send_lighting_status(ctx);
            }
        }

        if self.reported_lighting != Some(ctx.lights.status()) {
            self.send_lighting_status(ctx);
        }
    }

    fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: u64,
        ctx: &mut SessionContext<'_>,
        signals: &mut Vec<SessionSignal>,
    ) {
        match event {
            TransportEvent::Opened => {
                info!("WebSocket connected");
                self.link.borrow_mut().connected = true;
                self.backoff.reset();
                self.last_pong_at = now;
                self.last_heartbeat_at = now;
                self.heartbeat_count = 0;
                self.state = SessionState::Registering;
                self.register(ctx);
            }
            TransportEvent::Closed(reason) => {
                if self.state != SessionState::Disconnected {
                    warn!("WebSocket closed: {}", reason.as_deref().unwrap_or("no reason"));
                    self.enter_backoff(now);
                }
            }
            TransportEvent::Error(message) => {
                warn!("WebSocket error: {}", message);
                if matches!(
                    self.state,
                    SessionState::Connecting | SessionState::Registering | SessionState::Ready
                ) {
                    self.enter_backoff(now);
                }
            }
            TransportEvent::Pong | TransportEvent::Ping => {
                self.last_pong_at = now;
            }
            TransportEvent::Text(text) => {
                // Cualquier frame entrante prueba que la conexión vive.
                self.last_pong_at = now;
                self.dispatch(&text, ctx, signals);
            }
        }
    }

    fn enter_backoff(&mut self, now: u64) {
        {
            let mut link = self.link.borrow_mut();
            link.connected = false;
            link.transport.close();
        }
        self.state = SessionState::BackoffWait;
        self.backoff.schedule(now);
        info!("Next WebSocket attempt in {} s", self.backoff.delay_ms() / 1_000);
    }

    fn register(&mut self, ctx: &mut SessionContext<'_>) {
        let identity = ctx.identity.identity();
        let message = OutboundMessage::RegisterDevice(RegisterDevice {
            device_id: identity.device_id.clone(),
            mac_address: identity.mac_address.clone(),
            ip_address: ctx.telemetry.ip_address.map(|ip| ip.to_string()),
            firmware_version: identity.firmware_version.clone(),
            is_provisioned: identity.is_provisioned,
            pairing_code: Some(identity.pairing_code.clone())
                .filter(|code| !identity.is_provisioned && !code.is_empty()),
        });

        let sent = {
            let mut link = self.link.borrow_mut();
            link.device_id = identity.device_id.clone();
            link.send(&message)
        };
        if let Err(e) = sent {
            warn!("Device registration message failed: {:?}", e);
            self.enter_backoff(self.clock.now_ms());
            return;
        }
        info!("Device registration message sent");
        if !identity.is_provisioned && !identity.pairing_code.is_empty() {
            info!("Pairing code: {}", identity.pairing_code);
        }

        self.state = SessionState::Ready;
        self.send_device_status(ctx);
        self.send_lighting_status(ctx);
    }

    fn send(&self, message: &OutboundMessage) -> Result<()> {
        self.link.borrow_mut().send(message)
    }

    /// `deviceStatus`: salud + identidad. Incluye la marca de falla de storage.
    pub fn send_device_status(&mut self, ctx: &mut SessionContext<'_>) {
        let now = self.clock.now_ms();
        let storage_fault = ctx.identity.take_storage_fault();
        let identity = ctx.identity.identity();
        let message = OutboundMessage::DeviceStatus(DeviceStatus {
            device_id: identity.device_id.clone(),
            timestamp: now,
            is_online: true,
            is_provisioned: identity.is_provisioned,
            firmware_version: identity.firmware_version.clone(),
            ip_address: ctx.telemetry.ip_address.map(|ip| ip.to_string()),
            mac_address: identity.mac_address.clone(),
            wifi_rssi: ctx.telemetry.rssi,
            free_heap: ctx.telemetry.free_heap,
            uptime: ctx.telemetry.uptime_ms / 1_000,
            storage_fault,
        });
        if let Err(e) = self.send(&message) {
            warn!("Could not send device status: {:?}", e);
        }
    }

    /// `lightingSystemStatus`; no se manda si no hay sistema configurado.
    pub fn send_lighting_status(&mut self, ctx: &mut SessionContext<'_>) {
        let status = ctx.lights.status();
        self.reported_lighting = Some(status);
        let system_type = ctx.lights.system_type();
        if system_type == SystemType::None {
            debug!("Skipping lighting status, no lighting system configured");
            return;
        }

        let (wire_status, details) = match status {
            DriverStatus::Ready => ("working", None),
            DriverStatus::AuthenticationRequired => (
                "authentication_required",
                Some("User action required for authentication."),
            ),
            DriverStatus::Error => ("error", Some("Lighting system is not reachable.")),
            DriverStatus::Unconfigured => ("unknown", None),
        };
        let last_test = ctx
            .lights
            .last_test_at()
            .unwrap_or_else(|| self.clock.now_ms());
        let message = OutboundMessage::LightingSystemStatus(LightingSystemStatus {
            device_id: ctx.identity.device_id().to_string(),
            system_type: system_type.as_str().to_string(),
            status: wire_status.to_string(),
            details: details.map(str::to_string),
            last_test,
        });
        if let Err(e) = self.send(&message) {
            warn!("Could not send lighting status: {:?}", e);
        }
    }

    // ─── Eventos entrantes ───

    fn dispatch(&mut self, text: &str, ctx: &mut SessionContext<'_>, signals: &mut Vec<SessionSignal>) {
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping inbound message: {:?}", e);
                return;
            }
        };

        match event {
            InboundEvent::ColorPalette(palette) => {
                log_palette(&palette);
                if let Err(e) = ctx.lights.display_palette(&palette) {
                    warn!("Could not display palette: {:?}", e);
                }
            }
            InboundEvent::DeviceRegistered {
                device_id,
                pairing_code,
            } => {
                info!(
                    "Server confirmed registration (device {})",
                    device_id.as_deref().unwrap_or(ctx.identity.device_id())
                );
                if let Some(code) = pairing_code {
                    info!("Use pairing code {} in the app to claim this device", code);
                }
            }
            InboundEvent::DeviceClaimed {
                user_email,
                user_name,
            } => {
                info!(
                    "Device claimed by {} ({})",
                    user_name.as_deref().unwrap_or("unknown"),
                    user_email.as_deref().unwrap_or("no email")
                );
                if let Err(e) = ctx.identity.set_provisioned(true) {
                    error!("Could not persist claim: {:?}", e);
                }
                signals.push(SessionSignal::Claimed);
            }
            InboundEvent::SetupComplete { status } => {
                info!("Setup complete ({})", status.as_deref().unwrap_or("ok"));
                if let Err(e) = ctx.identity.set_provisioned(true) {
                    error!("Could not persist setup completion: {:?}", e);
                }
            }
            InboundEvent::LightingSystemConfig(config) => {
                if self.apply_lighting_config(config, ctx) {
                    signals.push(SessionSignal::LightingConfigured);
                }
            }
            InboundEvent::TestLightingSystem => self.run_lighting_test(ctx),
            InboundEvent::FactoryReset => {
                info!("Factory reset requested by server");
                let message = OutboundMessage::FactoryResetAcknowledged(FactoryResetAcknowledged {
                    device_id: ctx.identity.device_id().to_string(),
                    timestamp: self.clock.now_ms(),
                });
                if let Err(e) = self.send(&message) {
                    warn!("Could not acknowledge factory reset: {:?}", e);
                }
                signals.push(SessionSignal::FactoryResetRequested);
            }
            InboundEvent::DeviceStatusAck => debug!("Device status acknowledged"),
            InboundEvent::Unknown(name) => warn!("Unknown event '{}', ignoring", name),
        }
    }

    /// Configura el driver; Nanoleaf arranca además discovery + pairing.
    fn apply_lighting_config(&mut self, config: LightingConfig, ctx: &mut SessionContext<'_>) -> bool {
        info!("Lighting system config received: {:?}", config);
        let system_type = config.system_type;
        let discover = system_type == SystemType::Nanoleaf && !config.has_host();

        if let Err(e) = ctx.lights.configure(config, ctx.identity) {
            warn!("Lighting configuration failed: {:?}", e);
            self.send_lighting_status(ctx);
            return false;
        }

        if system_type == SystemType::Nanoleaf {
            if discover {
                let message = OutboundMessage::LightingSystemStatus(LightingSystemStatus {
                    device_id: ctx.identity.device_id().to_string(),
                    system_type: system_type.as_str().to_string(),
                    status: "authentication_required".to_string(),
                    details: Some("Press the button on your Nanoleaf controller.".to_string()),
                    last_test: self.clock.now_ms(),
                });
                if let Err(e) = self.send(&message) {
                    warn!("Could not send pre-auth lighting status: {:?}", e);
                }
            }
            match ctx.lights.authenticate(ctx.identity) {
                Ok(()) => info!("Nanoleaf ready"),
                Err(e) => warn!("Nanoleaf discovery/authentication failed: {:?}", e),
            }
        }

        self.send_lighting_status(ctx);
        true
    }

    fn run_lighting_test(&mut self, ctx: &mut SessionContext<'_>) {
        info!("Testing lighting system");
        let result = match ctx.lights.test_connection() {
            Ok(()) => {
                if let Err(e) = ctx.lights.display_palette(&ColorPalette::test_pattern()) {
                    warn!("Test pattern failed: {:?}", e);
                }
                LightingSystemTest {
                    device_id: ctx.identity.device_id().to_string(),
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Lighting test failed: {:?}", e);
                LightingSystemTest {
                    device_id: ctx.identity.device_id().to_string(),
                    success: false,
                    error: Some(format!("Connection test failed: {}", e)),
                }
            }
        };
        if let Err(e) = self.send(&OutboundMessage::LightingSystemTest(result)) {
            warn!("Could not send lighting test result: {:?}", e);
        }
        self.send_lighting_status(ctx);
    }
}

fn user_action_message(device_id: &str, action: &UserAction, now_ms: u64) -> UserActionRequired {
    let nanoleaf = action.action == "nanoleaf_pairing";
    UserActionRequired {
        device_id: device_id.to_string(),
        action: action.action.clone(),
        instructions: action.instructions.clone(),
        timeout: action.timeout_secs,
        timestamp: now_ms,
        kind: nanoleaf.then(|| "lighting_authentication".to_string()),
        system_type: nanoleaf.then(|| "nanoleaf".to_string()),
        display_message: nanoleaf.then(|| "Nanoleaf Authentication Required".to_string()),
    }
}

fn log_palette(palette: &ColorPalette) {
    info!(
        "Color palette {} from {} ({} colors)",
        palette.message_id,
        palette.sender_name,
        palette.color_count()
    );
    info!("+---------+----------+");
    info!("| Color # | Hex Code |");
    info!("+---------+----------+");
    for (i, color) in palette.colors.iter().enumerate() {
        info!("|   {:>2}    |  {}  |", i + 1, to_hex(*color));
    }
    info!("+---------+----------+");
}
