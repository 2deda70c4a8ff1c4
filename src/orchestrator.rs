// ─── Orquestador: ciclo de vida del dispositivo ───
//
// BOOT → LOAD_IDENTITY → { credenciales ? STATION_CONNECT : PORTAL }
// STATION_CONNECT → REGISTER_MINIMAL → SESSION_CONNECT ⇄ SESSION_READY
//
// Un solo loop cooperativo: `main` llama a `tick` cada pocos ms y todo
// (watchdog, portal, sesión, timers) avanza desde acá.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::rc::Rc;

use crate::cloud::{apply_registration, CloudApi, CloudSession, RegistrationReply, SessionContext, SessionSignal};
use crate::config::{exponential_delay, Timing, FIRMWARE_VERSION};
use crate::error::{ErrorCode, ErrorRecovery, RecoveryStrategy};
use crate::identity::{IdentityStore, WifiCredentials};
use crate::lighting::{LightManager, LightingBackends};
use crate::platform::{
    Clock, DuplexTransport, HttpTransport, PortalBackend, SystemControl, Telemetry, WifiControl,
};
use crate::provisioning::{NetworkMode, NetworkProvisioner, PortalInfo, ProvisioningEvent};
use crate::storage::StorageBackend;
use crate::watchdog::{self, FeedSchedule};

/// Espera antes de reintentar levantar un portal que falló.
const PORTAL_RETRY_MS: u64 = 10_000;

/// Todos los puertos que necesita el dispositivo.
pub struct Board {
    pub clock: Rc<dyn Clock>,
    pub system: Box<dyn SystemControl>,
    pub wifi: Box<dyn WifiControl>,
    pub portal: Box<dyn PortalBackend>,
    pub http: Box<dyn HttpTransport>,
    pub duplex: Box<dyn DuplexTransport>,
    pub lighting: Box<dyn LightingBackends>,
    pub storage: Box<dyn StorageBackend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Boot,
    LoadIdentity,
    StationConnect,
    Portal,
    RegisterMinimal,
    SessionConnect,
    SessionReady,
    /// Esperando el margen antes de reiniciar (respuesta HTTP en vuelo, etc.).
    Reboot,
    Restarting,
}

pub struct Orchestrator {
    clock: Rc<dyn Clock>,
    system: Box<dyn SystemControl>,
    network: NetworkProvisioner,
    api: CloudApi,
    identity: IdentityStore,
    lights: LightManager,
    session: CloudSession,
    timing: Timing,
    phase: Phase,
    recovery: ErrorRecovery,
    watchdog: FeedSchedule,
    credentials: Option<WifiCredentials>,
    wifi_attempts: u32,
    registration_attempts: u32,
    retry_at: u64,
    last_status_at: u64,
    reboot_at: u64,
    factory_reset_at: Option<u64>,
}

impl Orchestrator {
    /// Abre el storage y arma los componentes. No toca la red todavía.
    pub fn new(board: Board, timing: Timing) -> Result<Self> {
        let Board {
            clock,
            system,
            wifi,
            portal,
            http,
            duplex,
            lighting,
            storage,
        } = board;

        let mut identity = IdentityStore::begin(storage.as_ref(), wifi.mac_address())?;
        let server_url = identity.server_url();
        let mut lights = LightManager::new(lighting, Rc::clone(&clock));
        let session = CloudSession::new(duplex, &server_url, &timing, Rc::clone(&clock));
        session.attach_lights(&mut lights);

        Ok(Self {
            network: NetworkProvisioner::new(wifi, portal, Rc::clone(&clock), &timing),
            api: CloudApi::new(http, &server_url),
            watchdog: FeedSchedule::new(timing.watchdog_feed_interval_ms),
            clock,
            system,
            identity,
            lights,
            session,
            timing,
            phase: Phase::Boot,
            recovery: ErrorRecovery::new(),
            credentials: None,
            wifi_attempts: 0,
            registration_attempts: 0,
            retry_at: 0,
            last_status_at: 0,
            reboot_at: 0,
            factory_reset_at: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn lights(&self) -> &LightManager {
        &self.lights
    }

    pub fn session(&self) -> &CloudSession {
        &self.session
    }

    /// Un paso del loop principal.
    pub fn tick(&mut self) -> Phase {
        let now = self.clock.now_ms();
        self.watchdog.tick(now);

        if let Some(at) = self.factory_reset_at {
            if now >= at {
                self.factory_reset();
                return self.phase;
            }
        }

        match self.phase {
            Phase::Boot => {
                info!("PalPalette firmware v{}", FIRMWARE_VERSION);
                self.phase = Phase::LoadIdentity;
            }
            Phase::LoadIdentity => self.load_identity(),
            Phase::StationConnect => self.station_connect(now),
            Phase::Portal => self.run_portal(now),
            Phase::RegisterMinimal => self.register(now),
            Phase::SessionConnect | Phase::SessionReady => self.run_session(now),
            Phase::Reboot => {
                if now >= self.reboot_at {
                    self.restart();
                }
            }
            Phase::Restarting => {}
        }
        self.phase
    }

    fn telemetry(&self, now: u64) -> Telemetry {
        Telemetry {
            ip_address: self.network.ip_address(),
            rssi: self.network.rssi(),
            free_heap: self.system.free_heap(),
            uptime_ms: now,
        }
    }

    // ─── Identidad ───

    fn load_identity(&mut self) {
        match self.identity.load() {
            Ok(true) => info!("Device ID: {}", self.identity.device_id()),
            Ok(false) => info!(
                "No device ID yet (local pairing code {})",
                self.identity.display_pairing_code()
            ),
            Err(e) => {
                error!("Failed to load identity: {:?}", e);
                self.recovery.report(ErrorCode::StorageFault, "load identity");
            }
        }

        match self.identity.wifi_credentials() {
            Ok(Some(credentials)) => {
                self.credentials = Some(credentials);
                self.wifi_attempts = 0;
                self.retry_at = 0;
                self.phase = Phase::StationConnect;
            }
            Ok(None) => {
                info!("No WiFi credentials stored, starting setup portal");
                self.enter_portal();
            }
            Err(e) => {
                error!("Failed to read WiFi credentials: {:?}", e);
                self.recovery.report(ErrorCode::StorageFault, "read credentials");
                self.enter_portal();
            }
        }
    }

    // ─── WiFi ───

    fn station_connect(&mut self, now: u64) {
        if now < self.retry_at {
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            self.enter_portal();
            return;
        };

        watchdog::feed();
        match self.network.connect_station(&credentials) {
            Ok(()) => {
                self.recovery.clear(ErrorCode::WifiConnectionFailed);
                self.wifi_attempts = 0;
                self.identity.set_network(self.network.ip_address());
                self.registration_attempts = 0;
                self.retry_at = 0;
                self.phase = Phase::RegisterMinimal;
            }
            Err(e) => {
                self.wifi_attempts += 1;
                warn!(
                    "WiFi attempt {}/{} failed: {:?}",
                    self.wifi_attempts, self.timing.wifi_max_attempts, e
                );
                if self.wifi_attempts >= self.timing.wifi_max_attempts {
                    self.recovery.report(ErrorCode::WifiConnectionFailed, "station connect");
                    warn!("WiFi unreachable, starting setup portal");
                    self.enter_portal();
                    return;
                }
                if self.escalate(ErrorCode::WifiConnectionFailed, "station connect") {
                    return;
                }
                self.retry_at = now
                    + exponential_delay(
                        self.timing.wifi_retry_initial_ms,
                        self.wifi_attempts - 1,
                        self.timing.wifi_retry_max_ms,
                    );
            }
        }
    }

    // ─── Portal ───

    fn enter_portal(&mut self) {
        self.retry_at = 0;
        self.phase = Phase::Portal;
    }

    fn run_portal(&mut self, now: u64) {
        let free_heap = self.system.free_heap();
        if self.network.mode() != NetworkMode::AccessPoint {
            if now < self.retry_at {
                return;
            }
            let info = PortalInfo {
                device_id: self.identity.effective_device_id(),
                mac_address: self.identity.identity().mac_address.clone(),
                is_provisioned: self.identity.is_provisioned(),
                server_url: self.identity.server_url(),
                free_heap,
                uptime_ms: now,
            };
            if let Err(e) = self.network.start_ap_mode(info, free_heap) {
                error!("Captive portal failed: {:?}", e);
                if !self.escalate(ErrorCode::PortalFailed, "start portal") {
                    self.retry_at = now + PORTAL_RETRY_MS;
                }
                return;
            }
            self.recovery.clear(ErrorCode::PortalFailed);
        }

        self.network.refresh_portal_info(free_heap, now);
        match self.network.tick() {
            Some(ProvisioningEvent::CredentialsSaved {
                credentials,
                server_url,
            }) => {
                if let Err(e) = self.identity.save_wifi_credentials(&credentials) {
                    error!("Failed to save WiFi credentials: {:?}", e);
                    self.recovery.report(ErrorCode::StorageFault, "save credentials");
                }
                if let Some(url) = server_url {
                    if let Err(e) = self.identity.set_server_url(&url) {
                        error!("Failed to save server URL: {:?}", e);
                    }
                }
                info!("Setup saved, restarting in {} ms", self.timing.save_reboot_grace_ms);
                self.schedule_reboot(now + self.timing.save_reboot_grace_ms);
            }
            Some(ProvisioningEvent::ResetRequested) => {
                self.wipe();
                self.schedule_reboot(now + self.timing.save_reboot_grace_ms);
            }
            Some(ProvisioningEvent::Timeout) => {
                info!("Setup portal expired, restarting");
                self.schedule_reboot(now);
            }
            None => {}
        }
    }

    // ─── Registro ───

    fn register(&mut self, now: u64) {
        if !self.network.is_connected() {
            warn!("WiFi lost before registration");
            self.phase = Phase::StationConnect;
            return;
        }
        if now < self.retry_at {
            return;
        }

        watchdog::feed();
        let mac = self.identity.identity().mac_address.clone();
        match self.api.register_minimal(&mac) {
            Ok(reply) => self.on_registered(reply, now),
            Err(e) => {
                self.registration_attempts += 1;
                warn!(
                    "Registration attempt {}/{} failed: {}",
                    self.registration_attempts, self.timing.registration_max_attempts, e
                );
                if self.registration_attempts >= self.timing.registration_max_attempts {
                    self.recovery.report(e.code(), "registration");
                    warn!("Server unreachable, starting setup portal");
                    self.enter_portal();
                    return;
                }
                if self.escalate(e.code(), "registration") {
                    return;
                }
                self.retry_at = now
                    + exponential_delay(
                        self.timing.registration_retry_ms,
                        self.registration_attempts - 1,
                        self.timing.registration_retry_max_ms,
                    );
            }
        }
    }

    fn on_registered(&mut self, reply: RegistrationReply, now: u64) {
        self.recovery.clear(ErrorCode::RegistrationFailed);
        self.recovery.clear(ErrorCode::HttpFailed);

        // Primero el storage: la config de iluminación del servidor tiene
        // que estar escrita antes de que el driver cargue.
        if let Err(e) = apply_registration(&reply, &mut self.identity) {
            error!("Failed to persist registration: {:?}", e);
            self.recovery.report(ErrorCode::StorageFault, "apply registration");
        }
        if !self.identity.is_provisioned() {
            info!("Pairing code: {}", self.identity.display_pairing_code());
        }

        match self.lights.load(&self.identity) {
            Ok(true) => info!("Lighting system {} loaded", self.lights.system_type()),
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to load lighting system: {:?}", e);
                self.recovery.report(ErrorCode::LightingSubsystemFault, "load driver");
            }
        }

        // El AP tiene que estar abajo antes de abrir el canal dúplex.
        self.network.stop_ap_mode();
        self.session.connect();
        self.phase = Phase::SessionConnect;
        self.last_status_at = now;

        let telemetry = self.telemetry(now);
        match self.api.register_full(&self.identity, &telemetry) {
            Ok(_) => debug!("Full registration accepted"),
            Err(e) => warn!("Full registration failed: {}", e),
        }
    }

    // ─── Sesión ───

    fn run_session(&mut self, now: u64) {
        if !self.network.is_connected() {
            warn!("WiFi connection lost");
            self.session.disconnect();
            self.identity.set_online(false);
            self.wifi_attempts = 0;
            self.retry_at = 0;
            self.phase = Phase::StationConnect;
            return;
        }

        let was_ready = self.session.is_ready();
        let telemetry = self.telemetry(now);
        let signals = {
            let mut ctx = SessionContext {
                identity: &mut self.identity,
                lights: &mut self.lights,
                telemetry: &telemetry,
            };
            self.session.tick(&mut ctx)
        };
        for signal in signals {
            self.handle_signal(signal, now);
        }

        let ready = self.session.is_ready();
        if ready && !was_ready {
            info!("Cloud session ready");
            self.recovery.clear(ErrorCode::SessionConnectionFailed);
            self.recovery.mark_healthy();
        }
        if was_ready && !ready && self.escalate(ErrorCode::SessionConnectionFailed, "session dropped") {
            return;
        }
        if !matches!(self.phase, Phase::SessionConnect | Phase::SessionReady) {
            return;
        }
        self.phase = if ready {
            Phase::SessionReady
        } else {
            Phase::SessionConnect
        };

        if ready && now.saturating_sub(self.last_status_at) >= self.timing.status_update_interval_ms {
            self.last_status_at = now;
            let mut ctx = SessionContext {
                identity: &mut self.identity,
                lights: &mut self.lights,
                telemetry: &telemetry,
            };
            self.session.send_device_status(&mut ctx);
            if let Err(e) = self.api.update_status(&self.identity, &telemetry) {
                warn!("HTTP status update failed: {:?}", e);
            }
        }
    }

    fn handle_signal(&mut self, signal: SessionSignal, now: u64) {
        match signal {
            SessionSignal::Claimed => {
                if self.lights.requires_user_authentication() {
                    self.retry_lighting_authentication();
                }
            }
            SessionSignal::LightingConfigured => {
                if let Some(config) = self.lights.config() {
                    let device_id = self.identity.device_id().to_string();
                    if let Err(e) = self.api.push_lighting_config(&device_id, &config) {
                        warn!("Lighting config push failed: {:?}", e);
                    }
                }
            }
            SessionSignal::FactoryResetRequested => {
                self.factory_reset_at = Some(now + self.timing.factory_reset_grace_ms);
            }
        }
    }

    /// Vuelve a autenticar el driver; solo tiene sentido ya reclamado.
    pub fn retry_lighting_authentication(&mut self) {
        if !self.identity.is_provisioned() {
            debug!("Device not claimed yet, skipping lighting authentication");
            return;
        }
        info!("Authenticating lighting system {}", self.lights.system_type());
        if let Err(e) = self.lights.authenticate(&mut self.identity) {
            warn!("Lighting authentication failed: {:?}", e);
            self.recovery.report(ErrorCode::LightingSubsystemFault, "authenticate");
        }
    }

    // ─── Recuperación ───

    /// Reporta la falla y aplica el escalón. Devuelve `true` si el
    /// dispositivo va a reiniciar y el llamador no debe seguir.
    fn escalate(&mut self, code: ErrorCode, context: &str) -> bool {
        match self.recovery.report(code, context) {
            RecoveryStrategy::RetryOperation => false,
            RecoveryStrategy::RestartComponent => {
                self.restart_component(code);
                false
            }
            RecoveryStrategy::SoftRestart | RecoveryStrategy::HardRestart => {
                self.schedule_reboot(self.clock.now_ms());
                true
            }
            RecoveryStrategy::FactoryReset => {
                self.wipe();
                self.schedule_reboot(self.clock.now_ms());
                true
            }
        }
    }

    fn restart_component(&mut self, code: ErrorCode) {
        match code {
            ErrorCode::SessionConnectionFailed => {
                info!("Restarting cloud session");
                self.session.disconnect();
                self.session.connect();
            }
            ErrorCode::PortalFailed => self.network.stop_ap_mode(),
            ErrorCode::LightingSubsystemFault => {
                if let Err(e) = self.lights.load(&self.identity) {
                    warn!("Lighting reload failed: {:?}", e);
                }
            }
            _ => debug!("No component restart for {}", code),
        }
    }

    fn schedule_reboot(&mut self, at: u64) {
        self.reboot_at = at;
        self.phase = Phase::Reboot;
    }

    fn restart(&mut self) {
        info!("Restarting device");
        self.session.disconnect();
        self.network.stop_ap_mode();
        self.phase = Phase::Restarting;
        self.system.restart();
    }

    /// Borra identidad e iluminación. Lo próximo es reiniciar.
    fn wipe(&mut self) {
        if let Err(e) = self.lights.reset(&mut self.identity) {
            error!("Failed to clear lighting storage: {:?}", e);
        }
        if let Err(e) = self.identity.reset() {
            error!("Failed to clear identity storage: {:?}", e);
        }
    }

    fn factory_reset(&mut self) {
        warn!("Performing factory reset");
        self.factory_reset_at = None;
        self.wipe();
        self.restart();
    }
}
