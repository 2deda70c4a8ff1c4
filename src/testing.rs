//! Fakes en memoria de todos los puertos, para los tests del host.
//!
//! Cada fake es `Clone` y comparte su estado: el test se queda con una
//! copia para inspeccionar y le pasa otra (en un `Box`) al componente.

use anyhow::{bail, Result};
use embedded_svc::http::Method;
use serde_json::Value;
use smart_leds::RGB8;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::identity::IdentityStore;
use crate::lighting::LightingBackends;
use crate::platform::{
    AccessPointInfo, Clock, DiscoveredService, DuplexTransport, HttpResponse, HttpTransport, LedStrip,
    PortalBackend, ServiceDiscovery, SystemControl, TransportEvent, WifiControl,
};
use crate::provisioning::{PortalContext, PortalResponse};
use crate::storage::{KvStore, StorageBackend};

pub const TEST_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xAB, 0xCD, 0xEF];

/// Store abierto y cargado sobre `storage`.
pub fn identity_store(storage: &MemoryStorage) -> IdentityStore {
    let mut store = IdentityStore::begin(storage, TEST_MAC).unwrap();
    store.load().unwrap();
    store
}

// ─── Reloj ───

#[derive(Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

// ─── Storage ───

#[derive(Default)]
struct StorageState {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    writes: usize,
    fail_writes: bool,
}

/// NVS en memoria. Guarda todo como texto, igual que lo vería un dump.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Rc<RefCell<StorageState>>,
}

impl MemoryStorage {
    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        self.state
            .borrow()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key).cloned())
    }

    pub fn set(&self, namespace: &str, key: &str, value: &str) {
        self.state
            .borrow_mut()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn namespace_snapshot(&self, namespace: &str) -> BTreeMap<String, String> {
        self.state
            .borrow()
            .namespaces
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.state.borrow().writes
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }
}

impl StorageBackend for MemoryStorage {
    fn open(&self, namespace: &str) -> Result<Box<dyn KvStore>> {
        Ok(Box::new(MemoryNamespace {
            state: Rc::clone(&self.state),
            namespace: namespace.to_string(),
        }))
    }
}

struct MemoryNamespace {
    state: Rc<RefCell<StorageState>>,
    namespace: String,
}

impl MemoryNamespace {
    fn read(&self, key: &str) -> Option<String> {
        self.state
            .borrow()
            .namespaces
            .get(&self.namespace)
            .and_then(|ns| ns.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            bail!("simulated NVS write failure on {}/{}", self.namespace, key);
        }
        state.writes += 1;
        state
            .namespaces
            .entry(self.namespace.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}

impl KvStore for MemoryNamespace {
    fn get_str(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.write(key, value.to_string())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.read(key).map(|v| v == "true"))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.write(key, value.to_string())
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>> {
        match self.read(key) {
            Some(v) => Ok(Some(v.parse()?)),
            None => Ok(None),
        }
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<()> {
        self.write(key, value.to_string())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            bail!("simulated NVS remove failure on {}/{}", self.namespace, key);
        }
        let existed = state
            .namespaces
            .get_mut(&self.namespace)
            .and_then(|ns| ns.remove(key))
            .is_some();
        if existed {
            state.writes += 1;
        }
        Ok(existed)
    }
}

// ─── HTTP ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

#[derive(Default)]
struct HttpState {
    routes: HashMap<(String, String), VecDeque<HttpResponse>>,
    requests: Vec<RecordedRequest>,
}

/// Respuestas por (método, URL). Se consumen en orden y la última
/// queda fija; una ruta sin respuesta es un error de transporte.
#[derive(Clone, Default)]
pub struct ScriptedHttp {
    state: Rc<RefCell<HttpState>>,
}

fn method_name(method: Method) -> String {
    format!("{:?}", method).to_uppercase()
}

impl ScriptedHttp {
    pub fn respond_json(&self, method: &str, url: &str, status: u16, body: &str) {
        self.state
            .borrow_mut()
            .routes
            .entry((method.to_string(), url.to_string()))
            .or_default()
            .push_back(HttpResponse {
                status,
                body: body.to_string(),
            });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn requests_to(&self, url: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    pub fn last_body(&self, url: &str) -> Option<String> {
        self.state
            .borrow()
            .requests
            .iter()
            .rev()
            .find(|r| r.url == url)
            .and_then(|r| r.body.clone())
    }
}

impl HttpTransport for ScriptedHttp {
    fn request(&mut self, method: Method, url: &str, body: Option<&str>) -> Result<HttpResponse> {
        let method = method_name(method);
        let mut state = self.state.borrow_mut();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            url: url.to_string(),
            body: body.map(str::to_string),
        });
        let Some(queue) = state.routes.get_mut(&(method.clone(), url.to_string())) else {
            bail!("connection refused: {} {}", method, url);
        };
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match response {
            Some(response) => Ok(response),
            None => bail!("connection refused: {} {}", method, url),
        }
    }
}

// ─── Canal dúplex ───

#[derive(Default)]
struct DuplexState {
    inbox: VecDeque<TransportEvent>,
    sent: Vec<String>,
    open: bool,
    opens: usize,
    closes: usize,
    pings: usize,
    refuse: bool,
    hold_open: bool,
}

/// WebSocket falso: `open` encola `Opened` salvo que se pida otra cosa.
#[derive(Clone, Default)]
pub struct FakeDuplex {
    state: Rc<RefCell<DuplexState>>,
}

impl FakeDuplex {
    pub fn push(&self, event: TransportEvent) {
        self.state.borrow_mut().inbox.push_back(event);
    }

    pub fn push_text(&self, text: &str) {
        self.push(TransportEvent::Text(text.to_string()));
    }

    pub fn sent_events(&self) -> Vec<Value> {
        self.state
            .borrow()
            .sent
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    pub fn sent_event_names(&self) -> Vec<String> {
        self.sent_events()
            .iter()
            .map(|m| m["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.borrow_mut().sent.clear();
    }

    pub fn opens(&self) -> usize {
        self.state.borrow().opens
    }

    pub fn closes(&self) -> usize {
        self.state.borrow().closes
    }

    pub fn pings(&self) -> usize {
        self.state.borrow().pings
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    /// `open` falla en el acto (servidor caído).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.borrow_mut().refuse = refuse;
    }

    /// `open` no completa nunca (handshake colgado).
    pub fn hold_open(&self, hold: bool) {
        self.state.borrow_mut().hold_open = hold;
    }
}

impl DuplexTransport for FakeDuplex {
    fn open(&mut self, url: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.opens += 1;
        if state.refuse {
            bail!("connection refused: {}", url);
        }
        if !state.hold_open {
            state.open = true;
            state.inbox.push_back(TransportEvent::Opened);
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.state.borrow_mut().inbox.pop_front()
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.open {
            bail!("socket is closed");
        }
        state.sent.push(text.to_string());
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        self.state.borrow_mut().pings += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        state.open = false;
        state.closes += 1;
    }
}

// ─── Iluminación ───

#[derive(Default)]
struct StripState {
    attachments: Vec<(u8, usize)>,
    frames: Vec<Vec<RGB8>>,
    fail_attach: bool,
}

#[derive(Clone, Default)]
pub struct RecordingStrip {
    state: Rc<RefCell<StripState>>,
}

impl RecordingStrip {
    pub fn attachments(&self) -> Vec<(u8, usize)> {
        self.state.borrow().attachments.clone()
    }

    pub fn last_frame(&self) -> Option<Vec<RGB8>> {
        self.state.borrow().frames.last().cloned()
    }

    pub fn fail_attach(&self, fail: bool) {
        self.state.borrow_mut().fail_attach = fail;
    }
}

impl LedStrip for RecordingStrip {
    fn attach(&mut self, pin: u8, led_count: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_attach {
            bail!("GPIO {} unavailable", pin);
        }
        state.attachments.push((pin, led_count));
        Ok(())
    }

    fn write(&mut self, pixels: &[RGB8]) -> Result<()> {
        self.state.borrow_mut().frames.push(pixels.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct DiscoveryState {
    answer: Option<DiscoveredService>,
    queries: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct FakeDiscovery {
    state: Rc<RefCell<DiscoveryState>>,
}

impl FakeDiscovery {
    pub fn answer(&self, service: DiscoveredService) {
        self.state.borrow_mut().answer = Some(service);
    }

    pub fn queries(&self) -> Vec<(String, String)> {
        self.state.borrow().queries.clone()
    }
}

impl ServiceDiscovery for FakeDiscovery {
    fn discover(
        &mut self,
        service: &str,
        protocol: &str,
        _timeout: Duration,
    ) -> Result<Option<DiscoveredService>> {
        let mut state = self.state.borrow_mut();
        state.queries.push((service.to_string(), protocol.to_string()));
        Ok(state.answer.clone())
    }
}

#[derive(Clone, Default)]
pub struct FakeBackends {
    pub http: ScriptedHttp,
    pub strip: RecordingStrip,
    pub discovery: FakeDiscovery,
}

impl LightingBackends for FakeBackends {
    fn http(&mut self) -> Box<dyn HttpTransport> {
        Box::new(self.http.clone())
    }

    fn led_strip(&mut self) -> Box<dyn LedStrip> {
        Box::new(self.strip.clone())
    }

    fn discovery(&mut self) -> Box<dyn ServiceDiscovery> {
        Box::new(self.discovery.clone())
    }
}

// ─── WiFi ───

struct WifiState {
    known: Vec<(String, String)>,
    scan: Vec<AccessPointInfo>,
    connected: bool,
    ap_running: bool,
    connect_attempts: usize,
    scans: usize,
}

impl Default for WifiState {
    fn default() -> Self {
        Self {
            known: Vec::new(),
            scan: vec![AccessPointInfo {
                ssid: "HomeNet".to_string(),
                rssi: -58,
                encrypted: true,
            }],
            connected: false,
            ap_running: false,
            connect_attempts: 0,
            scans: 0,
        }
    }
}

/// Radio falso: conecta solo a las redes registradas con `known_network`.
#[derive(Clone, Default)]
pub struct FakeWifi {
    state: Rc<RefCell<WifiState>>,
}

impl FakeWifi {
    pub fn known_network(&self, ssid: &str, password: &str) {
        self.state
            .borrow_mut()
            .known
            .push((ssid.to_string(), password.to_string()));
    }

    pub fn set_scan(&self, networks: Vec<AccessPointInfo>) {
        self.state.borrow_mut().scan = networks;
    }

    /// El router se cae.
    pub fn drop_connection(&self) {
        self.state.borrow_mut().connected = false;
    }

    pub fn ap_running(&self) -> bool {
        self.state.borrow().ap_running
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.borrow().connect_attempts
    }

    pub fn scans(&self) -> usize {
        self.state.borrow().scans
    }
}

impl WifiControl for FakeWifi {
    fn mac_address(&self) -> [u8; 6] {
        TEST_MAC
    }

    fn connect_station(&mut self, ssid: &str, password: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.connect_attempts += 1;
        let known = state.known.iter().any(|(s, p)| s == ssid && p == password);
        if !known {
            bail!("association with '{}' timed out", ssid);
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect_station(&mut self) -> Result<()> {
        self.state.borrow_mut().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn ip_address(&self) -> Option<Ipv4Addr> {
        self.is_connected().then_some(Ipv4Addr::new(192, 168, 1, 50))
    }

    fn rssi(&self) -> Option<i8> {
        self.is_connected().then_some(-58)
    }

    fn start_access_point(&mut self, _ssid: &str, _password: &str) -> Result<Ipv4Addr> {
        self.state.borrow_mut().ap_running = true;
        Ok(Ipv4Addr::new(192, 168, 4, 1))
    }

    fn stop_access_point(&mut self) -> Result<()> {
        self.state.borrow_mut().ap_running = false;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<AccessPointInfo>> {
        let mut state = self.state.borrow_mut();
        state.scans += 1;
        Ok(state.scan.clone())
    }
}

// ─── Portal ───

#[derive(Default)]
struct PortalState {
    context: Option<Arc<PortalContext>>,
    starts: usize,
    stops: usize,
    polls: usize,
}

/// Servidor del portal falso; `request` hace de navegador.
#[derive(Clone, Default)]
pub struct FakePortal {
    state: Rc<RefCell<PortalState>>,
}

impl FakePortal {
    pub fn request(&self, method: Method, uri: &str, body: &[u8]) -> PortalResponse {
        let context = self.state.borrow().context.clone();
        match context {
            Some(context) => context.handle(method, uri, body),
            None => panic!("portal is not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().context.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.borrow().starts
    }

    pub fn stops(&self) -> usize {
        self.state.borrow().stops
    }

    pub fn polls(&self) -> usize {
        self.state.borrow().polls
    }
}

impl PortalBackend for FakePortal {
    fn start(&mut self, _ap_address: Ipv4Addr, context: Arc<PortalContext>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.starts += 1;
        state.context = Some(context);
        Ok(())
    }

    fn poll(&mut self) {
        self.state.borrow_mut().polls += 1;
    }

    fn stop(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.context.take().is_some() {
            state.stops += 1;
        }
    }

    fn is_running(&self) -> bool {
        FakePortal::is_running(self)
    }
}

// ─── Sistema ───

struct SystemState {
    restarts: usize,
    free_heap: u32,
}

#[derive(Clone)]
pub struct FakeSystem {
    state: Rc<RefCell<SystemState>>,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self {
            state: Rc::new(RefCell::new(SystemState {
                restarts: 0,
                free_heap: 180_000,
            })),
        }
    }
}

impl FakeSystem {
    pub fn restarts(&self) -> usize {
        self.state.borrow().restarts
    }

    pub fn set_free_heap(&self, bytes: u32) {
        self.state.borrow_mut().free_heap = bytes;
    }
}

impl SystemControl for FakeSystem {
    fn restart(&mut self) {
        self.state.borrow_mut().restarts += 1;
    }

    fn free_heap(&self) -> u32 {
        self.state.borrow().free_heap
    }
}
