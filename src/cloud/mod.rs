//! Todo lo que habla con el servidor PalPalette: API REST de registro,
//! el protocolo de eventos JSON y la sesión WebSocket con su backoff.

pub mod api;
pub mod backoff;
pub mod protocol;
pub mod session;

pub use api::{apply_registration, api_base_url, CloudApi, RegistrationError, RegistrationReply};
pub use backoff::Backoff;
pub use protocol::{InboundEvent, OutboundMessage};
pub use session::{CloudSession, SessionContext, SessionSignal, SessionState};
