// ─── Servidor del portal cautivo ───
//
// Un handler comodín por método: todo request va a `PortalContext::handle`,
// que decide la ruta. El DNS comodín se atiende desde `poll`.

use anyhow::Result;
use embedded_svc::http::{Headers, Method};
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::server::{Configuration as HttpConfig, EspHttpServer};
use log::{info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::platform::PortalBackend;
use crate::provisioning::dns::DnsResponder;
use crate::provisioning::portal::MAX_FORM_BODY;
use crate::provisioning::PortalContext;

#[derive(Default)]
pub struct EspPortal {
    server: Option<EspHttpServer<'static>>,
    dns: Option<DnsResponder>,
}

impl PortalBackend for EspPortal {
    fn start(&mut self, ap_address: Ipv4Addr, context: Arc<PortalContext>) -> Result<()> {
        self.stop();

        let mut server = EspHttpServer::new(&HttpConfig {
            stack_size: 10 * 1024,
            uri_match_wildcard: true,
            ..Default::default()
        })?;

        for method in [Method::Get, Method::Post] {
            // `move` transfiere al closure su propio Arc: el handler corre
            // en el thread del servidor y vive más que esta función.
            let context = Arc::clone(&context);
            server.fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
                let uri = req.uri().to_string();

                // Un byte de más alcanza para que el contexto detecte el exceso.
                let len = (req.content_len().unwrap_or(0) as usize).min(MAX_FORM_BODY + 1);
                let mut body = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    let read = req.read(&mut body[filled..])?;
                    if read == 0 {
                        break;
                    }
                    filled += read;
                }
                body.truncate(filled);

                let response = context.handle(method, &uri, &body);
                req.into_response(response.status, None, &[("Content-Type", response.content_type)])?
                    .write_all(response.body.as_bytes())?;
                Ok(())
            })?;
        }

        let dns = DnsResponder::bind(ap_address)?;
        info!("Captive portal HTTP server listening on {}:80", ap_address);
        self.server = Some(server);
        self.dns = Some(dns);
        Ok(())
    }

    fn poll(&mut self) {
        if let Some(dns) = self.dns.as_mut() {
            if let Err(e) = dns.poll() {
                warn!("Captive DNS error: {:?}", e);
            }
        }
    }

    fn stop(&mut self) {
        // Drop del servidor = se liberan el socket y la memoria de los handlers.
        if self.server.take().is_some() {
            info!("Captive portal HTTP server stopped");
        }
        self.dns = None;
    }

    fn is_running(&self) -> bool {
        self.server.is_some()
    }
}
