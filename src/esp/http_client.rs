// ─── Cliente HTTP(S) ───

use anyhow::{anyhow, bail, Result};
use embedded_svc::http::client::Client;
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use log::debug;
use std::time::Duration;

use crate::platform::{HttpResponse, HttpTransport};

/// Respuestas más grandes que esto no son de nuestra API.
const MAX_RESPONSE_BODY: usize = 16 * 1024;

/// Una conexión nueva por request; los certificados salen del bundle de ESP-IDF.
pub struct EspHttpTransport {
    timeout: Duration,
}

impl EspHttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for EspHttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HttpTransport for EspHttpTransport {
    fn request(&mut self, method: Method, url: &str, body: Option<&str>) -> Result<HttpResponse> {
        let config = Configuration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = Client::wrap(EspHttpConnection::new(&config)?);

        let length = body.map(str::len).unwrap_or(0).to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", length.as_str()),
        ];
        let mut request = client.request(method, url, &headers)?;
        if let Some(body) = body {
            request.write_all(body.as_bytes())?;
            request.flush()?;
        }
        let mut response = request.submit().map_err(|e| anyhow!("{:?}", e))?;
        let status = response.status();

        let mut bytes = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{:?}", e))?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
            if bytes.len() > MAX_RESPONSE_BODY {
                bail!("response from {} exceeds {} bytes", url, MAX_RESPONSE_BODY);
            }
        }

        debug!("{:?} {} -> HTTP {} ({} bytes)", method, url, status, bytes.len());
        Ok(HttpResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
