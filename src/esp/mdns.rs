// ─── Descubrimiento mDNS ───

use anyhow::{Context, Result};
use esp_idf_svc::mdns::{EspMdns, Interface, Protocol, QueryResult};
use log::{debug, info};
use std::net::IpAddr;
use std::time::Duration;

use crate::platform::{DiscoveredService, ServiceDiscovery};

const MAX_RESULTS: usize = 4;

/// El servicio mDNS se toma solo durante la consulta y se libera al terminar.
#[derive(Default)]
pub struct MdnsDiscovery;

fn empty_result() -> QueryResult {
    QueryResult {
        instance_name: None,
        hostname: None,
        port: 0,
        txt: Vec::new(),
        addr: Vec::new(),
        interface: Interface::STA,
        ip_protocol: Protocol::V4,
    }
}

impl ServiceDiscovery for MdnsDiscovery {
    fn discover(
        &mut self,
        service: &str,
        protocol: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredService>> {
        let mdns = EspMdns::take().context("mDNS service unavailable")?;
        let mut results: [QueryResult; MAX_RESULTS] = std::array::from_fn(|_| empty_result());

        debug!("mDNS PTR query {}.{}", service, protocol);
        let found = mdns.query_ptr(service, protocol, timeout, MAX_RESULTS, &mut results)?;
        info!("mDNS found {} {} instances", found, service);

        // Primera instancia con IPv4; si no hay, el hostname.
        let service = results[..found.min(MAX_RESULTS)].iter().find_map(|result| {
            let host = result
                .addr
                .iter()
                .find_map(|addr| match addr {
                    IpAddr::V4(ip) => Some(ip.to_string()),
                    IpAddr::V6(_) => None,
                })
                .or_else(|| result.hostname.as_ref().map(|name| format!("{}.local", name)))?;
            Some(DiscoveredService {
                host,
                port: result.port,
            })
        });
        Ok(service)
    }
}
