// ─── DNS comodín del portal cautivo ───
//
// Toda consulta A se responde con la IP del AP: así el sistema operativo
// del teléfono detecta el portal y abre el formulario solo.

use anyhow::{Context, Result};
use edge_mdns::domain::base::iana::{Class, Opcode, Rcode, Rtype};
use edge_mdns::domain::base::message_builder::StaticCompressor;
use edge_mdns::domain::base::{Message, MessageBuilder, Record, Ttl};
use edge_mdns::domain::rdata::A;
use log::{debug, info};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

pub const DNS_PORT: u16 = 53;

/// TTL corto: al salir del modo AP los clientes vuelven a resolver.
const ANSWER_TTL_SECS: u32 = 60;

/// Un datagrama DNS clásico nunca pasa de 512 bytes.
type Packet = heapless::Vec<u8, 512>;

/// Socket UDP no bloqueante; se atiende desde el loop principal.
pub struct DnsResponder {
    socket: UdpSocket,
    answer: Ipv4Addr,
}

impl DnsResponder {
    pub fn bind(answer: Ipv4Addr) -> Result<Self> {
        Self::bind_to(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DNS_PORT)), answer)
    }

    pub fn bind_to(address: SocketAddr, answer: Ipv4Addr) -> Result<Self> {
        let socket = UdpSocket::bind(address).context("failed to bind DNS socket")?;
        socket
            .set_nonblocking(true)
            .context("failed to make DNS socket non-blocking")?;
        info!("Captive DNS answering {} on {}", answer, address);
        Ok(Self { socket, answer })
    }

    /// Responde todo lo pendiente. Devuelve cuántas respuestas mandó.
    pub fn poll(&mut self) -> Result<usize> {
        let mut buf = [0u8; 512];
        let mut answered = 0;
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(answered),
                Err(e) => return Err(e).context("DNS receive failed"),
            };
            if let Some(response) = build_response(&buf[..len], self.answer) {
                self.socket
                    .send_to(&response, peer)
                    .context("DNS send failed")?;
                answered += 1;
            } else {
                debug!("Ignoring malformed DNS packet from {}", peer);
            }
        }
    }
}

/// Arma la respuesta a una consulta. `None` si el paquete no es una
/// consulta estándar con al menos una pregunta legible.
pub fn build_response(query: &[u8], answer: Ipv4Addr) -> Option<Vec<u8>> {
    let request = Message::from_octets(query).ok()?;
    let header = request.header();
    if header.qr() || header.opcode() != Opcode::QUERY || request.header_counts().qdcount() == 0 {
        return None;
    }
    // Solo la primera pregunta.
    let question = request.first_question()?;

    // El compresor convierte el nombre de la respuesta en un puntero a la pregunta.
    let mut builder = MessageBuilder::from_target(StaticCompressor::new(Packet::new())).ok()?;
    let reply = builder.header_mut();
    reply.set_id(header.id());
    reply.set_qr(true);
    reply.set_opcode(Opcode::QUERY);
    reply.set_aa(true);
    reply.set_rd(header.rd());
    reply.set_ra(true);
    reply.set_rcode(Rcode::NOERROR);

    let mut questions = builder.question();
    questions.push(question.clone()).ok()?;
    let mut answers = questions.answer();
    if matches!(question.qtype(), Rtype::A | Rtype::ANY) && question.qclass() == Class::IN {
        let record = Record::new(
            question.qname(),
            Class::IN,
            Ttl::from_secs(ANSWER_TTL_SECS),
            A::new(answer.octets().into()),
        );
        answers.push(record).ok()?;
    }
    Some(answers.finish().into_target().to_vec())
}
