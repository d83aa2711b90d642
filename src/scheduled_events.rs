//! Client for the scheduled events metadata endpoint discovered over DHCP.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const API_VERSION: &str = "2017-03-01";

/// Default endpoint address for machines inside a VNET, tried before any
/// persisted value.
pub const DEFAULT_ENDPOINT: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

const ENDPOINT_PORT: u16 = 80;
const ENDPOINT_PATH: &str = "/metadata/scheduledevents";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("failed to reach scheduled events endpoint {address}: {source}")]
    Network {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("scheduled events endpoint returned status {0}")]
    Status(u16),
    #[error("failed to decode scheduled events document: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The document served by the endpoint. The incarnation is carried opaquely
/// and echoed back on approval.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduledEventsDocument {
    pub document_incarnation: serde_json::Value,
    pub events: Vec<ScheduledEvent>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduledEvent {
    pub event_id: String,
    #[serde(default)]
    pub event_status: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub not_before: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartRequests {
    document_incarnation: serde_json::Value,
    start_requests: Vec<StartRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartRequest {
    event_id: String,
}

pub struct ScheduledEventsClient {
    endpoint: Ipv4Addr,
    timeout: Duration,
}

impl ScheduledEventsClient {
    pub fn new(endpoint: Ipv4Addr) -> Self {
        Self {
            endpoint,
            timeout: HTTP_TIMEOUT,
        }
    }

    pub fn address(&self) -> String {
        format!(
            "http://{}{}?api-version={}",
            self.endpoint, ENDPOINT_PATH, API_VERSION
        )
    }

    /// Fetch the current scheduled events document.
    pub fn get_document(&self) -> Result<ScheduledEventsDocument, EventsError> {
        let body = self.request("GET", None)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Approve events so the platform can start them early. Echoes the
    /// document incarnation the events were read under.
    pub fn start_events(
        &self,
        incarnation: serde_json::Value,
        event_ids: &[String],
    ) -> Result<(), EventsError> {
        let payload = StartRequests {
            document_incarnation: incarnation,
            start_requests: event_ids
                .iter()
                .map(|id| StartRequest {
                    event_id: id.clone(),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&payload)?;
        self.request("POST", Some(&body))?;
        Ok(())
    }

    /// Whether the endpoint answers with a well-formed events document.
    pub fn probe(&self) -> bool {
        self.get_document().is_ok()
    }

    fn request(&self, method: &str, body: Option<&[u8]>) -> Result<Vec<u8>, EventsError> {
        let network = |source| EventsError::Network {
            address: self.address(),
            source,
        };

        let addr = SocketAddr::from((self.endpoint, ENDPOINT_PORT));
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(network)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(network)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(network)?;

        let mut request = format!(
            "{method} {ENDPOINT_PATH}?api-version={API_VERSION} HTTP/1.1\r\n\
             Host: {}\r\n\
             Metadata: true\r\n\
             Connection: close\r\n",
            self.endpoint
        );
        if let Some(body) = body {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");

        debug!("{method} {}", self.address());
        stream.write_all(request.as_bytes()).map_err(network)?;
        if let Some(body) = body {
            stream.write_all(body).map_err(network)?;
        }

        let (status, body) = read_response(&mut stream).map_err(network)?;
        if !(200..300).contains(&status) {
            return Err(EventsError::Status(status));
        }
        Ok(body)
    }
}

/// Read an HTTP/1.1 response: status line, headers, then a body sized by
/// Content-Length or bounded by connection close.
fn read_response<R: Read>(stream: &mut R) -> io::Result<(u16, Vec<u8>)> {
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid http status line"))?;

    let mut content_length: Option<usize> = None;
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let body = match content_length {
        Some(length) => {
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body)?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            body
        }
    };

    Ok((status, body))
}
