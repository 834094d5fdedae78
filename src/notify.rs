//! §4.6 notification queue: FIFO HTTP GETs to a loopback control endpoint,
//! gated by `active` (a request is outstanding) and `holdoff` (the
//! dispatcher is mid-sequence on a multi-part synthesized response).
//!
//! Grounded on `original_source/zwint/zwint.c`'s `send_http`/
//! `DequeueHTTPData`/`write_http_data`/`repopen_http_fd`: GET lines are
//! rendered fully at enqueue time (matching the C source's immediate
//! `snprintf` into the queued buffer), and a failed first write gets
//! exactly one reconnect-and-retry before the notification is dropped.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::config::HttpConfig;

const SERVICE_ID: &str = "urn:gengen_mcv-org:serviceId:ZWaveMonitor1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Monitor,
    Intercept,
    Timeout,
    Error,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Monitor => "Monitor",
            Event::Intercept => "Intercept",
            Event::Timeout => "Timeout",
            Event::Error => "Error",
        }
    }
}

/// A single reportable event, already decoupled from the `Captures`/regex
/// lifetimes that produced it.
pub struct Notification {
    pub device_num: i64,
    pub key: String,
    pub event: Event,
    pub silent: bool,
    /// Group 0..=9, `None` where the group didn't participate (or there
    /// is no match at all, e.g. `Timeout`).
    pub captures: Option<[Option<String>; 10]>,
    pub message: Option<String>,
}

fn percent_encode_spaces(s: &str) -> String {
    s.replace(' ', "%20")
}

fn render_get(n: &Notification, config: &HttpConfig) -> Vec<u8> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut path = format!(
        "/data_request?id=action&DeviceNum={}&serviceId={}&action={}&key={}&time={}.{:06}",
        n.device_num,
        SERVICE_ID,
        n.event.as_str(),
        percent_encode_spaces(&n.key),
        now.as_secs(),
        now.subsec_micros(),
    );
    if let Some(captures) = &n.captures {
        if captures[1].is_some() {
            for (i, c) in captures.iter().enumerate().skip(1) {
                if let Some(c) = c {
                    path.push_str(&format!("&C{i}={}", percent_encode_spaces(c)));
                }
            }
        } else if let Some(c0) = &captures[0] {
            path.push_str(&format!("&C0={}", percent_encode_spaces(c0)));
        }
    }
    if let Some(msg) = &n.message {
        path.push_str(&format!("&ErrorMessage={}", percent_encode_spaces(msg)));
    }
    format!("GET {path} HTTP/1.1\r\nHost: {}\r\n\r\n", config.host).into_bytes()
}

/// The ordered HTTP sink, owning its lazily-(re)connected socket.
pub struct NotifyQueue {
    config: HttpConfig,
    queue: VecDeque<Vec<u8>>,
    socket: Option<TcpStream>,
    active: bool,
    holdoff: bool,
}

impl NotifyQueue {
    pub fn new(config: HttpConfig) -> Self {
        NotifyQueue {
            config,
            queue: VecDeque::new(),
            socket: None,
            active: false,
            holdoff: false,
        }
    }

    /// Silent rules (`key` starting `*`) never reach the queue.
    pub fn enqueue(&mut self, n: &Notification) {
        if n.silent {
            return;
        }
        self.queue.push_back(render_get(n, &self.config));
    }

    pub fn set_holdoff(&mut self, holdoff: bool) {
        self.holdoff = holdoff;
    }

    pub fn holdoff(&self) -> bool {
        self.holdoff
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Attempt to dispatch the head of the queue. No-op unless both gates
    /// are clear and there is something to send.
    pub async fn pump(&mut self) {
        if self.active || self.holdoff || self.queue.is_empty() {
            return;
        }
        let Some(buf) = self.queue.front().cloned() else {
            return;
        };
        self.active = true;

        if self.socket.is_none() {
            match TcpStream::connect((self.config.host.as_str(), self.config.port)).await {
                Ok(s) => self.socket = Some(s),
                Err(e) => {
                    warn!(error = %e, "notification connect failed");
                    self.active = false;
                    self.queue.pop_front();
                    return;
                }
            }
        }

        if self.write_once(&buf).await.is_err() {
            warn!("notification write failed, retrying once");
            self.socket = None;
            match TcpStream::connect((self.config.host.as_str(), self.config.port)).await {
                Ok(s) => {
                    self.socket = Some(s);
                    if self.write_once(&buf).await.is_err() {
                        warn!("notification retry failed, dropping request");
                        self.socket = None;
                        self.active = false;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "notification reconnect failed");
                    self.active = false;
                }
            }
        }
        self.queue.pop_front();
    }

    async fn write_once(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.socket.as_mut().unwrap().write_all(buf).await
    }

    /// Drain one readiness event's worth of the in-flight response and
    /// discard it (fire-and-forget, §4.6) — then, regardless of whether
    /// that read hit EOF, returned data, or failed, close the socket and
    /// clear `active` so the caller's next `pump` moves on to the rest of
    /// the queue (§4.7: "in all cases close and clear active, then pump").
    pub async fn on_readable(&mut self) {
        let Some(s) = self.socket.as_mut() else { return };
        let mut buf = [0u8; 4096];
        if let Err(e) = s.read(&mut buf).await {
            warn!(error = %e, "notification socket read error");
        }
        self.socket = None;
        self.active = false;
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }
}
