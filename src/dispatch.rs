//! §4.4 dispatcher: per-direction ack accounting, rule scan/fire, and
//! default passthrough, tying `frame.rs` + `rule.rs` + `template.rs`
//! together.
//!
//! Grounded on `original_source/zwint/zwint.c`'s `process_zwave`: the
//! byte-level ack-swallow check ahead of framing (`send &&
//! response_partNum < response_numParts`) and the monitor-scan loop's
//! `m->intercept ^ send ^ m->armed` applicability test.

use tracing::{debug, trace};

use crate::config::Limits;
use crate::frame::{FrameScanner, ScanEvent};
use crate::hex;
use crate::notify::{Event as NotifyEvent, Notification, NotifyQueue};
use crate::rule::RuleStore;
use crate::template::{self, TemplateError};

/// Which endpoint a write or an incoming chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Host,
    Controller,
}

fn opposite(send: bool) -> Endpoint {
    if send { Endpoint::Controller } else { Endpoint::Host }
}

/// Origin of a `send`/`receive` frame — the endpoint that produced it,
/// used as the injection target when a fired rule has `forward == false`.
fn origin(send: bool) -> Endpoint {
    if send { Endpoint::Host } else { Endpoint::Controller }
}

/// Tracks a multi-part synthesized response awaiting host ACKs (§3
/// "ack-expectation block", §4.4 step 1). Always keyed off `send`
/// processing: it is the host that ACKs, regardless of which endpoint the
/// parts are delivered to (`target`) — see SPEC_FULL.md / DESIGN.md open
/// question on `forward` + controller ACKs.
struct PendingResponse {
    parts: Vec<Vec<u8>>,
    next_part: usize,
    target: Endpoint,
}

pub struct Dispatcher {
    send_scanner: FrameScanner,
    recv_scanner: FrameScanner,
    pending: Option<PendingResponse>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            send_scanner: FrameScanner::new("send"),
            recv_scanner: FrameScanner::new("recv"),
            pending: None,
        }
    }

    /// Feed `chunk`, produced by the host (`send=true`) or the controller
    /// (`send=false`), returning the writes to perform on each endpoint
    /// in order.
    pub fn feed(
        &mut self,
        send: bool,
        chunk: &[u8],
        rules: &mut RuleStore,
        queue: &mut NotifyQueue,
        limits: &Limits,
    ) -> Vec<(Endpoint, Vec<u8>)> {
        let mut writes = Vec::new();
        for &byte in chunk {
            if send {
                if self.pending.is_some() {
                    if byte == 0x06 {
                        self.consume_ack(&mut writes, queue);
                        continue;
                    }
                    self.pending = None;
                }
            }
            let events = if send {
                self.send_scanner.feed(&[byte])
            } else {
                self.recv_scanner.feed(&[byte])
            };
            for event in events {
                self.handle_event(send, event, rules, queue, limits, &mut writes);
            }
        }
        writes
    }

    /// One host ack either delivers the next queued part, or — once every
    /// part has already been delivered — is itself the trailing ack that
    /// releases holdoff. These are always two distinct acks (the original's
    /// `response_partNum < response_numParts` check runs again, unwritten,
    /// after the last part ships): a 1-remaining-part response needs 2
    /// acks total, never 1.
    fn consume_ack(&mut self, writes: &mut Vec<(Endpoint, Vec<u8>)>, queue: &mut NotifyQueue) {
        let Some(pending) = self.pending.as_mut() else { return };
        trace!(part = pending.next_part, "ack swallowed");
        if pending.next_part < pending.parts.len() {
            writes.push((pending.target, pending.parts[pending.next_part].clone()));
            pending.next_part += 1;
            return;
        }
        self.pending = None;
        queue.set_holdoff(false);
    }

    fn handle_event(
        &mut self,
        send: bool,
        event: ScanEvent,
        rules: &mut RuleStore,
        queue: &mut NotifyQueue,
        limits: &Limits,
        writes: &mut Vec<(Endpoint, Vec<u8>)>,
    ) {
        match event {
            ScanEvent::Passthrough(bytes) => writes.push((opposite(send), bytes)),
            ScanEvent::BadChecksum(bytes) => writes.push((opposite(send), bytes)),
            ScanEvent::Frame(frame) => self.dispatch_frame(send, frame, rules, queue, limits, writes),
        }
    }

    fn dispatch_frame(
        &mut self,
        send: bool,
        frame: Vec<u8>,
        rules: &mut RuleStore,
        queue: &mut NotifyQueue,
        limits: &Limits,
        writes: &mut Vec<(Endpoint, Vec<u8>)>,
    ) {
        let rendering = hex::render(&frame);
        let mut intercepted = false;
        let rule_vec = rules.rules_mut();
        let mut i = 0;
        while i < rule_vec.len() {
            if !rule_vec[i].applies(send) {
                i += 1;
                continue;
            }
            let caps = rule_vec[i].active_regex().captures(&rendering);
            let Some(caps) = caps else {
                i += 1;
                continue;
            };
            if !rule_vec[i].is_armed() {
                debug!(key = %rule_vec[i].key, "rule armed");
                rule_vec[i].arm();
                i += 1;
                continue;
            }

            // Fire.
            let mut message = None;
            if let Some(template_str) = rule_vec[i].response.clone() {
                match template::synthesize(
                    &template_str,
                    &caps,
                    &frame,
                    limits.max_response_bytes,
                    limits.max_response_parts,
                ) {
                    Ok(parts) if !parts.is_empty() => {
                        let forward = rule_vec[i].forward;
                        let target = if forward { opposite(send) } else { origin(send) };
                        let mut parts = parts;
                        let first = parts.remove(0);
                        writes.push((target, first));
                        if send && !parts.is_empty() {
                            queue.set_holdoff(true);
                            self.pending = Some(PendingResponse { parts, next_part: 0, target });
                        }
                        intercepted = true;
                    }
                    Ok(_) => {}
                    Err(e) => message = Some(e.message().to_string()),
                }
            }

            let event = if message.is_some() {
                NotifyEvent::Error
            } else if send {
                NotifyEvent::Intercept
            } else {
                NotifyEvent::Monitor
            };
            queue.enqueue(&Notification {
                device_num: rule_vec[i].device_num,
                key: rule_vec[i].key.clone(),
                event,
                silent: rule_vec[i].is_silent(),
                captures: Some(capture_values(&caps)),
                message,
            });

            if rule_vec[i].has_arm_pattern() && !rule_vec[i].oneshot {
                rule_vec[i].disarm();
            }
            if rule_vec[i].oneshot {
                rule_vec.remove(i);
                if intercepted {
                    break;
                }
                // Don't advance `i`: the removal already shifted the next
                // rule into this slot, so sibling rules remain visitable.
                continue;
            }
            if intercepted {
                break;
            }
            i += 1;
        }

        if !intercepted {
            writes.push((opposite(send), frame));
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn capture_values(caps: &regex::Captures<'_>) -> [Option<String>; 10] {
    std::array::from_fn(|i| caps.get(i).map(|m| m.as_str().to_string()))
}
