//! §3 `Rule` and the ordered rule store backing §4.4's scan and §4.5's
//! timeout handling.
//!
//! The original source keeps one circular doubly linked list
//! (`monitors`/`dummyMonitor` in `original_source/zwint/zwint.c`) sorted by
//! deadline, used both as the match-scan order and the timeout queue.
//! DESIGN NOTES explicitly allow substituting a plain ordered collection;
//! this module uses a `Vec<Rule>` kept sorted by deadline ascending (with
//! `deadline == 0`, "never", sorting last), which keeps scan order and
//! timeout order identical exactly as the original's shared list does.

use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

use crate::error::Error;

/// Direction a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Controller -> host.
    Monitor,
    /// Host -> controller.
    Intercept,
}

impl Direction {
    fn is_intercept(self) -> bool {
        matches!(self, Direction::Intercept)
    }
}

/// A registered monitor/intercept rule.
pub struct Rule {
    pub device_num: i64,
    pub key: String,
    pub direction: Direction,
    arm_pattern: Option<Regex>,
    pattern: Regex,
    pub response: Option<String>,
    pub forward: bool,
    pub oneshot: bool,
    armed: bool,
    /// Absolute monotonic millisecond deadline, or 0 for "never".
    pub deadline: u64,
}

impl Rule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_num: i64,
        key: String,
        direction: Direction,
        pattern: &str,
        oneshot: bool,
        deadline: u64,
        arm_pattern: Option<&str>,
        response: Option<String>,
        forward: bool,
    ) -> Result<Self, Error> {
        let pattern = compile(pattern).map_err(Error::RegexCompile)?;
        let arm_pattern = arm_pattern.map(compile).transpose().map_err(Error::RegexCompile)?;
        let armed = arm_pattern.is_none();
        Ok(Rule {
            device_num,
            key,
            direction,
            arm_pattern,
            pattern,
            response,
            forward,
            oneshot,
            armed,
            deadline,
        })
    }

    /// Keys beginning with `*` never produce an HTTP notification.
    pub fn is_silent(&self) -> bool {
        self.key.starts_with('*')
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn has_arm_pattern(&self) -> bool {
        self.arm_pattern.is_some()
    }

    /// §4.4 step 3: "this rule applies in this direction for its current
    /// arm phase" — `rule.intercept XOR send XOR rule.armed` (zwint.c:383's
    /// `m->intercept ^ send ^ m->armed`).
    pub fn applies(&self, send: bool) -> bool {
        self.direction.is_intercept() ^ send ^ self.armed
    }

    /// The regex to run right now: `arm_pattern` while unarmed, `pattern`
    /// once armed.
    pub fn active_regex(&self) -> &Regex {
        if self.armed {
            &self.pattern
        } else {
            self.arm_pattern.as_ref().unwrap_or(&self.pattern)
        }
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

fn compile(pattern: &str) -> Result<Regex, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| e.to_string())
}

/// Deadline ordering with `0` ("never") sorting strictly after every
/// finite deadline — the direct equivalent of the original's
/// `compareTimeout`.
fn compare_deadline(a: u64, b: u64) -> Ordering {
    match (a, b) {
        (0, 0) => Ordering::Equal,
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (a, b) => a.cmp(&b),
    }
}

/// Ordered collection of rules: deadline ascending, `0` last, insertion
/// order preserved among equal deadlines.
#[derive(Default)]
pub struct RuleStore {
    rules: Vec<Rule>,
}

impl RuleStore {
    pub fn new() -> Self {
        RuleStore { rules: Vec::new() }
    }

    /// Insert `rule`, placing it before the first existing rule whose
    /// deadline is strictly later (0-as-infinity compared).
    pub fn insert(&mut self, rule: Rule) {
        let pos = self
            .rules
            .iter()
            .position(|r| compare_deadline(rule.deadline, r.deadline) != Ordering::Greater)
            .unwrap_or(self.rules.len());
        self.rules.insert(pos, rule);
    }

    /// Direct access for the dispatcher's scan (§4.4), which needs
    /// index-based iteration with in-place arm/disarm and mid-scan removal.
    pub(crate) fn rules_mut(&mut self) -> &mut Vec<Rule> {
        &mut self.rules
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Remove the first rule matching both `device_num` and `key`.
    /// Returns whether a rule was found and removed.
    pub fn cancel(&mut self, device_num: i64, key: &str) -> bool {
        if let Some(pos) = self
            .rules
            .iter()
            .position(|r| r.device_num == device_num && r.key == key)
        {
            self.rules.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove rules matching `device_num`, or all rules if `None`.
    pub fn unregister(&mut self, device_num: Option<i64>) {
        match device_num {
            Some(dn) => self.rules.retain(|r| r.device_num != dn),
            None => self.rules.clear(),
        }
    }

    /// Drain and return every rule whose deadline is finite and has
    /// passed `now_ms`, in deadline order.
    pub fn drain_expired(&mut self, now_ms: u64) -> Vec<Rule> {
        let mut expired = Vec::new();
        while let Some(head) = self.rules.first() {
            if head.deadline != 0 && head.deadline <= now_ms {
                expired.push(self.rules.remove(0));
            } else {
                break;
            }
        }
        expired
    }

    /// The head rule's deadline, if finite — used to compute the next
    /// I/O wait timeout (§4.5).
    pub fn next_deadline(&self) -> Option<u64> {
        self.rules.first().and_then(|r| (r.deadline != 0).then_some(r.deadline))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
