use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, TimeoutPhase};

/// Per-phase timeout limits. `None` leaves a phase unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delays {
    pub lookup: Option<Duration>,
    pub connect: Option<Duration>,
    pub secure_connect: Option<Duration>,
    pub socket: Option<Duration>,
    pub send: Option<Duration>,
    pub response: Option<Duration>,
    pub read: Option<Duration>,
    pub request: Option<Duration>,
}

impl Delays {
    pub fn request(limit: Duration) -> Self {
        Self {
            request: Some(limit),
            ..Self::default()
        }
    }

    pub fn get(&self, phase: TimeoutPhase) -> Option<Duration> {
        match phase {
            TimeoutPhase::Lookup => self.lookup,
            TimeoutPhase::Connect => self.connect,
            TimeoutPhase::SecureConnect => self.secure_connect,
            TimeoutPhase::Socket => self.socket,
            TimeoutPhase::Send => self.send,
            TimeoutPhase::Response => self.response,
            TimeoutPhase::Read => self.read,
            TimeoutPhase::Request => self.request,
        }
    }

    /// Field-wise merge: every limit set on `other` replaces ours.
    pub fn merged(&self, other: &Delays) -> Delays {
        Delays {
            lookup: other.lookup.or(self.lookup),
            connect: other.connect.or(self.connect),
            secure_connect: other.secure_connect.or(self.secure_connect),
            socket: other.socket.or(self.socket),
            send: other.send.or(self.send),
            response: other.response.or(self.response),
            read: other.read.or(self.read),
            request: other.request.or(self.request),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Delays::default()
    }
}

#[derive(Clone, Copy, Debug)]
struct ArmedTimer {
    started: Instant,
    deadline: Instant,
    limit: Duration,
}

/// Timers of one attempt, armed when a phase starts and disarmed when it ends.
#[derive(Debug)]
pub(crate) struct PhaseTimers {
    limits: Delays,
    armed: BTreeMap<TimeoutPhase, ArmedTimer>,
}

impl PhaseTimers {
    pub(crate) fn new(limits: Delays) -> Self {
        Self {
            limits,
            armed: BTreeMap::new(),
        }
    }

    pub(crate) fn arm(&mut self, phase: TimeoutPhase) {
        let Some(limit) = self.limits.get(phase) else {
            return;
        };
        let started = Instant::now();
        self.armed.insert(
            phase,
            ArmedTimer {
                started,
                deadline: started + limit,
                limit,
            },
        );
    }

    pub(crate) fn disarm(&mut self, phase: TimeoutPhase) {
        self.armed.remove(&phase);
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, phase: TimeoutPhase) -> bool {
        self.armed.contains_key(&phase)
    }

    /// Re-arms the idle timer; called on any socket activity.
    pub(crate) fn touch(&mut self) {
        if self.armed.contains_key(&TimeoutPhase::Socket) {
            self.arm(TimeoutPhase::Socket);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<(TimeoutPhase, Instant)> {
        self.armed
            .iter()
            .min_by_key(|(_, timer)| timer.deadline)
            .map(|(phase, timer)| (*phase, timer.deadline))
    }

    pub(crate) fn expired(&self, phase: TimeoutPhase) -> Error {
        match self.armed.get(&phase) {
            Some(timer) => Error::timeout(phase, timer.limit, timer.started.elapsed()),
            None => Error::timeout(phase, Duration::ZERO, Duration::ZERO),
        }
    }
}

/// Wall-clock marks of one attempt.
#[derive(Clone, Debug)]
pub struct Timings {
    start: Instant,
    lookup: Option<Instant>,
    connect: Option<Instant>,
    secure_connect: Option<Instant>,
    upload: Option<Instant>,
    response: Option<Instant>,
    end: Option<Instant>,
    error: Option<Instant>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimingPhases {
    pub dns: Option<Duration>,
    pub tcp: Option<Duration>,
    pub tls: Option<Duration>,
    pub request: Option<Duration>,
    pub first_byte: Option<Duration>,
    pub download: Option<Duration>,
    pub total: Option<Duration>,
}

impl Timings {
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
            lookup: None,
            connect: None,
            secure_connect: None,
            upload: None,
            response: None,
            end: None,
            error: None,
        }
    }

    pub(crate) fn mark(&mut self, phase: TimeoutPhase) {
        let now = Some(Instant::now());
        match phase {
            TimeoutPhase::Lookup => self.lookup = now,
            TimeoutPhase::Connect => self.connect = now,
            TimeoutPhase::SecureConnect => self.secure_connect = now,
            TimeoutPhase::Send => self.upload = now,
            TimeoutPhase::Response => self.response = now,
            TimeoutPhase::Read | TimeoutPhase::Request => self.end = now,
            TimeoutPhase::Socket => {}
        }
    }

    pub(crate) fn mark_error(&mut self) {
        self.error = Some(Instant::now());
    }

    pub fn phases(&self) -> TimingPhases {
        let since = |from: Option<Instant>, to: Option<Instant>| match (from, to) {
            (Some(from), Some(to)) => Some(to.saturating_duration_since(from)),
            _ => None,
        };
        let connected = self.secure_connect.or(self.connect);
        let finished = self.end.or(self.error);
        TimingPhases {
            dns: since(Some(self.start), self.lookup),
            tcp: since(self.lookup.or(Some(self.start)), self.connect),
            tls: since(self.connect, self.secure_connect),
            request: since(connected, self.upload),
            first_byte: since(self.upload, self.response),
            download: since(self.response, self.end),
            total: since(Some(self.start), finished),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
