//! Typed change notification stream.
//!
//! Resolver operations touch many containers; observers must only ever see
//! the settled result. Two mechanisms guarantee that:
//!
//! - an explicit batch scope for compound operations: while open, emitted
//!   signals are captured and deduplicated, then released once in a fixed
//!   order when the outermost scope closes;
//! - a polled quiescence timer for raw container mutations arriving outside
//!   any scope: the window restarts on each mutation and fires a single
//!   settled-notification burst once mutations stop.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::trace;

/// The outbound notifications consumers can subscribe to. Declaration order
/// is release order within a batch; subscribers must tolerate signals that
/// carry no net state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeSignal {
    GlobalStack,
    ActiveStack,
    ExtruderCountEnabled,
    DefaultExtruder,
    QualityGroup,
    QualityChangesGroup,
    Variant,
    Material,
    RootMaterial,
    CurrentConfiguration,
    PrinterConnectedStatus,
}

/// Signals fired by the settle timer after a burst of raw container
/// mutations, in release order.
pub const SETTLED_SIGNALS: [ChangeSignal; 5] = [
    ChangeSignal::ExtruderCountEnabled,
    ChangeSignal::QualityGroup,
    ChangeSignal::Variant,
    ChangeSignal::Material,
    ChangeSignal::RootMaterial,
];

type Subscriber = Box<dyn Fn(ChangeSignal)>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    batch_depth: usize,
    pending: BTreeSet<ChangeSignal>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(ChangeSignal) + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    fn deliver(&self, signal: ChangeSignal) {
        trace!(?signal, "delivering change signal");
        for subscriber in &self.subscribers {
            subscriber(signal);
        }
    }

    /// Emit a signal. Inside a batch scope it is captured (duplicates
    /// collapse); outside it is delivered immediately.
    pub fn emit(&mut self, signal: ChangeSignal) {
        if self.batch_depth > 0 {
            self.pending.insert(signal);
        } else {
            self.deliver(signal);
        }
    }

    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Close one batch scope. Closing the outermost scope releases every
    /// captured signal exactly once, in declaration order.
    pub fn end_batch(&mut self) {
        debug_assert!(self.batch_depth > 0, "end_batch without begin_batch");
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 {
            let pending = std::mem::take(&mut self.pending);
            for signal in pending {
                self.deliver(signal);
            }
        }
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }
}

/// Single-shot quiescence window over raw container mutations. Restarts on
/// every `touch`; `poll` reports (once) when the window has elapsed with no
/// further mutation. Polled, never thread-based: nothing in the resolver
/// suspends.
pub struct SettleTimer {
    window: Duration,
    deadline: Option<Instant>,
}

impl SettleTimer {
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(250);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for SettleTimer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

/// A user-visible, non-blocking, dismissible notice. Not an error: the
/// operation that produced it has already degraded to a safe state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
}
