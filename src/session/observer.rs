//! Session progress reporting.

use std::fmt;

use super::State;

/// Something that happened during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// Bytes were written to the connection.
    Sent {
        /// The session step that wrote them.
        step: &'static str,

        /// Number of bytes written.
        bytes: usize,
    },

    /// Bytes were read from the connection.
    Received {
        /// Number of bytes read.
        bytes: usize,
    },

    /// A complete response was decoded.
    Decoded {
        /// The session step the response answers.
        step: &'static str,
    },

    /// The session moved between states.
    Transition {
        /// Previous state.
        from: State,

        /// New state.
        to: State,
    },

    /// Part of teardown failed. Teardown continues regardless.
    TeardownFailed {
        /// What went wrong.
        reason: String,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Sent { step, bytes } => write!(f, "{step}: sent {bytes} bytes"),
            Event::Received { bytes } => write!(f, "received {bytes} bytes"),
            Event::Decoded { step } => write!(f, "{step}: response decoded"),
            Event::Transition { from, to } => write!(f, "{from} -> {to}"),
            Event::TeardownFailed { reason } => write!(f, "teardown: {reason}"),
        }
    }
}

/// Receives [`Event`]s from a [`Session`](super::Session).
pub trait Observer: fmt::Debug + Send {
    /// Called synchronously as each event happens.
    fn observe(&mut self, event: Event);
}

impl<O> Observer for Box<O>
where
    O: Observer + ?Sized,
{
    fn observe(&mut self, event: Event) {
        (**self).observe(event)
    }
}

impl<O> Observer for &mut O
where
    O: Observer + ?Sized,
{
    fn observe(&mut self, event: Event) {
        (**self).observe(event)
    }
}

/// Forwards events to `tracing` inside a caller-supplied span.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    span: tracing::Span,
}

impl TracingObserver {
    /// Record events under `span`.
    pub fn new(span: tracing::Span) -> Self {
        Self { span }
    }

    /// The span events are recorded under.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(tracing::Span::current())
    }
}

impl Observer for TracingObserver {
    fn observe(&mut self, event: Event) {
        let _guard = self.span.enter();
        match event {
            Event::Sent { step, bytes } => tracing::trace!(step, bytes, "sent"),
            Event::Received { bytes } => tracing::trace!(bytes, "received"),
            Event::Decoded { step } => tracing::debug!(step, "response decoded"),
            Event::Transition { from, to } => {
                tracing::debug!(from = from.as_str(), to = to.as_str(), "session state")
            }
            Event::TeardownFailed { reason } => tracing::warn!(%reason, "teardown failed"),
        }
    }
}
