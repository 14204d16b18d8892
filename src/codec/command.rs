use std::fmt;
use std::time::Duration;

/// An application command issued after login.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command {
    /// Fetch new events from the server.
    Sync(SyncOptions),
}

impl Command {
    /// A sync command with default options.
    pub fn sync() -> Self {
        Command::Sync(SyncOptions::default())
    }

    /// The name of the command, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Sync(_) => "sync",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters for a sync request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Batch token from a previous sync, to fetch only newer events.
    pub since: Option<String>,

    /// How long the server may hold the request open waiting for events.
    pub timeout: Option<Duration>,

    /// A filter ID or inline JSON filter.
    pub filter: Option<String>,

    /// Return the full state of every room, even with `since` set.
    pub full_state: bool,
}

impl SyncOptions {
    /// Continue from a previous batch token.
    pub fn since(mut self, token: impl Into<String>) -> Self {
        self.since = Some(token.into());
        self
    }

    /// Set the long-poll timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the filter.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Request full room state.
    pub fn full_state(mut self, full_state: bool) -> Self {
        self.full_state = full_state;
        self
    }
}
