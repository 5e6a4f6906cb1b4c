use std::time::Duration;

/// Pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Maximum number of general-purpose connections. Event-loop
    /// overflow connections do not count against this limit.
    pub max_concurrent_connections: usize,
    /// Deadline for a single dial attempt.
    pub connect_timeout: Duration,
    /// How long an idle connection stays parked before it is closed.
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 8,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}
