//! Connection configuration types.

use std::time::Duration;

use rustls::pki_types::CertificateDer;

/// How the byte transport is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Cleartext for the whole session, on port 143. Only sensible against
    /// localhost bridges and test servers.
    None,
    /// Open in cleartext on port 143, then switch to TLS in place once the
    /// server accepts STARTTLS (via [`Client::upgrade`](super::Client::upgrade)).
    StartTls,
    /// TLS from the first byte, on port 993. The default.
    #[default]
    Implicit,
}

impl Security {
    /// The well-known IMAP port for this mode: 993 under implicit TLS,
    /// 143 otherwise.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None | Self::StartTls => 143,
            Self::Implicit => 993,
        }
    }
}

/// IMAP connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Additional trust anchors accepted beyond the webpki roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Run the DEFLATE codec on a worker task instead of in-process.
    pub compression_offload: bool,
    /// Quiet time on an empty queue before the idle event fires.
    pub enter_idle_after: Duration,
    /// Base wait for a server response after an outbound send.
    pub socket_timeout_floor: Duration,
    /// Additional wait per outbound byte.
    pub socket_timeout_per_byte: Duration,
}

impl Config {
    /// Creates a new configuration with implicit TLS on port 993.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Security::Implicit.default_port(),
            security: Security::Implicit,
            extra_roots: Vec::new(),
            compression_offload: false,
            enter_idle_after: Duration::from_secs(1),
            socket_timeout_floor: Duration::from_secs(10),
            socket_timeout_per_byte: Duration::from_millis(100),
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Returns the response deadline for an outbound send of `bytes` bytes.
    #[must_use]
    pub fn socket_timeout(&self, bytes: usize) -> Duration {
        let per_byte = u32::try_from(bytes).unwrap_or(u32::MAX);
        self.socket_timeout_floor + self.socket_timeout_per_byte * per_byte
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Builder for connection configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    security: Security,
    extra_roots: Vec<CertificateDer<'static>>,
    compression_offload: bool,
    enter_idle_after: Duration,
    socket_timeout_floor: Duration,
    socket_timeout_per_byte: Duration,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let defaults = Config::new(host);
        Self {
            host: defaults.host,
            port: None,
            security: defaults.security,
            extra_roots: defaults.extra_roots,
            compression_offload: defaults.compression_offload,
            enter_idle_after: defaults.enter_idle_after,
            socket_timeout_floor: defaults.socket_timeout_floor,
            socket_timeout_per_byte: defaults.socket_timeout_per_byte,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Adds a trust anchor beyond the webpki roots.
    #[must_use]
    pub fn extra_root(mut self, root: CertificateDer<'static>) -> Self {
        self.extra_roots.push(root);
        self
    }

    /// Runs the DEFLATE codec on a worker task.
    #[must_use]
    pub const fn compression_offload(mut self, offload: bool) -> Self {
        self.compression_offload = offload;
        self
    }

    /// Sets the quiet time before the idle event fires.
    #[must_use]
    pub const fn enter_idle_after(mut self, delay: Duration) -> Self {
        self.enter_idle_after = delay;
        self
    }

    /// Sets the base response timeout.
    #[must_use]
    pub const fn socket_timeout_floor(mut self, floor: Duration) -> Self {
        self.socket_timeout_floor = floor;
        self
    }

    /// Sets the per-byte response timeout increment.
    #[must_use]
    pub const fn socket_timeout_per_byte(mut self, per_byte: Duration) -> Self {
        self.socket_timeout_per_byte = per_byte;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            host: self.host,
            security: self.security,
            extra_roots: self.extra_roots,
            compression_offload: self.compression_offload,
            enter_idle_after: self.enter_idle_after,
            socket_timeout_floor: self.socket_timeout_floor,
            socket_timeout_per_byte: self.socket_timeout_per_byte,
        }
    }
}
