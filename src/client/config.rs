use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory where the downloaded file will be saved
    pub download_path: PathBuf,
    /// Port reported to the tracker
    pub listen_port: u16,
    /// Maximum number of peer connections
    pub max_peers: usize,
    /// Number of pipelined block requests per peer (improves throughput)
    pub max_requests_per_peer: usize,
    /// Timeout for establishing and handshaking peer connections
    pub connection_timeout: Duration,
    /// A peer silent for this long is dropped
    pub read_idle: Duration,
    /// How often to send a keep-alive on an open connection
    pub keepalive_period: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("."),
            listen_port: 6881,
            max_peers: 50,
            max_requests_per_peer: 5,
            connection_timeout: Duration::from_secs(3),
            read_idle: Duration::from_secs(130),
            keepalive_period: Duration::from_secs(90),
        }
    }
}

impl ClientConfig {
    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }
}
