//! CLI config for the storage peer emulator.

use insert_protocol::server::ServerConfig;

use crate::socket_addr::SocketAddr;

/// CLI config for a process accepting insert connections.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct SinkConfig {
    /// Address to accept insert connections on.
    #[clap(
        long = "bind",
        env = "TSINSERT_SINK_BIND",
        default_value = "127.0.0.1:8400",
        action
    )]
    pub bind: SocketAddr,

    /// Acknowledge every block as read-only and discard it.
    #[clap(long = "read-only", env = "TSINSERT_SINK_READ_ONLY", action)]
    pub read_only: bool,

    /// Refuse the rpc hello, like storage nodes predating the rpc envelope.
    #[clap(long = "legacy-only", env = "TSINSERT_SINK_LEGACY_ONLY", action)]
    pub legacy_only: bool,

    /// Do not compress data sent back to clients.
    #[clap(
        long = "rpc.disable-compression",
        env = "TSINSERT_SINK_DISABLE_COMPRESSION",
        action
    )]
    pub disable_compression: bool,
}

impl SinkConfig {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            compress: !self.disable_compression,
            read_only: self.read_only,
            legacy_only: self.legacy_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_sink_config() {
        let config = SinkConfig::try_parse_from(["", "--legacy-only"]).unwrap();
        assert_eq!(config.bind.port(), 8400);
        let server = config.to_server_config();
        assert!(server.compress);
        assert!(server.legacy_only);
        assert!(!server.read_only);
    }
}
