use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Datagrams are packed up to the network MTU minus IP/UDP overhead; fragmentation at the
    ///  network layer is assumed to be absent, so this is a hard per-datagram bound
    pub network_mtu: usize,
    /// Pacing for the per-node keepalive pass: links with unacknowledged reliable traffic or
    ///  pending acks get one packing pass per interval
    pub keepalive_interval: Duration,
    /// Number of recently seen unreliable dedup keys retained per remote source
    pub unreliable_dedup_window: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            network_mtu: 1500,
            keepalive_interval: Duration::from_millis(20),
            unreliable_dedup_window: 256,
        }
    }
}

impl TransportConfig {
    const IP_UDP_HEADER_SIZE: usize = 28;

    pub fn max_datagram_size(&self) -> usize {
        self.network_mtu - Self::IP_UDP_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_datagram_size() {
        assert_eq!(TransportConfig::default().max_datagram_size(), 1472);
    }
}
