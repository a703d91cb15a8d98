use std::time::Duration;

use anyhow::bail;

use crate::package::PackageHeader;

#[derive(Debug, Clone)]
pub struct BdtConfig {
    /// vports below this value are never handed out by automatic allocation. They can still be
    ///  bound explicitly.
    pub reserved_vports: u16,

    /// how long endpoints learned from rendezvous replies are remembered for a peer
    pub reachability_ttl: Duration,

    pub connection: ConnectionConfig,
    pub hole_punch: HolePunchConfig,
    pub udp: UdpTransferConfig,
    pub tcp: TcpTransferConfig,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// a connect attempt that sees no handshake reply within this time fails with `Timeout`
    pub connect_timeout: Duration,
    /// maximum segment lifetime; `TimeWait` lasts twice as long
    pub msl: Duration,

    /// after this long without any package from the peer, heartbeats are sent
    pub heartbeat_begin: Duration,
    pub heartbeat_interval: Duration,
    /// after this long without any package from the peer, the connection breaks
    pub heartbeat_break: Duration,
}

#[derive(Debug, Clone)]
pub struct HolePunchConfig {
    /// interval for re-sending the handshake package to all candidate endpoints
    pub syn_interval: Duration,
    /// number of ports probed above and below a NAT mapped port to catch non-deterministic
    ///  port allocation; 0 disables guessing
    pub port_guess_range: u16,

    /// delay before a rendezvous peer is asked to relay a call request
    pub call_delay: Duration,
    /// initial interval between call requests to the same rendezvous peer, doubled after each
    pub call_interval: Duration,
    pub max_call_times: u32,

    /// delay before an ephemeral socket is opened as a last resort
    pub dynamic_socket_delay: Duration,

    /// rendezvous peer searches are repeated with geometrically growing intervals in this range
    pub sn_search_initial_interval: Duration,
    pub sn_search_max_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct UdpTransferConfig {
    /// maximum payload per package. Together with package header and body this must fit into a
    ///  single UDP datagram on every route between peers - there is no fragmentation.
    pub mss: u32,
    pub initial_ssthresh: u32,
    pub max_cwnd: u32,

    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,

    pub ack_delay_initial: Duration,
    pub ack_delay_min: Duration,
    pub ack_delay_max: Duration,
    /// number of packages acknowledged immediately after a gap in the incoming flow
    pub quick_ack_count: u32,

    /// coalescing delay for small writes
    pub nagle_delay: Duration,

    pub final_ack_interval: Duration,
    pub final_ack_times: u32,

    /// bytes the receiver buffers out of order; packages beyond are dropped
    pub recv_window: u32,

    pub send_buffer_capacity: usize,
    pub send_buffer_drain_size: usize,
}

#[derive(Debug, Clone)]
pub struct TcpTransferConfig {
    pub max_package_data: usize,
    pub send_buffer_capacity: usize,
    pub send_buffer_drain_size: usize,
}

impl Default for BdtConfig {
    fn default() -> Self {
        BdtConfig {
            reserved_vports: 1024,
            reachability_ttl: Duration::from_secs(60),
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(20),
                msl: Duration::from_secs(5),
                heartbeat_begin: Duration::from_secs(5),
                heartbeat_interval: Duration::from_secs(1),
                heartbeat_break: Duration::from_secs(30),
            },
            hole_punch: HolePunchConfig {
                syn_interval: Duration::from_millis(200),
                port_guess_range: 3,
                call_delay: Duration::from_millis(500),
                call_interval: Duration::from_millis(500),
                max_call_times: 5,
                dynamic_socket_delay: Duration::from_secs(3),
                sn_search_initial_interval: Duration::from_secs(1),
                sn_search_max_interval: Duration::from_secs(16),
            },
            udp: UdpTransferConfig {
                mss: 1400,
                initial_ssthresh: 64 * 1400,
                max_cwnd: 4 * 1024 * 1024,
                rto_initial: Duration::from_secs(1),
                rto_min: Duration::from_millis(200),
                rto_max: Duration::from_secs(60),
                ack_delay_initial: Duration::from_millis(40),
                ack_delay_min: Duration::from_millis(5),
                ack_delay_max: Duration::from_millis(200),
                quick_ack_count: 8,
                nagle_delay: Duration::from_millis(10),
                final_ack_interval: Duration::from_millis(500),
                final_ack_times: 3,
                recv_window: 1024 * 1024,
                send_buffer_capacity: 1024 * 1024,
                send_buffer_drain_size: 256 * 1024,
            },
            tcp: TcpTransferConfig {
                max_package_data: 16 * 1024,
                send_buffer_capacity: 1024 * 1024,
                send_buffer_drain_size: 256 * 1024,
            },
        }
    }
}

impl BdtConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let udp = &self.udp;
        if udp.mss < 64 {
            bail!("mss must be at least 64, is {}", udp.mss);
        }
        if udp.mss as usize + PackageHeader::SERIALIZED_LEN > u16::MAX as usize {
            bail!("mss {} does not fit into a package", udp.mss);
        }
        if udp.initial_ssthresh < 2 * udp.mss {
            bail!("initial ssthresh must be at least 2*mss");
        }
        if udp.max_cwnd < 2 * udp.mss {
            bail!("max cwnd must be at least 2*mss");
        }
        if !(udp.rto_min <= udp.rto_initial && udp.rto_initial <= udp.rto_max) {
            bail!("RTO settings must satisfy rto_min <= rto_initial <= rto_max");
        }
        if !(udp.ack_delay_min <= udp.ack_delay_initial && udp.ack_delay_initial <= udp.ack_delay_max) {
            bail!("ack delay settings must satisfy min <= initial <= max");
        }
        if udp.recv_window < udp.mss {
            bail!("receive window must hold at least one package");
        }
        if udp.send_buffer_drain_size > udp.send_buffer_capacity || self.tcp.send_buffer_drain_size > self.tcp.send_buffer_capacity {
            bail!("send buffer drain size must not exceed its capacity");
        }
        if self.tcp.max_package_data == 0 || self.tcp.max_package_data + PackageHeader::SERIALIZED_LEN > u16::MAX as usize {
            bail!("TCP package data size {} out of range", self.tcp.max_package_data);
        }

        let connection = &self.connection;
        if connection.heartbeat_begin >= connection.heartbeat_break {
            bail!("heartbeat must begin before the connection breaks");
        }
        if connection.heartbeat_interval.is_zero() || self.hole_punch.syn_interval.is_zero() {
            bail!("intervals must not be zero");
        }
        if self.hole_punch.sn_search_initial_interval > self.hole_punch.sn_search_max_interval {
            bail!("SN search initial interval exceeds max interval");
        }

        Ok(())
    }
}
