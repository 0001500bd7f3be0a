use serde::{Deserialize, Serialize};

/// L4 protocols the datapath translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// IPv4 CIDR with the address in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cidr {
    pub addr: u32,
    pub prefix_len: u8,
}

impl Cidr {
    pub const fn host(addr: u32) -> Self {
        Self {
            addr,
            prefix_len: 32,
        }
    }

    /// Netmask for this prefix, host byte order.
    pub const fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len as u32)
        }
    }

    /// Address pre-masked to the prefix.
    pub const fn network(&self) -> u32 {
        self.addr & self.mask()
    }

    pub const fn contains(&self, addr: u32) -> bool {
        addr & self.mask() == self.network()
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = std::net::Ipv4Addr::from(self.addr);
        write!(f, "{}/{}", ip, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_numbers() {
        assert_eq!(Protocol::Tcp.number(), 6);
        assert_eq!(Protocol::Udp.number(), 17);
    }

    #[test]
    fn cidr_mask_and_network() {
        let c = Cidr {
            addr: 0xc0a8_0105,
            prefix_len: 24,
        };
        assert_eq!(c.mask(), 0xffff_ff00);
        assert_eq!(c.network(), 0xc0a8_0100);
        assert!(c.contains(0xc0a8_01ff));
        assert!(!c.contains(0xc0a8_0200));
    }

    #[test]
    fn cidr_zero_prefix_matches_all() {
        let c = Cidr {
            addr: 0,
            prefix_len: 0,
        };
        assert_eq!(c.mask(), 0);
        assert!(c.contains(0xdead_beef));
    }

    #[test]
    fn cidr_display() {
        let c = Cidr {
            addr: 0x0a00_0000,
            prefix_len: 8,
        };
        assert_eq!(c.to_string(), "10.0.0.0/8");
    }
}
