//! Tunnel address allocation
//!
//! Deterministic ascending scan of the controller CIDR. Allocation is pure:
//! the store re-checks uniqueness on insert, so a concurrent allocation that
//! hands out the same address loses at insert time instead of overwriting.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Upper bound on candidates examined per allocation
pub const MAX_PROBES: usize = 1000;

/// Return the first address in `cidr`, starting at network + 1, that is not in
/// `used`. The broadcast address is never handed out for prefixes shorter
/// than /31.
pub fn allocate_address(used: &HashSet<Ipv4Addr>, cidr: Ipv4Network) -> Result<Ipv4Addr> {
    let network = u32::from(cidr.network());
    let last = last_assignable(cidr);

    let mut probes = 0;
    let mut candidate = network.checked_add(1);

    while let Some(current) = candidate {
        if current > last || probes >= MAX_PROBES {
            break;
        }
        probes += 1;

        let addr = Ipv4Addr::from(current);
        if !used.contains(&addr) {
            return Ok(addr);
        }
        candidate = current.checked_add(1);
    }

    Err(Error::AddressSpaceExhausted {
        cidr: cidr.to_string(),
        probes,
    })
}

/// Highest host address in the block, used as the controller's own address
/// when none is configured.
pub fn highest_usable(cidr: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(last_assignable(cidr))
}

fn last_assignable(cidr: Ipv4Network) -> u32 {
    let broadcast = u32::from(cidr.broadcast());
    if cidr.prefix() < 31 {
        broadcast - 1
    } else {
        broadcast
    }
}

/// True if the address is an RFC 1918 private address
pub fn is_private_network(cidr: Ipv4Network) -> bool {
    cidr.network().is_private() && cidr.broadcast().is_private()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_free_address() {
        let used = HashSet::new();
        let addr = allocate_address(&used, net("172.19.0.0/24")).unwrap();
        assert_eq!(addr, Ipv4Addr::new(172, 19, 0, 1));
    }

    #[test]
    fn test_skips_used_addresses() {
        let used: HashSet<_> = [
            Ipv4Addr::new(172, 19, 0, 1),
            Ipv4Addr::new(172, 19, 0, 2),
            Ipv4Addr::new(172, 19, 0, 4),
        ]
        .into_iter()
        .collect();
        let addr = allocate_address(&used, net("172.19.0.0/24")).unwrap();
        assert_eq!(addr, Ipv4Addr::new(172, 19, 0, 3));
    }

    #[test]
    fn test_small_block_exhaustion() {
        let cidr = net("10.1.1.0/30");
        let mut used = HashSet::new();

        // .1 and .2 are assignable, .3 is broadcast
        for _ in 0..2 {
            let addr = allocate_address(&used, cidr).unwrap();
            assert!(cidr.contains(addr));
            assert!(used.insert(addr));
        }

        match allocate_address(&used, cidr) {
            Err(Error::AddressSpaceExhausted { probes, .. }) => assert_eq!(probes, 2),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_probe_bound() {
        let cidr = net("10.0.0.0/16");
        let used: HashSet<_> = (1..=MAX_PROBES as u32)
            .map(|i| Ipv4Addr::from(u32::from(cidr.network()) + i))
            .collect();

        match allocate_address(&used, cidr) {
            Err(Error::AddressSpaceExhausted { probes, .. }) => assert_eq!(probes, MAX_PROBES),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_result_in_block_and_unused() {
        for cidr in ["192.168.10.0/28", "172.19.0.0/24", "10.9.0.0/29"] {
            let cidr = net(cidr);
            let mut used = HashSet::new();
            while let Ok(addr) = allocate_address(&used, cidr) {
                assert!(cidr.contains(addr));
                assert_ne!(addr, cidr.network());
                assert_ne!(addr, cidr.broadcast());
                assert!(used.insert(addr), "{} handed out twice", addr);
            }
            assert_eq!(used.len() as u32, cidr.size() - 2);
        }
    }

    #[test]
    fn test_highest_usable() {
        assert_eq!(
            highest_usable(net("172.19.0.0/24")),
            Ipv4Addr::new(172, 19, 0, 254)
        );
    }

    #[test]
    fn test_private_network() {
        assert!(is_private_network(net("172.19.0.0/24")));
        assert!(is_private_network(net("10.0.0.0/8")));
        assert!(!is_private_network(net("8.8.8.0/24")));
    }
}
