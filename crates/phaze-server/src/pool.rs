//! Tunnel address pool.
//!
//! The first host of the tunnel network belongs to the server; every other
//! host address (network and broadcast excluded) can be leased to a client.
//! Addresses are tracked in a bitmap, handed out lowest-first and only
//! returned when the owning session is evicted.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

#[derive(Debug)]
pub struct IpPool {
    network: Ipv4Net,
    first_client: u32,
    capacity: usize,
    bitmap: Vec<u64>,
    in_use: usize,
    /// No free address below this word.
    search_from: usize,
}

impl IpPool {
    pub fn new(network: Ipv4Net) -> Self {
        let network = network.trunc();
        let capacity = Self::client_capacity(&network);
        Self {
            network,
            first_client: u32::from(network.network()).wrapping_add(2),
            capacity,
            bitmap: vec![0; capacity.div_ceil(64)],
            in_use: 0,
            search_from: 0,
        }
    }

    /// Number of addresses available to clients in `network`.
    pub fn client_capacity(network: &Ipv4Net) -> usize {
        if network.prefix_len() > 30 {
            return 0;
        }
        // Minus network, broadcast and the server's own address.
        (1usize << (32 - network.prefix_len())) - 3
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Address of the server's end of the tunnel.
    pub fn server_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()).wrapping_add(1))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let offset = u32::from(ip).checked_sub(self.first_client)? as usize;
        (offset < self.capacity).then_some(offset)
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip)
            .is_some_and(|i| self.bitmap[i / 64] & (1 << (i % 64)) != 0)
    }

    /// Lease the lowest free address, or `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        if self.in_use >= self.capacity {
            return None;
        }

        for word_idx in self.search_from..self.bitmap.len() {
            let word = self.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = word_idx * 64 + bit;
            if index >= self.capacity {
                break;
            }

            self.bitmap[word_idx] |= 1 << bit;
            self.in_use += 1;
            self.search_from = word_idx;
            return Some(Ipv4Addr::from(self.first_client + index as u32));
        }

        None
    }

    /// Return `ip` to the pool. Returns false if it was not leased.
    pub fn release(&mut self, ip: Ipv4Addr) -> bool {
        let Some(index) = self.index_of(ip) else {
            return false;
        };
        let (word, mask) = (index / 64, 1u64 << (index % 64));
        if self.bitmap[word] & mask == 0 {
            return false;
        }

        self.bitmap[word] &= !mask;
        self.in_use -= 1;
        self.search_from = self.search_from.min(word);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> IpPool {
        IpPool::new(cidr.parse().unwrap())
    }

    #[test]
    fn test_layout() {
        let pool = pool("10.9.0.0/24");
        assert_eq!(pool.server_ip(), Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(pool.capacity(), 253);
        assert_eq!(pool.prefix_len(), 24);
    }

    #[test]
    fn test_allocates_lowest_first() {
        let mut pool = pool("10.9.0.0/24");
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 3)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 4)));

        assert!(pool.release(Ipv4Addr::new(10, 9, 0, 3)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 3)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 9, 0, 5)));
    }

    #[test]
    fn test_exhaustion_fails_closed() {
        let mut pool = pool("10.9.0.0/29");
        let leased: Vec<_> = std::iter::from_fn(|| pool.allocate()).collect();
        assert_eq!(leased.len(), 5);
        assert_eq!(leased.last(), Some(&Ipv4Addr::new(10, 9, 0, 6)));
        assert!(!leased.contains(&Ipv4Addr::new(10, 9, 0, 7)));
        assert_eq!(pool.allocate(), None);

        assert!(pool.release(leased[2]));
        assert_eq!(pool.allocate(), Some(leased[2]));
    }

    #[test]
    fn test_release_unknown_or_twice() {
        let mut pool = pool("10.9.0.0/24");
        let ip = pool.allocate().unwrap();
        assert!(pool.release(ip));
        assert!(!pool.release(ip));
        assert!(!pool.release(Ipv4Addr::new(10, 9, 0, 1)));
        assert!(!pool.release(Ipv4Addr::new(192, 168, 0, 2)));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_spans_multiple_words() {
        let mut pool = pool("10.8.0.0/16");
        for _ in 0..200 {
            pool.allocate().unwrap();
        }
        assert!(pool.is_allocated(Ipv4Addr::new(10, 8, 0, 201)));
        assert!(pool.release(Ipv4Addr::new(10, 8, 0, 10)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 8, 0, 10)));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 8, 0, 202)));
    }

    #[test]
    fn test_no_room() {
        assert_eq!(IpPool::client_capacity(&"10.0.0.0/31".parse().unwrap()), 0);
        assert_eq!(IpPool::client_capacity(&"10.0.0.0/30".parse().unwrap()), 1);
        let mut pool = pool("10.0.0.0/32");
        assert_eq!(pool.allocate(), None);
    }
}
