use std::collections::HashSet;
use std::net::TcpListener;

use dl_config::PortConfig;
use dl_error::{DevloopError, Result};
use rand::Rng;

/// Hands out dev-server ports that are free on this machine and not held by
/// any live session.
///
/// The reservation set only guards against races inside this process; the
/// bind probe narrows, but cannot close, the window for other processes.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortConfig,
    reserved: HashSet<u16>,
    tried_default: bool,
}

impl PortAllocator {
    pub fn new(config: PortConfig) -> Self {
        Self {
            config,
            reserved: HashSet::new(),
            tried_default: false,
        }
    }

    pub fn allocate(&mut self, live_ports: &HashSet<u16>) -> Result<u16> {
        if !self.tried_default {
            self.tried_default = true;
            let port = self.config.default_port;
            if self.is_candidate(port, live_ports) && probe(port) {
                self.reserved.insert(port);
                return Ok(port);
            }
        }

        let mut rng = rand::thread_rng();
        for _ in 0..self.config.max_attempts {
            let port = rng.gen_range(self.config.range_start..=self.config.range_end);
            if self.is_candidate(port, live_ports) && probe(port) {
                self.reserved.insert(port);
                return Ok(port);
            }
        }

        Err(DevloopError::PortExhausted {
            attempts: self.config.max_attempts,
        })
    }

    /// Records an explicitly requested port so `allocate` skips it.
    pub fn reserve(&mut self, port: u16) {
        self.reserved.insert(port);
    }

    pub fn release(&mut self, port: u16) {
        self.reserved.remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    fn is_candidate(&self, port: u16, live_ports: &HashSet<u16>) -> bool {
        !live_ports.contains(&port) && !self.reserved.contains(&port)
    }
}

fn probe(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config_with_default(default_port: u16) -> PortConfig {
        PortConfig {
            default_port,
            ..PortConfig::default()
        }
    }

    #[test]
    fn first_call_prefers_default_port() {
        let port = free_port();
        let mut allocator = PortAllocator::new(config_with_default(port));
        assert_eq!(allocator.allocate(&HashSet::new()).unwrap(), port);
        assert!(allocator.is_reserved(port));
    }

    #[test]
    fn default_port_skipped_when_live_session_holds_it() {
        let port = free_port();
        let mut allocator = PortAllocator::new(config_with_default(port));
        let live = HashSet::from([port]);
        let allocated = allocator.allocate(&live).unwrap();
        assert_ne!(allocated, port);
        assert!((8082..=9999).contains(&allocated));
    }

    #[test]
    fn default_port_skipped_when_bound() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let mut allocator = PortAllocator::new(config_with_default(port));
        assert_ne!(allocator.allocate(&HashSet::new()).unwrap(), port);
    }

    #[test]
    fn default_port_only_tried_on_first_call() {
        let port = free_port();
        let mut allocator = PortAllocator::new(config_with_default(port));
        let first = allocator.allocate(&HashSet::new()).unwrap();
        allocator.release(first);
        let second = allocator.allocate(&HashSet::new()).unwrap();
        assert!((8082..=9999).contains(&second));
    }

    #[test]
    fn allocations_are_unique_until_released() {
        let mut allocator = PortAllocator::new(PortConfig {
            max_attempts: 200,
            ..config_with_default(free_port())
        });
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = allocator.allocate(&HashSet::new()).unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let mut allocator = PortAllocator::new(PortConfig {
            default_port: port,
            range_start: port,
            range_end: port,
            max_attempts: 3,
        });
        let err = allocator.allocate(&HashSet::new()).unwrap_err();
        assert_eq!(err.code(), "PORT_EXHAUSTED");
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn reserved_port_is_skipped() {
        let port = free_port();
        let mut allocator = PortAllocator::new(PortConfig {
            default_port: port,
            range_start: port,
            range_end: port,
            max_attempts: 2,
        });
        allocator.reserve(port);
        assert_eq!(
            allocator.allocate(&HashSet::new()).unwrap_err().code(),
            "PORT_EXHAUSTED"
        );
        allocator.release(port);
        assert_eq!(allocator.allocate(&HashSet::new()).unwrap(), port);
    }
}
