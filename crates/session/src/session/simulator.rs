//! In-memory delay/drop pipeline for inbound datagrams.
//!
//! Debug-build tooling: a uniform draw may drop a datagram outright,
//! and a uniform delay may hold it back until a later logic tick.
//! Held datagrams are copied, since the socket's receive buffer is
//! reused for the next datagram.
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::common::time::{LocalDuration, LocalTime};

/// Delays below this threshold are not worth a copy and a round trip
/// through the holding list.
const MIN_HOLD_DELAY: LocalDuration = LocalDuration::from_millis(5);

/// Simulator knobs, copied out of the session configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimulatorConfig {
    pub packet_loss: bool,
    pub latency: bool,
    /// Loss probability, in percent.
    pub packet_loss_chance: u8,
    pub min_latency: LocalDuration,
    pub max_latency: LocalDuration,
}

struct Held {
    data: Vec<u8>,
    addr: SocketAddr,
    release_at: LocalTime,
}

pub(crate) struct IngressSimulator {
    held: Mutex<Vec<Held>>,
    rng: Mutex<fastrand::Rng>,
}

impl IngressSimulator {
    pub fn new(rng: fastrand::Rng) -> Self {
        Self {
            held: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Decide the fate of an inbound datagram. Returns `true` when the
    /// simulator consumed it (dropped, or held for a later tick).
    pub fn intercept(
        &self,
        config: &SimulatorConfig,
        data: &[u8],
        addr: SocketAddr,
        now: LocalTime,
    ) -> bool {
        if config.packet_loss {
            let draw = self.rng.lock().unwrap().u8(0..100);
            if draw < config.packet_loss_chance {
                tracing::trace!(target: "session", "simulation: dropped {} byte(s) from {}", data.len(), addr);
                return true;
            }
        }
        if config.latency {
            let min = config.min_latency.as_millis();
            let max = config.max_latency.as_millis().max(min);
            let delay = LocalDuration::from_millis(self.rng.lock().unwrap().u64(min..=max));

            if delay > MIN_HOLD_DELAY {
                self.held.lock().unwrap().push(Held {
                    data: data.to_vec(),
                    addr,
                    release_at: now + delay,
                });
                return true;
            }
        }
        false
    }

    /// Take every held datagram whose deadline has passed.
    pub fn release(&self, now: LocalTime) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut held = self.held.lock().unwrap();
        let mut due = Vec::new();

        let mut slot = 0;
        while slot < held.len() {
            if held[slot].release_at <= now {
                let entry = held.swap_remove(slot);
                due.push((entry.data, entry.addr));
            } else {
                slot += 1;
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            packet_loss: false,
            latency: false,
            packet_loss_chance: 0,
            min_latency: LocalDuration::from_millis(30),
            max_latency: LocalDuration::from_millis(100),
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[test]
    fn test_disabled_simulator_passes_through() {
        let sim = IngressSimulator::new(fastrand::Rng::with_seed(1));
        assert!(!sim.intercept(&config(), b"data", addr(), LocalTime::now()));
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let sim = IngressSimulator::new(fastrand::Rng::with_seed(1));
        let cfg = SimulatorConfig {
            packet_loss: true,
            packet_loss_chance: 100,
            ..config()
        };

        for _ in 0..32 {
            assert!(sim.intercept(&cfg, b"data", addr(), LocalTime::now()));
        }
        assert!(sim.release(LocalTime::now() + LocalDuration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_latency_holds_and_releases() {
        let sim = IngressSimulator::new(fastrand::Rng::with_seed(7));
        let cfg = SimulatorConfig {
            latency: true,
            ..config()
        };
        let start = LocalTime::from_millis(1_000);

        assert!(sim.intercept(&cfg, b"delayed", addr(), start));
        assert!(sim.release(start).is_empty());

        let released = sim.release(start + cfg.max_latency);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, b"delayed");
        assert_eq!(released[0].1, addr());
    }
}
