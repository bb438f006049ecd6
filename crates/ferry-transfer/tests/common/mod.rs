//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use ferry_transfer::Transport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic file content: a prime modulus so chunk boundaries don't repeat.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, pattern(len)).unwrap();
    path
}

/// Impairment applied to every datagram leaving one end of a [`LossyLink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Impairment {
    pub loss: f64,
    pub duplicate: f64,
}

/// One end of an in-memory point-to-point datagram link.
///
/// Datagrams always arrive from the peer's address, whatever target the
/// sender names. Loss and duplication come from a seeded RNG so failures
/// reproduce.
pub struct LossyLink {
    local: SocketAddr,
    tx: Sender<(Vec<u8>, SocketAddr)>,
    rx: Receiver<(Vec<u8>, SocketAddr)>,
    impairment: Impairment,
    rng: Mutex<StdRng>,
    dropped: Mutex<u64>,
}

impl LossyLink {
    /// Connect two ends. `a_out` impairs traffic from `a` to `b`, `b_out` the reverse.
    pub fn pair(
        a: SocketAddr,
        b: SocketAddr,
        a_out: Impairment,
        b_out: Impairment,
        seed: u64,
    ) -> (LossyLink, LossyLink) {
        let (to_b, b_inbox) = unbounded();
        let (to_a, a_inbox) = unbounded();
        let end_a = LossyLink {
            local: a,
            tx: to_b,
            rx: a_inbox,
            impairment: a_out,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            dropped: Mutex::new(0),
        };
        let end_b = LossyLink {
            local: b,
            tx: to_a,
            rx: b_inbox,
            impairment: b_out,
            rng: Mutex::new(StdRng::seed_from_u64(seed.wrapping_add(1))),
            dropped: Mutex::new(0),
        };
        (end_a, end_b)
    }

    pub fn dropped(&self) -> u64 {
        *self.dropped.lock().unwrap()
    }
}

impl Transport for LossyLink {
    fn send_to(&self, data: &[u8], _target: SocketAddr) -> io::Result<()> {
        let (lose, repeat) = {
            let mut rng = self.rng.lock().unwrap();
            (
                rng.random_bool(self.impairment.loss),
                rng.random_bool(self.impairment.duplicate),
            )
        };
        if lose {
            *self.dropped.lock().unwrap() += 1;
            return Ok(());
        }
        // A vanished peer is just silence.
        let _ = self.tx.send((data.to_vec(), self.local));
        if repeat {
            let _ = self.tx.send((data.to_vec(), self.local));
        }
        Ok(())
    }

    fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.rx.recv_timeout(timeout) {
            Ok((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, from)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}
