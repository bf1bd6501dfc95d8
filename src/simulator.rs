//! Fault-injecting network relay for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! this module provides a [`Simulator`]: a UDP relay that sits between an
//! initiator and a listener and applies a caller-supplied policy to every
//! frame:
//!
//! | [`Action`]  | Effect                                   |
//! |-------------|------------------------------------------|
//! | `Deliver`   | Forward the datagram unchanged.          |
//! | `Drop`      | Silently discard it.                     |
//! | `Duplicate` | Forward it twice, back to back.          |
//!
//! The policy sees the parsed [`Header`] and the direction of travel, so
//! tests can target "the second ACK for fragment 0" precisely.  For random
//! loss, [`random_loss`] builds a policy from a seeded RNG so failures are
//! reproducible.
//!
//! The relay also records every frame it sees, letting tests assert on the
//! wire traffic (retransmission counts, duplicate ACKs) without reaching
//! into connection internals.  The simulator is test infrastructure only;
//! production endpoints talk to the real socket layer.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::packet::Header;

/// Which way a frame is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the initiator towards the listener.
    ToListener,
    /// From the listener towards the initiator.
    ToInitiator,
}

/// What the policy wants done with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Deliver,
    Drop,
    Duplicate,
}

/// One frame as the relay saw it, and what was done with it.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub direction: Direction,
    pub flags: u8,
    pub seq_num: u32,
    pub action: Action,
}

/// Decides the fate of each frame passing through the relay.
pub type Policy = Box<dyn FnMut(Direction, &Header) -> Action + Send>;

/// A policy that forwards everything.
pub fn passthrough() -> Policy {
    Box::new(|_, _| Action::Deliver)
}

/// A policy that drops each frame independently with probability
/// `loss_rate`, from a seeded RNG for reproducibility.
pub fn random_loss(loss_rate: f64, seed: u64) -> Policy {
    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move |_, _| {
        if rng.gen_bool(loss_rate) {
            Action::Drop
        } else {
            Action::Deliver
        }
    })
}

/// A running relay between one initiator and one listener.
///
/// The initiator connects to [`Simulator::addr`] instead of the listener's
/// real address; both endpoints then see the relay as their peer.
#[derive(Debug)]
pub struct Simulator {
    /// Address the initiator should connect to.
    pub addr: SocketAddr,
    log: Arc<Mutex<Vec<FrameRecord>>>,
    task: JoinHandle<()>,
}

impl Simulator {
    /// Spawn a relay in front of `listener`, applying `policy` to every
    /// frame in both directions.
    pub async fn spawn(listener: SocketAddr, mut policy: Policy) -> io::Result<Self> {
        // One socket faces the initiator, one faces the listener, so each
        // endpoint has a single consistent peer address.
        let front = UdpSocket::bind("127.0.0.1:0").await?;
        let back = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = front.local_addr()?;

        let log: Arc<Mutex<Vec<FrameRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let log_task = Arc::clone(&log);

        let task = tokio::spawn(async move {
            let mut initiator: Option<SocketAddr> = None;
            let mut front_buf = [0u8; 65_535];
            let mut back_buf = [0u8; 65_535];

            loop {
                tokio::select! {
                    result = front.recv_from(&mut front_buf) => {
                        let Ok((n, src)) = result else { break };
                        initiator = Some(src);
                        relay(
                            &front_buf[..n],
                            Direction::ToListener,
                            &back,
                            listener,
                            &mut policy,
                            &log_task,
                        )
                        .await;
                    }
                    result = back.recv_from(&mut back_buf) => {
                        let Ok((n, _src)) = result else { break };
                        let Some(dest) = initiator else { continue };
                        relay(
                            &back_buf[..n],
                            Direction::ToInitiator,
                            &front,
                            dest,
                            &mut policy,
                            &log_task,
                        )
                        .await;
                    }
                }
            }
        });

        Ok(Self { addr, log, task })
    }

    /// Every frame the relay has seen so far, oldest first.
    pub fn frames(&self) -> Vec<FrameRecord> {
        self.log.lock().expect("simulator log poisoned").clone()
    }

    /// Frames matching `direction` and `flags` exactly.
    pub fn frames_matching(&self, direction: Direction, flags: u8) -> Vec<FrameRecord> {
        self.frames()
            .into_iter()
            .filter(|f| f.direction == direction && f.flags == flags)
            .collect()
    }

    /// Stop relaying.  In-flight datagrams are lost, like any network.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn relay(
    datagram: &[u8],
    direction: Direction,
    out: &UdpSocket,
    dest: SocketAddr,
    policy: &mut Policy,
    log: &Arc<Mutex<Vec<FrameRecord>>>,
) {
    // Frames too short to parse are forwarded untouched; the validator on
    // the far side deals with them.
    let action = match Header::parse(datagram) {
        Ok(header) => {
            let action = policy(direction, &header);
            log.lock().expect("simulator log poisoned").push(FrameRecord {
                direction,
                flags: header.flags,
                seq_num: header.seq_num,
                action,
            });
            action
        }
        Err(_) => Action::Deliver,
    };

    match action {
        Action::Drop => {
            log::debug!("[sim] dropped frame ({direction:?})");
        }
        Action::Deliver => {
            let _ = out.send_to(datagram, dest).await;
        }
        Action::Duplicate => {
            log::debug!("[sim] duplicated frame ({direction:?})");
            let _ = out.send_to(datagram, dest).await;
            let _ = out.send_to(datagram, dest).await;
        }
    }
}
