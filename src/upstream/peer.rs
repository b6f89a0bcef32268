use crate::config::UpstreamConfig;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome the caller reports when releasing a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFreeState {
    Ok,
    Failed,
    /// The exchange worked but the response asked for the next peer
    /// (intercepted status); the peer is not charged a failure.
    NextPreferred,
}

/// One configured peer.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    pub weight: i64,
    pub max_fails: u32,
    pub fail_timeout: Duration,
    pub down: bool,
    pub backup: bool,
}

/// Mutable per-peer accounting, guarded by the set-wide lock. The failure
/// counters implement the `fail_timeout` sliding window: `fails` accumulate
/// while the window is open and reset when it expires or on success.
#[derive(Debug, Default)]
struct PeerState {
    current_weight: i64,
    effective_weight: i64,
    fails: u32,
    checked: Option<Instant>,
}

/// Per-request selection context: which peers this request has already
/// tried, as a bitmask (one bit per peer, peers are bounded per group).
#[derive(Debug)]
pub struct PeerCtx {
    tried: u64,
    /// Peers tried during this request, for diagnostics.
    pub attempts: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SelectError {
    /// Every candidate is down, failed-out, or already tried.
    NoLive,
}

/// A selected peer; pass `index` back to [`PeerSet::free`].
#[derive(Debug, Clone, Copy)]
pub struct PeerSelection {
    pub index: usize,
    pub addr: SocketAddr,
}

/// One upstream group with smooth weighted round-robin selection and
/// shared failure accounting. The state is process-global (one `PeerSet`
/// per group, shared by every request via `Arc`).
pub struct PeerSet {
    pub name: String,
    peers: Vec<Peer>,
    primary_count: usize,
    state: Mutex<Vec<PeerState>>,
}

impl PeerSet {
    pub fn build(config: &UpstreamConfig) -> Result<Self> {
        let mut primaries = Vec::new();
        let mut backups = Vec::new();
        for server in &config.server {
            let peer = Peer {
                addr: server
                    .addr
                    .parse()
                    .with_context(|| format!("peer address '{}'", server.addr))?,
                weight: i64::from(server.weight),
                max_fails: server.max_fails,
                fail_timeout: server.fail_timeout,
                down: server.down,
                backup: server.backup,
            };
            if peer.backup {
                backups.push(peer);
            } else {
                primaries.push(peer);
            }
        }
        let primary_count = primaries.len();
        let peers: Vec<Peer> = primaries.into_iter().chain(backups).collect();
        if peers.len() > 64 {
            anyhow::bail!("upstream '{}': at most 64 peers per group", config.name);
        }

        let state = peers
            .iter()
            .map(|p| PeerState {
                effective_weight: p.weight,
                ..PeerState::default()
            })
            .collect();

        Ok(Self {
            name: config.name.clone(),
            peers,
            primary_count,
            state: Mutex::new(state),
        })
    }

    pub fn init(&self) -> PeerCtx {
        PeerCtx {
            tried: 0,
            attempts: 0,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Select the next peer for this request. Primaries are preferred;
    /// backups are considered only when no primary is usable.
    pub fn get(&self, ctx: &mut PeerCtx) -> Result<PeerSelection, SelectError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // A single-peer group ignores failure accounting: there is nothing
        // to fail over to, so the peer is always worth one more attempt.
        if self.peers.len() == 1 {
            if ctx.tried & 1 != 0 || self.peers[0].down {
                return Err(SelectError::NoLive);
            }
            ctx.tried |= 1;
            ctx.attempts += 1;
            return Ok(PeerSelection {
                index: 0,
                addr: self.peers[0].addr,
            });
        }

        for range in [0..self.primary_count, self.primary_count..self.peers.len()] {
            if let Some(index) = self.pick_smooth(&mut state, range, ctx, now) {
                ctx.tried |= 1 << index;
                ctx.attempts += 1;
                return Ok(PeerSelection {
                    index,
                    addr: self.peers[index].addr,
                });
            }
        }

        Err(SelectError::NoLive)
    }

    /// Release a peer, updating the failure window.
    pub fn free(&self, _ctx: &mut PeerCtx, index: usize, outcome: PeerFreeState) {
        let mut state = self.state.lock().unwrap();
        let peer = &self.peers[index];
        let st = &mut state[index];
        match outcome {
            PeerFreeState::Ok => {
                st.fails = 0;
                st.checked = None;
                if st.effective_weight < peer.weight {
                    st.effective_weight += 1;
                }
            }
            PeerFreeState::Failed => {
                st.fails = st.fails.saturating_add(1);
                st.checked = Some(Instant::now());
                st.effective_weight = (st.effective_weight - peer.weight).max(1);
            }
            PeerFreeState::NextPreferred => {}
        }
    }

    /// True when the peer is inside its failure window.
    fn failed_out(&self, st: &PeerState, peer: &Peer, now: Instant) -> bool {
        if peer.max_fails == 0 || st.fails < peer.max_fails {
            return false;
        }
        match st.checked {
            Some(at) => now.duration_since(at) < peer.fail_timeout,
            None => false,
        }
    }

    fn pick_smooth(
        &self,
        state: &mut [PeerState],
        range: std::ops::Range<usize>,
        ctx: &PeerCtx,
        now: Instant,
    ) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut total = 0i64;

        for i in range {
            let peer = &self.peers[i];
            if peer.down || ctx.tried & (1 << i) != 0 {
                continue;
            }
            if self.failed_out(&state[i], peer, now) {
                continue;
            }
            state[i].current_weight += state[i].effective_weight;
            total += state[i].effective_weight;
            match best {
                Some(b) if state[b].current_weight >= state[i].current_weight => {}
                _ => best = Some(i),
            }
        }

        if let Some(b) = best {
            state[b].current_weight -= total;
        }
        best
    }
}
