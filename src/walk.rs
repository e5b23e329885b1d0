//! Walk reconciliation (spec.md §4.F): translates between a client's own
//! 8-bit walk sequence ring and the server's independent sequence space,
//! and arbitrates the single endpoint allowed to be "walking" at a time.

use std::collections::VecDeque;

use crate::net::endpoint::EndpointId;
use crate::protocol::packet::{Walk, WalkAck, WalkCancel};
use crate::world::World;

/// Bound on in-flight walk requests (spec.md §3 `WalkState`).
const MAX_QUEUE: usize = 4;

/// `(dx, dy)` per 8-direction facing, direction is the low 3 bits of the
/// `Walk`/`WalkCancel` direction byte (spec.md §4.F step 2).
const DELTA: [(i16, i16); 8] = [
    (0, -1),  // north
    (1, -1),  // right (NE)
    (1, 0),   // east
    (1, 1),   // down (SE)
    (0, 1),   // south
    (-1, 1),  // left (SW)
    (-1, 0),  // west
    (-1, -1), // up (NW)
];

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    owner: EndpointId,
    client_seq: u8,
    server_seq: u8,
    direction: u8,
}

#[derive(Debug, Default)]
pub struct WalkState {
    owner: Option<EndpointId>,
    queue: VecDeque<QueueEntry>,
    seq_next: u8,
}

/// What the reconciler wants the caller (session actor) to do in
/// response to one event.
pub enum WalkOutcome {
    /// Forward this (already sequence-rewritten) packet upstream.
    ForwardUpstream(Walk),
    /// Reply directly to one endpoint, nothing goes upstream.
    ReplyTo(EndpointId, WalkCancel),
    /// A cancel must be sent to the evicted owner, then the new request
    /// still proceeds upstream.
    EvictThenForward(EndpointId, WalkCancel, Walk),
    /// Disconnect this endpoint (not `IN_GAME` yet).
    Disconnect(EndpointId),
    /// Drop silently (e.g. reconnecting).
    Drop,
}

/// Result of processing an upstream `WalkAck`.
pub struct AckOutcome {
    pub reply_to_owner: Option<(EndpointId, WalkAck)>,
    pub broadcast_update: bool,
    /// Set when `seq` matched nothing queued: the session has lost sync
    /// with upstream and must send `Resynchronize` to recover (spec.md
    /// §4.F WalkAck step 1). The queue has already been cleared.
    pub resynchronize: bool,
}

impl WalkState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u8 {
        self.seq_next = self.seq_next.wrapping_add(1);
        if self.seq_next == 0 {
            self.seq_next = 1;
        }
        self.seq_next
    }

    /// Spec.md §4.F, client `Walk` request.
    pub fn on_client_walk(
        &mut self,
        endpoint: EndpointId,
        in_game: bool,
        reconnecting: bool,
        anchor: (u16, u16, i16, u8),
        mut pkt: Walk,
    ) -> WalkOutcome {
        if !in_game {
            return WalkOutcome::Disconnect(endpoint);
        }
        if reconnecting {
            return WalkOutcome::ReplyTo(
                endpoint,
                WalkCancel {
                    seq: pkt.seq,
                    x: anchor.0,
                    y: anchor.1,
                    direction: pkt.direction,
                    z: anchor.2 as i8,
                },
            );
        }
        if let Some(owner) = self.owner {
            if owner != endpoint {
                return WalkOutcome::ReplyTo(
                    endpoint,
                    WalkCancel {
                        seq: pkt.seq,
                        x: anchor.0,
                        y: anchor.1,
                        direction: pkt.direction,
                        z: anchor.2 as i8,
                    },
                );
            }
        }

        let evicted = if self.queue.len() >= MAX_QUEUE {
            self.queue.pop_front()
        } else {
            None
        };

        self.owner = Some(endpoint);
        let server_seq = self.next_seq();
        self.queue.push_back(QueueEntry {
            owner: endpoint,
            client_seq: pkt.seq,
            server_seq,
            direction: pkt.direction,
        });
        pkt.seq = server_seq;

        match evicted {
            Some(old) => WalkOutcome::EvictThenForward(
                old.owner,
                WalkCancel {
                    seq: old.client_seq,
                    x: anchor.0,
                    y: anchor.1,
                    direction: old.direction,
                    z: anchor.2 as i8,
                },
                pkt,
            ),
            None => WalkOutcome::ForwardUpstream(pkt),
        }
    }

    /// Spec.md §4.F, upstream `WalkAck`. Applies the step to `world` when
    /// the committed direction matches the queued one.
    pub fn on_upstream_ack(&mut self, ack: WalkAck, world: &mut World) -> AckOutcome {
        let Some(pos) = self.queue.iter().position(|e| e.server_seq == ack.seq) else {
            // Lost sync: the ack doesn't match anything we queued. Clear
            // the queue and tell the caller to resynchronize upstream
            // (spec.md §4.F WalkAck step 1).
            self.queue.clear();
            self.owner = None;
            return AckOutcome {
                reply_to_owner: None,
                broadcast_update: false,
                resynchronize: true,
            };
        };
        let entry = self.queue.remove(pos).expect("position just found");

        // `WalkAck` carries no direction of its own, so the "committed
        // direction matches the queued direction" check (spec.md §4.F
        // step 2) collapses to: this ack always confirms exactly the
        // direction we queued for it.
        let (dx, dy) = DELTA[(entry.direction & 0x07) as usize];
        let x = (world.player_anchor.x as i16 + dx) as u16;
        let y = (world.player_anchor.y as i16 + dy) as u16;
        world.apply_walked(x, y, entry.direction);

        if self.queue.is_empty() {
            self.owner = None;
        }

        AckOutcome {
            reply_to_owner: Some((
                entry.owner,
                WalkAck {
                    seq: entry.client_seq,
                    notoriety: ack.notoriety,
                },
            )),
            broadcast_update: true,
            resynchronize: false,
        }
    }

    /// Spec.md §4.F, upstream `WalkCancel`: resync and reply to whichever
    /// endpoint owned the cancelled sequence, if still queued.
    pub fn on_upstream_cancel(
        &mut self,
        cancel: WalkCancel,
    ) -> (Option<(EndpointId, WalkCancel)>, WalkCancel) {
        self.seq_next = 0;
        let reply = self
            .queue
            .iter()
            .find(|e| e.server_seq == cancel.seq)
            .map(|e| {
                (
                    e.owner,
                    WalkCancel {
                        seq: e.client_seq,
                        x: cancel.x,
                        y: cancel.y,
                        direction: cancel.direction,
                        z: cancel.z,
                    },
                )
            });
        self.queue.clear();
        self.owner = None;
        (reply, cancel)
    }

    /// Client `Resynchronize`: resets the server sequence counter.
    pub fn on_client_resynchronize(&mut self) {
        self.seq_next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(seq: u8, direction: u8) -> Walk {
        Walk {
            direction,
            seq,
            key: 0,
        }
    }

    #[test]
    fn first_walk_assigns_server_seq_one() {
        let mut ws = WalkState::new();
        match ws.on_client_walk(1, true, false, (100, 100, 0, 0), walk(1, 2)) {
            WalkOutcome::ForwardUpstream(p) => assert_eq!(p.seq, 1),
            _ => panic!("expected forward"),
        }
    }

    #[test]
    fn second_endpoint_is_cancelled_on_contention() {
        let mut ws = WalkState::new();
        ws.on_client_walk(1, true, false, (100, 100, 0, 0), walk(1, 2));
        match ws.on_client_walk(2, true, false, (100, 100, 0, 0), walk(1, 3)) {
            WalkOutcome::ReplyTo(ep, cancel) => {
                assert_eq!(ep, 2);
                assert_eq!(cancel.seq, 1);
            }
            _ => panic!("expected cancel reply"),
        }
    }

    #[test]
    fn queue_full_evicts_oldest() {
        let mut ws = WalkState::new();
        for i in 1..=4u8 {
            ws.on_client_walk(1, true, false, (100, 100, 0, 0), walk(i, 2));
        }
        match ws.on_client_walk(1, true, false, (100, 100, 0, 0), walk(5, 2)) {
            WalkOutcome::EvictThenForward(ep, cancel, fwd) => {
                assert_eq!(ep, 1);
                assert_eq!(cancel.seq, 1); // oldest client seq evicted
                assert!(fwd.seq > 0);
            }
            _ => panic!("expected evict+forward"),
        }
    }

    #[test]
    fn ack_steps_position_north() {
        let mut ws = WalkState::new();
        let mut world = World::new();
        world.player_anchor.x = 100;
        world.player_anchor.y = 100;
        ws.on_client_walk(1, true, false, (100, 100, 0, 0), walk(1, 0));
        let outcome = ws.on_upstream_ack(
            WalkAck {
                seq: 1,
                notoriety: 1,
            },
            &mut world,
        );
        assert_eq!(world.player_anchor.y, 99);
        assert!(outcome.reply_to_owner.is_some());
        assert_eq!(outcome.reply_to_owner.unwrap().1.seq, 1);
    }

    #[test]
    fn unknown_ack_seq_triggers_resynchronize_and_clears_queue() {
        let mut ws = WalkState::new();
        let mut world = World::new();
        ws.on_client_walk(1, true, false, (100, 100, 0, 0), walk(1, 0));
        let outcome = ws.on_upstream_ack(
            WalkAck {
                seq: 99,
                notoriety: 0,
            },
            &mut world,
        );
        assert!(outcome.reply_to_owner.is_none());
        assert!(!outcome.broadcast_update);
        assert!(outcome.resynchronize);
        assert!(ws.queue.is_empty());
        assert!(ws.owner.is_none());
    }
}
