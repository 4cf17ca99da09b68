//! The reliable, ordered control channel for one peer.
//!
//! Outbound messages are split into fixed-size fragments identified by
//! `(message seq, fragment index)`. The receiver acknowledges every fragment
//! it sees, reassembles messages, and releases them strictly in message-
//! sequence order. The sender retransmits unacknowledged fragments on a
//! short timer, at most a window's worth at a time so a multi-megabyte
//! snapshot cannot flood the link in one burst.

use std::collections::BTreeMap;

use tracing::{trace, warn};
use web_time::{Duration, Instant};

use super::{Envelope, MAX_CONTROL_MESSAGE};

/// Payload bytes per fragment. Keeps every datagram comfortably under
/// typical MTUs once the envelope overhead is added.
pub(crate) const FRAGMENT_PAYLOAD: usize = 1024;

const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);
const SEND_WINDOW: usize = 64;

#[derive(Debug)]
struct OutboundMessage {
    seq: u32,
    count: u16,
    /// `None` once the fragment has been acknowledged.
    fragments: Vec<Option<Vec<u8>>>,
    unacked: usize,
}

#[derive(Debug)]
struct InboundMessage {
    count: u16,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
}

#[derive(Debug)]
pub(crate) struct ReliableChannel {
    next_tx_seq: u32,
    outbound: Vec<OutboundMessage>,
    next_resend: Instant,
    next_rx_seq: u32,
    partial: BTreeMap<u32, InboundMessage>,
}

impl ReliableChannel {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            next_tx_seq: 0,
            outbound: Vec::new(),
            next_resend: now,
            next_rx_seq: 0,
            partial: BTreeMap::new(),
        }
    }

    /// Queues one message for reliable delivery.
    pub(crate) fn enqueue(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_CONTROL_MESSAGE);
        let count = bytes.len().div_ceil(FRAGMENT_PAYLOAD).max(1);
        let fragments: Vec<Option<Vec<u8>>> = if bytes.is_empty() {
            vec![Some(Vec::new())]
        } else {
            bytes
                .chunks(FRAGMENT_PAYLOAD)
                .map(|chunk| Some(chunk.to_vec()))
                .collect()
        };
        self.outbound.push(OutboundMessage {
            seq: self.next_tx_seq,
            count: count as u16,
            unacked: fragments.len(),
            fragments,
        });
        self.next_tx_seq = self.next_tx_seq.wrapping_add(1);
    }

    /// Returns the fragments to put on the wire now: up to one window of
    /// unacknowledged fragments, either because new data was queued
    /// (`force`) or because the retransmit timer fired.
    pub(crate) fn take_transmits(&mut self, now: Instant, force: bool) -> Vec<Envelope> {
        if !force && now < self.next_resend {
            return Vec::new();
        }
        let mut out = Vec::new();
        'fill: for message in &self.outbound {
            for (index, fragment) in message.fragments.iter().enumerate() {
                let Some(payload) = fragment else { continue };
                out.push(Envelope::Fragment {
                    seq: message.seq,
                    index: index as u16,
                    count: message.count,
                    payload: payload.clone(),
                });
                if out.len() >= SEND_WINDOW {
                    break 'fill;
                }
            }
        }
        if !out.is_empty() {
            self.next_resend = now + RETRANSMIT_INTERVAL;
        }
        out
    }

    /// Processes a fragment acknowledgement from the remote.
    pub(crate) fn on_ack(&mut self, seq: u32, index: u16) {
        if let Some(message) = self.outbound.iter_mut().find(|m| m.seq == seq) {
            if let Some(slot) = message.fragments.get_mut(index as usize) {
                if slot.take().is_some() {
                    message.unacked -= 1;
                }
            }
        }
        self.outbound.retain(|m| m.unacked > 0);
    }

    /// Processes one received fragment. Pushes the acknowledgement to send
    /// into `acks` and any fully reassembled, in-order messages into
    /// `completed`.
    pub(crate) fn on_fragment(
        &mut self,
        seq: u32,
        index: u16,
        count: u16,
        payload: Vec<u8>,
        acks: &mut Vec<Envelope>,
        completed: &mut Vec<Vec<u8>>,
    ) {
        // ack unconditionally: even duplicates need their ack re-sent in case
        // the first ack was lost
        acks.push(Envelope::FragmentAck { seq, index });

        if seq < self.next_rx_seq {
            trace!(seq, index, "duplicate fragment for delivered message");
            return;
        }
        if count == 0 || index >= count || payload.len() > FRAGMENT_PAYLOAD {
            warn!(seq, index, count, len = payload.len(), "malformed fragment dropped");
            return;
        }
        if count as usize * FRAGMENT_PAYLOAD > MAX_CONTROL_MESSAGE {
            warn!(seq, count, "fragment declares oversized message, dropped");
            return;
        }

        if let Some(existing) = self.partial.get(&seq) {
            if existing.count != count {
                warn!(seq, "fragment count mismatch, dropping message state");
                self.partial.remove(&seq);
                return;
            }
        }
        let entry = self.partial.entry(seq).or_insert_with(|| InboundMessage {
            count,
            fragments: vec![None; count as usize],
            received: 0,
        });
        if let Some(slot) = entry.fragments.get_mut(index as usize) {
            if slot.is_none() {
                *slot = Some(payload);
                entry.received += 1;
            }
        }

        // release complete messages strictly in sequence order
        while let Some(head) = self.partial.get(&self.next_rx_seq) {
            if head.received as u16 != head.count {
                break;
            }
            let Some(head) = self.partial.remove(&self.next_rx_seq) else {
                break;
            };
            let mut bytes = Vec::new();
            for fragment in head.fragments.into_iter().flatten() {
                bytes.extend_from_slice(&fragment);
            }
            completed.push(bytes);
            self.next_rx_seq = self.next_rx_seq.wrapping_add(1);
        }
    }

    #[cfg(test)]
    fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag_parts(env: &Envelope) -> (u32, u16, u16, Vec<u8>) {
        match env {
            Envelope::Fragment {
                seq,
                index,
                count,
                payload,
            } => (*seq, *index, *count, payload.clone()),
            other => panic!("expected fragment, got {other:?}"),
        }
    }

    fn shuttle(tx: &mut ReliableChannel, rx: &mut ReliableChannel, now: Instant) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        loop {
            let frames = tx.take_transmits(now, true);
            if frames.is_empty() {
                break;
            }
            for frame in frames {
                let (seq, index, count, payload) = frag_parts(&frame);
                let mut acks = Vec::new();
                rx.on_fragment(seq, index, count, payload, &mut acks, &mut delivered);
                for ack in acks {
                    if let Envelope::FragmentAck { seq, index } = ack {
                        tx.on_ack(seq, index);
                    }
                }
            }
        }
        delivered
    }

    #[test]
    fn small_message_single_fragment() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new(now);
        let mut rx = ReliableChannel::new(now);
        tx.enqueue(b"hello");
        let delivered = shuttle(&mut tx, &mut rx, now);
        assert_eq!(delivered, vec![b"hello".to_vec()]);
        assert_eq!(tx.pending_outbound(), 0);
    }

    #[test]
    fn large_message_reassembles() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new(now);
        let mut rx = ReliableChannel::new(now);
        let message: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        tx.enqueue(&message);
        let delivered = shuttle(&mut tx, &mut rx, now);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], message);
    }

    #[test]
    fn out_of_order_fragments_deliver_in_order() {
        let now = Instant::now();
        let mut rx = ReliableChannel::new(now);
        let mut acks = Vec::new();
        let mut completed = Vec::new();

        // second message arrives entirely before the first
        rx.on_fragment(1, 0, 1, b"two".to_vec(), &mut acks, &mut completed);
        assert!(completed.is_empty());
        rx.on_fragment(0, 0, 1, b"one".to_vec(), &mut acks, &mut completed);
        assert_eq!(completed, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn duplicate_fragment_is_acked_but_not_redelivered() {
        let now = Instant::now();
        let mut rx = ReliableChannel::new(now);
        let mut acks = Vec::new();
        let mut completed = Vec::new();

        rx.on_fragment(0, 0, 1, b"x".to_vec(), &mut acks, &mut completed);
        rx.on_fragment(0, 0, 1, b"x".to_vec(), &mut acks, &mut completed);
        assert_eq!(completed.len(), 1);
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn retransmit_waits_for_timer() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new(now);
        tx.enqueue(b"data");
        assert_eq!(tx.take_transmits(now, true).len(), 1);
        // unacked, but the timer has not fired
        assert!(tx.take_transmits(now, false).is_empty());
        // after the interval the fragment goes out again
        let later = now + RETRANSMIT_INTERVAL + Duration::from_millis(1);
        assert_eq!(tx.take_transmits(later, false).len(), 1);
    }

    #[test]
    fn send_window_bounds_a_burst() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new(now);
        let message = vec![0u8; FRAGMENT_PAYLOAD * SEND_WINDOW * 3];
        tx.enqueue(&message);
        assert_eq!(tx.take_transmits(now, true).len(), SEND_WINDOW);
    }

    #[test]
    fn malformed_fragment_is_dropped() {
        let now = Instant::now();
        let mut rx = ReliableChannel::new(now);
        let mut acks = Vec::new();
        let mut completed = Vec::new();

        // index beyond count
        rx.on_fragment(0, 5, 2, Vec::new(), &mut acks, &mut completed);
        // zero count
        rx.on_fragment(0, 0, 0, Vec::new(), &mut acks, &mut completed);
        assert!(completed.is_empty());
    }

    #[test]
    fn empty_message_roundtrips() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new(now);
        let mut rx = ReliableChannel::new(now);
        tx.enqueue(&[]);
        let delivered = shuttle(&mut tx, &mut rx, now);
        assert_eq!(delivered, vec![Vec::<u8>::new()]);
    }
}
