//! Re-packetization queue
//!
//! Frames whose payload is a multiple of the codec's base frame are held in an
//! inbound queue and re-emitted at the target packetization: several small
//! frames are concatenated (upsizing) or a large frame is sliced (downsizing).
//! Anything that cannot be resized passes straight to the outbound queue.
//! Every dequeued packet gets the next sequence number of the output stream.

use std::collections::VecDeque;

use tracing::trace;

use crate::config::ResizerCodec;
use crate::packet::RtpPacket;

/// Default bound on queued frames before enqueue refuses new ones
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// True if timestamp `a` is older than `b` in RTP serial arithmetic
fn ts_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[derive(Debug)]
pub struct ResizeQueue {
    codec: ResizerCodec,
    target_time_ms: u32,
    capacity: usize,
    inbound: VecDeque<RtpPacket>,
    outbound: VecDeque<RtpPacket>,
    last_sequence: Option<u16>,
    last_time_sent: Option<u32>,
    verbose: bool,
}

impl ResizeQueue {
    pub fn new(codec: ResizerCodec, target_time_ms: u32) -> Self {
        Self {
            codec,
            target_time_ms,
            capacity: DEFAULT_QUEUE_CAPACITY,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            last_sequence: None,
            last_time_sent: None,
            verbose: false,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn set_target_time(&mut self, target_time_ms: u32) {
        self.target_time_ms = target_time_ms;
    }

    pub fn target_time(&self) -> u32 {
        self.target_time_ms
    }

    pub fn codec(&self) -> ResizerCodec {
        self.codec
    }

    /// Payload bytes of one output packet
    pub fn target_size(&self) -> usize {
        if self.codec.base_time_ms == 0 {
            return 0;
        }
        (self.target_time_ms / self.codec.base_time_ms) as usize * self.codec.base_sample_size
    }

    pub fn len(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
        self.last_sequence = None;
        self.last_time_sent = None;
    }

    /// Queue a frame.
    ///
    /// Returns false when the frame is of another payload type or the queue is
    /// full; the caller must then relay the original packet itself.
    pub fn enqueue(&mut self, packet: RtpPacket) -> bool {
        if packet.payload_type() != self.codec.payload_type {
            return false;
        }
        if self.len() >= self.capacity {
            if self.verbose {
                trace!(queued = self.len(), "resize queue full");
            }
            return false;
        }
        let target = self.target_size();
        if target == 0 || self.codec.base_sample_size == 0 {
            return false;
        }

        if self.last_sequence.is_none() {
            self.last_sequence = Some(packet.sequence_number().wrapping_sub(1));
        }

        let size = packet.payload_size();
        if size % self.codec.base_sample_size != 0 || size == target {
            self.outbound.push_back(packet);
        } else {
            self.inbound.push_back(packet);
        }
        true
    }

    /// Next packet of the output stream, if one is ready
    pub fn dequeue(&mut self) -> Option<RtpPacket> {
        if !self.outbound.is_empty() {
            return self.pop_outbound();
        }

        while let (Some(front), Some(last)) = (self.inbound.front(), self.last_time_sent) {
            if ts_before(front.timestamp(), last) {
                if self.verbose {
                    trace!(ts = front.timestamp(), last, "dropping late frame");
                }
                self.inbound.pop_front();
            } else {
                break;
            }
        }

        let front_size = self.inbound.front()?.payload_size();
        let target = self.target_size();
        if target == 0 {
            return None;
        }

        if target < front_size {
            let packet = self.inbound.pop_front()?;
            if front_size % target != 0 {
                self.outbound.push_back(packet);
            } else {
                let count = front_size / target;
                let step = (target / self.codec.base_sample_size) as u32 * self.codec.clock_rate;
                let payload = packet.payload().to_vec();
                for (i, chunk) in payload.chunks(target).take(count).enumerate() {
                    let mut slice = packet.clone();
                    slice.set_timestamp(packet.timestamp().wrapping_add(step.wrapping_mul(i as u32)));
                    slice.set_payload(chunk);
                    if i > 0 {
                        slice.set_marker(false);
                    }
                    self.outbound.push_back(slice);
                }
            }
        } else {
            let required = (target / front_size.max(1)).max(1);
            if self.inbound.len() >= required {
                let mut combined = Vec::with_capacity(target);
                let mut first: Option<RtpPacket> = None;
                for _ in 0..required {
                    if let Some(frame) = self.inbound.pop_front() {
                        combined.extend_from_slice(frame.payload());
                        if first.is_none() {
                            first = Some(frame);
                        }
                    }
                }
                if let Some(mut packet) = first {
                    packet.set_payload(&combined);
                    self.outbound.push_back(packet);
                }
            }
        }

        self.pop_outbound()
    }

    fn pop_outbound(&mut self) -> Option<RtpPacket> {
        let mut packet = self.outbound.pop_front()?;
        let seq = self
            .last_sequence
            .unwrap_or_else(|| packet.sequence_number().wrapping_sub(1))
            .wrapping_add(1);
        self.last_sequence = Some(seq);
        self.last_time_sent = Some(packet.timestamp());
        packet.set_sequence_number(seq);
        Some(packet)
    }
}
