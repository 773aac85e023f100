//! Per-leg packet resizing
//!
//! A [`Resizer`] owns the [`ResizeQueue`] for packets heading to one leg. While
//! output is produced at the same rate as input (upsizing, pass-through) the
//! relay drains it inline after every receive. Once a dequeue yields a packet
//! smaller than what was queued the resizer is downsizing and output has to be
//! spread over time, so a pacing task takes over draining the queue.

pub mod pacer;
pub mod queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ResizerCodec;
use crate::packet::RtpPacket;

pub use pacer::PacingClock;
pub use queue::ResizeQueue;

/// Destination for packets released by the pacing task
pub type PacketSink = Arc<dyn Fn(RtpPacket) + Send + Sync>;

struct PacerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Resizer {
    leg: u8,
    queue: Arc<Mutex<ResizeQueue>>,
    samples: Mutex<u32>,
    last_queued_size: AtomicUsize,
    pacer: Mutex<Option<PacerHandle>>,
}

impl std::fmt::Debug for Resizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resizer")
            .field("leg", &self.leg)
            .field("samples", &*self.samples.lock())
            .field("pacing", &self.is_pacing())
            .finish()
    }
}

impl Resizer {
    pub fn new(leg: u8, codec: ResizerCodec) -> Self {
        Self {
            leg,
            queue: Arc::new(Mutex::new(ResizeQueue::new(codec, 0))),
            samples: Mutex::new(0),
            last_queued_size: AtomicUsize::new(0),
            pacer: Mutex::new(None),
        }
    }

    pub fn leg(&self) -> u8 {
        self.leg
    }

    /// Set the output packetization in milliseconds; zero disables resizing
    pub fn set_samples(&self, samples_ms: u32) {
        self.stop();
        *self.samples.lock() = samples_ms;
        let mut queue = self.queue.lock();
        queue.set_target_time(samples_ms);
        if samples_ms == 0 {
            queue.clear();
        }
    }

    pub fn samples(&self) -> u32 {
        *self.samples.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.samples() > 0
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.queue.lock().set_verbose(verbose);
    }

    /// Pacing interval, one output packet per target duration
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples() as u64 * 1000)
    }

    pub fn is_pacing(&self) -> bool {
        self.pacer.lock().is_some()
    }

    pub fn enqueue(&self, packet: RtpPacket) -> bool {
        let size = packet.packet_size();
        if !self.queue.lock().enqueue(packet) {
            return false;
        }
        self.last_queued_size.store(size, Ordering::Relaxed);
        true
    }

    /// Inline drain used by the relay after each receive.
    ///
    /// Returns nothing while the pacing task owns the queue. The first packet
    /// that comes out smaller than the last queued one starts that task.
    pub fn dequeue(&self, sink: &PacketSink) -> Option<RtpPacket> {
        if self.is_pacing() {
            return None;
        }
        let packet = self.queue.lock().dequeue()?;
        if self.last_queued_size.load(Ordering::Relaxed) > packet.packet_size() {
            self.start_pacer(sink.clone());
        }
        Some(packet)
    }

    fn start_pacer(&self, sink: PacketSink) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(leg = self.leg, "no runtime available, resizer will not pace");
            return;
        };
        let mut slot = self.pacer.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let queue = Arc::clone(&self.queue);
        let mut clock = PacingClock::new(self.duration());
        let leg = self.leg;
        debug!(leg, interval_us = clock.duration_us(), "starting resizer pacing");

        let task = runtime.spawn(async move {
            loop {
                let wait = clock.next_wait();
                if !wait.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                } else if token.is_cancelled() {
                    break;
                }
                let next = queue.lock().dequeue();
                if let Some(packet) = next {
                    sink(packet);
                }
            }
            debug!(leg, "resizer pacing stopped");
        });
        *slot = Some(PacerHandle { cancel, task });
    }

    /// Cancel the pacing task; safe to call repeatedly
    pub fn stop(&self) {
        if let Some(handle) = self.pacer.lock().take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }
}

impl Drop for Resizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_sink() -> (PacketSink, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let sink: PacketSink = Arc::new(move |_p: RtpPacket| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (sink, count)
    }

    #[test]
    fn test_disabled_by_default() {
        let resizer = Resizer::new(1, ResizerCodec::pcmu());
        assert!(!resizer.is_enabled());
        assert!(!resizer.enqueue(RtpPacket::new(0, 1, 0, 1, &[0; 160])));
    }

    #[test]
    fn test_upsizing_stays_inline() {
        let resizer = Resizer::new(2, ResizerCodec::pcmu());
        resizer.set_samples(40);
        let (sink, _) = counting_sink();
        assert!(resizer.enqueue(RtpPacket::new(0, 1, 0, 1, &[0; 160])));
        assert!(resizer.dequeue(&sink).is_none());
        assert!(resizer.enqueue(RtpPacket::new(0, 2, 160, 1, &[0; 160])));
        let out = resizer.dequeue(&sink).unwrap();
        assert_eq!(out.payload_size(), 320);
        assert!(!resizer.is_pacing());
    }

    #[tokio::test]
    async fn test_downsizing_starts_pacer_and_drains() {
        let resizer = Resizer::new(1, ResizerCodec::pcmu());
        resizer.set_samples(20);
        let (sink, count) = counting_sink();
        assert!(resizer.enqueue(RtpPacket::new(0, 7, 0, 1, &[0; 640])));

        let first = resizer.dequeue(&sink).unwrap();
        assert_eq!(first.payload_size(), 160);
        assert!(resizer.is_pacing());
        // inline drain yields nothing while pacing
        assert!(resizer.dequeue(&sink).is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        resizer.stop();
        assert!(!resizer.is_pacing());
        resizer.stop();
    }

    #[tokio::test]
    async fn test_set_samples_stops_pacing() {
        let resizer = Resizer::new(1, ResizerCodec::pcmu());
        resizer.set_samples(20);
        let (sink, _) = counting_sink();
        resizer.enqueue(RtpPacket::new(0, 7, 0, 1, &[0; 640]));
        resizer.dequeue(&sink);
        assert!(resizer.is_pacing());
        resizer.set_samples(0);
        assert!(!resizer.is_pacing());
        assert!(!resizer.is_enabled());
    }
}
