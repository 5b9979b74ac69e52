//! Abortable packet FIFO that doubles as the pacing clock.
//!
//! Each elementary stream gets one queue: the demuxer worker enqueues
//! compressed packets and the player worker pulls decoded frames out of
//! [`PacketQueue::sync`], which couples decode-ahead with wall-clock pacing
//! and, for video, alignment against the audio clock. Keeping the data
//! channel, the clock and the abortable blocking in one primitive avoids
//! external locking around the seek drain protocol.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::demux::{Decode, Packet};
use crate::frame::Timed;

/// Drift tolerated between a frame and the master clock before the frame
/// is dropped (late) or delayed (early).
const SYNC_SLACK: f64 = 0.040;

/// Pacing interval when no frame-rate hint and no usable pts delta exist.
const FALLBACK_INTERVAL: f64 = 1.0 / 30.0;

/// Upper bound for a single blocking wait inside `sync` and `dequeue`.
const WAIT_TIMEOUT: Duration = Duration::from_millis(10);

enum Pace {
    Ready,
    Drop,
    Wait(Duration),
}

/// Wall-clock pacer. Frames are due one pts delta apart, scaled by the
/// playback speed; a pts discontinuity (seek, stream restart) falls back
/// to the nominal frame interval.
#[derive(Default)]
struct PaceClock {
    last_pts: Option<f64>,
    last_instant: Option<Instant>,
}

impl PaceClock {
    fn check(&mut self, pts: f64, speed: f64, master: Option<f64>, frame_rate: f64) -> Pace {
        if let Some(master) = master.filter(|m| *m > 0.0) {
            let diff = pts - master;
            if diff < -SYNC_SLACK {
                return Pace::Drop;
            }
            if diff > SYNC_SLACK {
                let delay = Duration::from_secs_f64((diff - SYNC_SLACK) / speed);
                return Pace::Wait(delay.min(WAIT_TIMEOUT));
            }
            self.mark(pts);
            return Pace::Ready;
        }

        let nominal = if frame_rate > 0.0 {
            1.0 / frame_rate
        } else {
            FALLBACK_INTERVAL
        };
        let delta = match self.last_pts {
            Some(prev) => pts - prev,
            None => 0.0,
        };
        let interval = if delta > 0.0 && delta <= nominal * 4.0 {
            delta / speed
        } else {
            nominal / speed
        };

        match self.last_instant {
            None => {
                self.mark(pts);
                Pace::Ready
            }
            Some(at) => {
                let elapsed = at.elapsed().as_secs_f64();
                if elapsed >= interval {
                    self.mark(pts);
                    Pace::Ready
                } else {
                    Pace::Wait(Duration::from_secs_f64(interval - elapsed))
                }
            }
        }
    }

    fn mark(&mut self, pts: f64) {
        self.last_pts = Some(pts);
        self.last_instant = Some(Instant::now());
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct Inner<P, F> {
    packets: VecDeque<P>,
    bytes: usize,
    finished: bool,
    aborted: bool,
    frame_rate: f64,
    decoder: Option<Box<dyn Decode<P, F> + Send>>,
    decoded: VecDeque<F>,
    /// Pts of the frame handed out by `sync` and not yet committed by `pop`.
    in_flight: Option<f64>,
    last_pts: f64,
    clock: PaceClock,
}

/// Single-producer/single-consumer FIFO of demuxed packets that hands
/// decoded, pace-synchronized frames to its consumer.
pub struct PacketQueue<P, F> {
    inner: Mutex<Inner<P, F>>,
    consumer: Condvar,
    producer: Condvar,
}

impl<P: Packet, F: Timed> PacketQueue<P, F> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                packets: VecDeque::new(),
                bytes: 0,
                finished: false,
                aborted: false,
                frame_rate: 0.0,
                decoder: None,
                decoded: VecDeque::new(),
                in_flight: None,
                last_pts: 0.0,
                clock: PaceClock::default(),
            }),
            consumer: Condvar::new(),
            producer: Condvar::new(),
        }
    }

    /// Appends a packet and wakes one consumer. Re-opens a queue that was
    /// marked finished: a seek or a new generation restarts the stream.
    pub fn enqueue(&self, packet: P) {
        let mut q = self.inner.lock();
        if q.aborted {
            return;
        }
        q.bytes += packet.size();
        q.packets.push_back(packet);
        q.finished = false;
        self.consumer.notify_one();
    }

    /// Blocks until a packet is available, the queue is aborted or
    /// finished-and-empty, or `timeout` elapses.
    pub fn dequeue(&self, timeout: Duration) -> Option<P> {
        let mut q = self.inner.lock();
        if q.packets.is_empty() && !q.aborted && !q.finished {
            self.consumer.wait_for(&mut q, timeout);
        }
        if q.aborted {
            return None;
        }
        let packet = q.packets.pop_front()?;
        q.bytes = q.bytes.saturating_sub(packet.size());
        if q.packets.is_empty() {
            self.producer.notify_all();
        }
        Some(packet)
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Whether the packet FIFO is drained; decoded frames may still be
    /// pending on the consumer side.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().packets.is_empty()
    }

    /// Heuristic fullness: roughly one second of packets when the frame
    /// rate is known, else a fixed packet count.
    pub fn enough(&self) -> bool {
        let q = self.inner.lock();
        let threshold = if q.frame_rate > 0.0 {
            (q.frame_rate.ceil() as usize).max(1)
        } else {
            100
        };
        q.packets.len() >= threshold
    }

    /// Drops queued packets and decoded frames, flushes the decoder and
    /// resets the pacing clock and the emitted pts (a cleared stream has
    /// not presented anything yet, so it must not act as a master clock).
    /// Leaves the `finished`/`aborted` flags untouched.
    pub fn clear(&self) {
        let mut q = self.inner.lock();
        q.packets.clear();
        q.bytes = 0;
        q.decoded.clear();
        q.in_flight = None;
        if let Some(decoder) = q.decoder.as_mut() {
            decoder.flush();
        }
        q.last_pts = 0.0;
        q.clock.reset();
        self.producer.notify_all();
        self.consumer.notify_all();
    }

    /// Producer-side barrier: blocks until the consumer has fully drained
    /// the queue, including frames handed out by `sync` but not yet
    /// committed by `pop`.
    pub fn wait_for_empty(&self) {
        let mut q = self.inner.lock();
        while !(q.packets.is_empty() && q.decoded.is_empty() && q.in_flight.is_none()) {
            if q.aborted {
                return;
            }
            self.producer.wait_for(&mut q, WAIT_TIMEOUT);
        }
    }

    /// Marks the stream terminal: no more packets will arrive until a seek
    /// or a new generation re-opens it.
    pub fn finish(&self) {
        let mut q = self.inner.lock();
        q.finished = true;
        self.consumer.notify_all();
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Unblocks all waiters; subsequent operations are no-ops until the
    /// queue is [`PacketQueue::reset`] by a new generation.
    pub fn abort(&self) {
        let mut q = self.inner.lock();
        q.aborted = true;
        self.consumer.notify_all();
        self.producer.notify_all();
    }

    /// Fresh state for a new generation: clears packets, frames, flags,
    /// the decoder and the emitted-pts marker.
    pub fn reset(&self) {
        let mut q = self.inner.lock();
        q.packets.clear();
        q.bytes = 0;
        q.finished = false;
        q.aborted = false;
        q.decoder = None;
        q.decoded.clear();
        q.in_flight = None;
        q.last_pts = 0.0;
        q.clock.reset();
    }

    /// Wakes consumer and producer waiters so they re-check the gate.
    pub fn wake_all(&self) {
        self.consumer.notify_all();
        self.producer.notify_all();
    }

    pub fn set_frame_rate(&self, frame_rate: f64) {
        self.inner.lock().frame_rate = frame_rate;
    }

    pub fn set_decoder(&self, decoder: Box<dyn Decode<P, F> + Send>) {
        self.inner.lock().decoder = Some(decoder);
    }

    /// Last emitted presentation timestamp, in seconds.
    pub fn pts(&self) -> f64 {
        self.inner.lock().last_pts
    }

    /// Commits the frame returned by the last `sync`, advancing the
    /// emitted pts.
    pub fn pop(&self) {
        let mut q = self.inner.lock();
        if let Some(pts) = q.in_flight.take() {
            q.last_pts = pts;
        }
        if q.packets.is_empty() && q.decoded.is_empty() {
            self.producer.notify_all();
        }
    }

    /// Returns the next frame once it is due.
    ///
    /// Decodes ahead from queued packets, then paces the front frame
    /// against wall-clock scaled by `speed`, or against `master` (the
    /// audio clock) within a small slack window: late frames are dropped,
    /// early frames delay. Blocks at most one pacing interval and returns
    /// promptly on abort or wake. The returned frame must be committed
    /// with [`PacketQueue::pop`] after it has been emitted.
    pub fn sync(&self, speed: f64, master: Option<f64>) -> Option<F> {
        let mut q = self.inner.lock();
        loop {
            if q.aborted {
                return None;
            }
            if q.decoded.is_empty() {
                let Some(packet) = q.packets.pop_front() else {
                    if q.finished {
                        return None;
                    }
                    self.consumer.wait_for(&mut q, WAIT_TIMEOUT);
                    if q.aborted || q.packets.is_empty() {
                        return None;
                    }
                    continue;
                };
                q.bytes = q.bytes.saturating_sub(packet.size());
                if q.packets.is_empty() {
                    self.producer.notify_all();
                }
                if let Some(decoder) = q.decoder.as_mut() {
                    let frames = decoder.decode(&packet);
                    q.decoded.extend(frames);
                }
                continue;
            }

            let pts = q.decoded.front().map(Timed::pts)?;
            let frame_rate = q.frame_rate;
            match q.clock.check(pts, speed, master, frame_rate) {
                Pace::Ready => {
                    let frame = q.decoded.pop_front();
                    q.in_flight = Some(pts);
                    return frame;
                }
                Pace::Drop => {
                    q.decoded.pop_front();
                }
                Pace::Wait(delay) => {
                    self.consumer.wait_for(&mut q, delay);
                    return None;
                }
            }
        }
    }
}

impl<P: Packet, F: Timed> Default for PacketQueue<P, F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct TestPacket {
        pts: f64,
        size: usize,
    }

    impl Packet for TestPacket {
        fn stream_index(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            self.size
        }
    }

    struct TestFrame {
        pts: f64,
    }

    impl Timed for TestFrame {
        fn pts(&self) -> f64 {
            self.pts
        }
    }

    struct TestDecoder;

    impl Decode<TestPacket, TestFrame> for TestDecoder {
        fn decode(&mut self, packet: &TestPacket) -> Vec<TestFrame> {
            vec![TestFrame { pts: packet.pts }]
        }

        fn flush(&mut self) {}
    }

    fn packet(pts: f64) -> TestPacket {
        TestPacket { pts, size: 512 }
    }

    fn queue() -> PacketQueue<TestPacket, TestFrame> {
        let q = PacketQueue::new();
        q.set_decoder(Box::new(TestDecoder));
        q
    }

    #[test]
    fn byte_accounting_tracks_packets() {
        let q = queue();
        q.enqueue(packet(0.0));
        q.enqueue(packet(0.04));
        q.enqueue(packet(0.08));
        assert_eq!(q.bytes(), 1536);

        let popped = q.dequeue(Duration::from_millis(10)).unwrap();
        assert_eq!(popped.pts, 0.0);
        assert_eq!(q.bytes(), 1024);
    }

    #[test]
    fn dequeue_preserves_container_order() {
        let q = queue();
        for i in 0..5 {
            q.enqueue(packet(i as f64 * 0.04));
        }
        for i in 0..5 {
            let p = q.dequeue(Duration::from_millis(10)).unwrap();
            assert!((p.pts - i as f64 * 0.04).abs() < 1e-9);
        }
    }

    #[test]
    fn finished_queue_drains_then_reports_eof() {
        let q = queue();
        q.enqueue(packet(0.0));
        q.finish();
        assert!(q.finished());

        assert!(q.dequeue(Duration::from_millis(10)).is_some());
        let started = Instant::now();
        assert!(q.dequeue(Duration::from_secs(1)).is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn sync_reports_eof_promptly_when_finished() {
        let q = queue();
        q.enqueue(packet(0.0));
        q.finish();

        assert!(q.sync(1.0, None).is_some());
        q.pop();

        let started = Instant::now();
        assert!(q.sync(1.0, None).is_none());
        assert!(started.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn enqueue_reopens_a_finished_queue() {
        let q = queue();
        q.finish();
        q.enqueue(packet(0.0));
        assert!(!q.finished());
    }

    #[test]
    fn abort_unblocks_a_waiting_consumer() {
        let q = Arc::new(queue());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let started = Instant::now();
                let packet = q.dequeue(Duration::from_secs(5));
                (packet.is_none(), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(30));
        q.abort();
        let (got_none, blocked_for) = consumer.join().unwrap();
        assert!(got_none);
        assert!(blocked_for < Duration::from_secs(1));
    }

    #[test]
    fn operations_are_noops_after_abort() {
        let q = queue();
        q.abort();
        q.enqueue(packet(0.0));
        assert_eq!(q.bytes(), 0);
        assert!(q.sync(1.0, None).is_none());

        q.reset();
        q.set_decoder(Box::new(TestDecoder));
        q.enqueue(packet(0.0));
        assert_eq!(q.bytes(), 512);
        assert!(q.sync(1.0, None).is_some());
    }

    #[test]
    fn enough_follows_the_frame_rate_hint() {
        let q = queue();
        q.set_frame_rate(4.0);
        for i in 0..3 {
            q.enqueue(packet(i as f64 * 0.25));
        }
        assert!(!q.enough());
        q.enqueue(packet(0.75));
        assert!(q.enough());
    }

    #[test]
    fn first_frame_is_ready_immediately() {
        let q = queue();
        q.enqueue(packet(0.0));
        let started = Instant::now();
        let frame = q.sync(1.0, None);
        assert!(frame.is_some());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn sync_paces_consecutive_frames_by_pts_delta() {
        let q = queue();
        q.set_frame_rate(20.0);
        q.enqueue(packet(0.0));
        q.enqueue(packet(0.05));

        let started = Instant::now();
        assert!(q.sync(1.0, None).is_some());
        q.pop();

        let mut second = None;
        while second.is_none() && started.elapsed() < Duration::from_secs(1) {
            second = q.sync(1.0, None);
        }
        let frame = second.expect("second frame never became due");
        q.pop();
        assert!((frame.pts - 0.05).abs() < 1e-9);
        assert!(started.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn double_speed_halves_the_pacing_interval() {
        let q = queue();
        q.set_frame_rate(10.0);
        q.enqueue(packet(0.0));
        q.enqueue(packet(0.1));

        let started = Instant::now();
        assert!(q.sync(2.0, None).is_some());
        q.pop();
        let mut second = None;
        while second.is_none() && started.elapsed() < Duration::from_secs(1) {
            second = q.sync(2.0, None);
        }
        assert!(second.is_some());
        q.pop();
        // 100 ms of media at 2x should take roughly 50 ms of wall clock.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(35), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(95), "{elapsed:?}");
    }

    #[test]
    fn frames_behind_the_master_clock_are_dropped() {
        let q = queue();
        q.enqueue(packet(0.0));
        q.enqueue(packet(0.04));
        q.enqueue(packet(1.0));

        let frame = q.sync(1.0, Some(1.0)).expect("aligned frame");
        assert!((frame.pts - 1.0).abs() < 1e-9);
    }

    #[test]
    fn frames_ahead_of_the_master_clock_are_delayed() {
        let q = queue();
        q.enqueue(packet(2.0));
        assert!(q.sync(1.0, Some(1.0)).is_none());
    }

    #[test]
    fn pop_commits_the_emitted_pts() {
        let q = queue();
        q.enqueue(packet(0.25));
        assert_eq!(q.pts(), 0.0);
        let _frame = q.sync(1.0, None).unwrap();
        assert_eq!(q.pts(), 0.0);
        q.pop();
        assert!((q.pts() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn wait_for_empty_blocks_until_the_consumer_commits() {
        let q = Arc::new(queue());
        q.enqueue(packet(0.0));

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let frame = q.sync(1.0, None);
                assert!(frame.is_some());
                q.pop();
            })
        };

        let started = Instant::now();
        q.wait_for_empty();
        assert!(started.elapsed() >= Duration::from_millis(40));
        consumer.join().unwrap();
    }

    #[test]
    fn clear_drops_packets_and_resets_the_emitted_pts() {
        let q = queue();
        q.enqueue(packet(0.5));
        let _ = q.sync(1.0, None);
        q.pop();
        assert!((q.pts() - 0.5).abs() < 1e-9);

        q.enqueue(packet(0.54));
        q.clear();
        assert_eq!(q.bytes(), 0);
        assert!(q.is_empty());
        assert_eq!(q.pts(), 0.0);
    }
}
