//! The playback pipeline core.
//!
//! One generation per source: a loader opens the media and spawns a
//! demuxer worker plus a video and/or audio worker. The demuxer routes
//! packets to per-stream queues under a byte budget; the player workers
//! pull pace-synchronized frames out of the queues and emit them on the
//! frame channels. The client thread talks to the workers through the
//! state cells, the deferred-event list, the pending-seek cell and the
//! wait gate; `play`/`pause`/`stop`/`seek` signals are deferred until the
//! pipeline actually delivers frames from the new state.
//!
//! Threading contract: [`PlayerEvent`]s and frames are sent from worker
//! threads. The channels are ordered and single-consumer, so no further
//! marshaling to a client thread is required.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use url::Url;

use crate::demux::{Demuxer, Packet};
use crate::error::ErrorKind;
use crate::events::{Deferred, EventList, PendingOp};
use crate::frame::{AudioFrame, VideoFrame};
use crate::gate::Gate;
use crate::libav::LibavDemuxer;
use crate::queue::PacketQueue;

/// Cap on the combined byte size of both packet queues.
const MAX_QUEUE_BYTES: usize = 15 * 1024 * 1024;

/// Demuxer nap while backpressured or waiting for more packets.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);

/// Playback state, driven by `play`/`pause`/`stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Playing,
    Paused,
}

/// Loading status of the current source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    NoMedia,
    LoadedMedia,
    EndOfMedia,
    InvalidMedia,
}

/// Signals delivered on the channel returned by [`Player::events`].
///
/// Positions and durations are integer milliseconds; 0 duration means
/// unknown. `Played`/`Paused`/`Stopped`/`Seeked` fire once the pipeline
/// has actually reached the requested state, not when the call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    SourceChanged(Option<Url>),
    MediaStatusChanged(MediaStatus),
    StateChanged(State),
    SeekableChanged(bool),
    DurationChanged(i64),
    VideoFrameRateChanged(f64),
    ErrorOccurred(ErrorKind, String),
    Played(i64),
    Paused(i64),
    Stopped(i64),
    Seeked(i64),
    SpeedChanged(f64),
}

fn about_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

struct StateCell {
    state: State,
    status: MediaStatus,
}

#[derive(Default)]
struct Workers {
    loader: Option<JoinHandle<()>>,
    demuxer: Option<JoinHandle<()>>,
    video: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<()>>,
}

struct Shared<D: Demuxer> {
    demuxer: D,

    source: Mutex<Option<Url>>,
    cell: Mutex<StateCell>,
    pending_position: Mutex<Option<f64>>,
    speed: Mutex<f64>,
    seekable: AtomicBool,
    duration: Mutex<f64>,
    video_frame_rate: Mutex<f64>,
    error: Mutex<Option<(ErrorKind, String)>>,

    events: EventList,
    gate: Gate,
    quit: AtomicBool,

    video_queue: PacketQueue<D::Packet, VideoFrame>,
    audio_queue: PacketQueue<D::Packet, AudioFrame>,
    workers: Mutex<Workers>,

    event_tx: Sender<PlayerEvent>,
    event_rx: Receiver<PlayerEvent>,
    video_tx: Sender<VideoFrame>,
    video_rx: Receiver<VideoFrame>,
    audio_tx: Sender<AudioFrame>,
    audio_rx: Receiver<AudioFrame>,
}

/// Media player pipeline over a [`Demuxer`] backend.
///
/// All operations are callable from any thread. Dropping the player tears
/// the pipeline down and joins every worker.
pub struct Player<D: Demuxer = LibavDemuxer> {
    shared: Arc<Shared<D>>,
}

impl Player<LibavDemuxer> {
    /// Creates a player backed by the bundled FFmpeg demuxer.
    pub fn new() -> Self {
        Self::with_demuxer(LibavDemuxer::new())
    }
}

impl Default for Player<LibavDemuxer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Demuxer> Player<D> {
    pub fn with_demuxer(demuxer: D) -> Self {
        let (event_tx, event_rx) = unbounded();
        let (video_tx, video_rx) = unbounded();
        let (audio_tx, audio_rx) = unbounded();
        Player {
            shared: Arc::new(Shared {
                demuxer,
                source: Mutex::new(None),
                cell: Mutex::new(StateCell {
                    state: State::Stopped,
                    status: MediaStatus::NoMedia,
                }),
                pending_position: Mutex::new(None),
                speed: Mutex::new(1.0),
                seekable: AtomicBool::new(false),
                duration: Mutex::new(0.0),
                video_frame_rate: Mutex::new(0.0),
                error: Mutex::new(None),
                events: EventList::default(),
                gate: Gate::new(false),
                quit: AtomicBool::new(false),
                video_queue: PacketQueue::new(),
                audio_queue: PacketQueue::new(),
                workers: Mutex::new(Workers::default()),
                event_tx,
                event_rx,
                video_tx,
                video_rx,
                audio_tx,
                audio_rx,
            }),
        }
    }

    /// Signal stream; ordered, intended for a single consumer.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.shared.event_rx.clone()
    }

    /// Decoded video frames, delivered from the video worker. An empty
    /// frame ([`VideoFrame::is_empty`]) asks the sink to clear its last
    /// picture.
    pub fn video_frames(&self) -> Receiver<VideoFrame> {
        self.shared.video_rx.clone()
    }

    /// Decoded audio frames, delivered from the audio worker. The frame's
    /// `sample_rate` is pre-scaled by the playback speed.
    pub fn audio_frames(&self) -> Receiver<AudioFrame> {
        self.shared.audio_rx.clone()
    }

    /// Replaces the media source, tearing down the previous pipeline
    /// first. `None` unloads.
    pub fn set_source(&self, source: Option<Url>) {
        self.shared.set_source(source);
    }

    pub fn source(&self) -> Option<Url> {
        self.shared.source.lock().clone()
    }

    pub fn play(&self) {
        self.shared.play();
    }

    pub fn pause(&self) {
        self.shared.pause();
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Requests a jump to `pos_ms` milliseconds. Out-of-range positions
    /// are rejected silently; rapid requests coalesce into the last one.
    pub fn seek(&self, pos_ms: i64) {
        self.shared.seek(pos_ms);
    }

    /// Sets the playback speed; must be positive. Affects video pacing
    /// and the sample rate requested from the audio sink.
    pub fn set_speed(&self, speed: f64) {
        self.shared.set_speed(speed);
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn media_status(&self) -> MediaStatus {
        self.shared.media_status()
    }

    pub fn has_video(&self) -> bool {
        self.shared.has_video()
    }

    pub fn has_audio(&self) -> bool {
        self.shared.has_audio()
    }

    pub fn is_seekable(&self) -> bool {
        self.shared.seekable.load(Ordering::SeqCst)
    }

    /// Duration in milliseconds; 0 when unknown.
    pub fn duration(&self) -> i64 {
        self.shared.duration_ms()
    }

    /// Current position in milliseconds: the duration at end of media, the
    /// pending target while a seek is in flight, otherwise the last
    /// emitted video (or audio) pts.
    pub fn position(&self) -> i64 {
        self.shared.position()
    }

    pub fn speed(&self) -> f64 {
        self.shared.speed()
    }

    pub fn video_frame_rate(&self) -> f64 {
        *self.shared.video_frame_rate.lock()
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.shared.error.lock().as_ref().map(|(kind, _)| *kind)
    }

    pub fn error_string(&self) -> String {
        self.shared
            .error
            .lock()
            .as_ref()
            .map(|(_, message)| message.clone())
            .unwrap_or_default()
    }
}

impl<D: Demuxer> Drop for Player<D> {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

impl<D: Demuxer> Shared<D> {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn state(&self) -> State {
        self.cell.lock().state
    }

    fn media_status(&self) -> MediaStatus {
        self.cell.lock().status
    }

    fn is_seeking(&self) -> bool {
        self.pending_position.lock().is_some()
    }

    fn has_video(&self) -> bool {
        self.demuxer.video_stream().is_some()
    }

    fn has_audio(&self) -> bool {
        self.demuxer.audio_stream().is_some()
    }

    fn speed(&self) -> f64 {
        *self.speed.lock()
    }

    fn duration_ms(&self) -> i64 {
        (*self.duration.lock() * 1000.0) as i64
    }

    fn position(&self) -> i64 {
        if self.media_status() == MediaStatus::EndOfMedia {
            return self.duration_ms();
        }
        if let Some(pending) = *self.pending_position.lock() {
            return (pending * 1000.0) as i64;
        }
        let pts = if self.has_video() {
            self.video_queue.pts()
        } else {
            self.audio_queue.pts()
        };
        (pts * 1000.0) as i64
    }

    fn set_media_status(&self, status: MediaStatus) {
        {
            let mut cell = self.cell.lock();
            if cell.status == status {
                return;
            }
            log::debug!("Media status: {:?} -> {:?}", cell.status, status);
            cell.status = status;
        }
        self.emit(PlayerEvent::MediaStatusChanged(status));
    }

    fn set_state(&self, state: State) -> bool {
        {
            let mut cell = self.cell.lock();
            if cell.state == state {
                return false;
            }
            log::debug!("State: {:?} -> {:?}", cell.state, state);
            cell.state = state;
        }
        self.emit(PlayerEvent::StateChanged(state));
        true
    }

    fn set_seekable(&self, seekable: bool) {
        if self.seekable.swap(seekable, Ordering::SeqCst) == seekable {
            return;
        }
        self.emit(PlayerEvent::SeekableChanged(seekable));
    }

    fn set_duration(&self, seconds: f64) {
        {
            let mut duration = self.duration.lock();
            if about_eq(*duration, seconds) {
                return;
            }
            *duration = seconds;
        }
        self.emit(PlayerEvent::DurationChanged((seconds * 1000.0) as i64));
    }

    fn set_video_frame_rate(&self, rate: f64) {
        {
            let mut current = self.video_frame_rate.lock();
            if about_eq(*current, rate) {
                return;
            }
            *current = rate;
        }
        self.emit(PlayerEvent::VideoFrameRateChanged(rate));
    }

    /// Idempotent per kind; also makes the media terminally invalid.
    fn set_error(&self, kind: ErrorKind, message: String) {
        {
            let mut error = self.error.lock();
            if error.as_ref().map(|(k, _)| *k) == Some(kind) {
                return;
            }
            log::warn!("Error: {}", message);
            *error = Some((kind, message.clone()));
        }
        self.emit(PlayerEvent::ErrorOccurred(kind, message));
        self.set_media_status(MediaStatus::InvalidMedia);
    }

    /// Arms or releases the gate, waking both queues either way so their
    /// consumers re-check it.
    fn wait(&self, armed: bool) {
        self.gate.set(armed);
        self.video_queue.wake_all();
        self.audio_queue.wake_all();
    }

    fn set_source(self: &Arc<Self>, source: Option<Url>) {
        if *self.source.lock() == source {
            return;
        }
        log::info!("Source changed to {:?}", source.as_ref().map(Url::as_str));
        self.terminate();
        *self.source.lock() = source.clone();
        self.emit(PlayerEvent::SourceChanged(source.clone()));

        let Some(url) = source else {
            self.set_media_status(MediaStatus::NoMedia);
            self.set_duration(0.0);
            return;
        };

        self.video_queue.reset();
        self.audio_queue.reset();
        self.wait(true);
        self.quit.store(false, Ordering::SeqCst);

        let shared = Arc::clone(self);
        self.workers.lock().loader = Some(thread::spawn(move || shared.do_load(url)));
    }

    /// Tears down the current generation: aborts the demuxer and queues,
    /// releases every worker and joins all four of them before any field
    /// is reused.
    fn terminate(&self) {
        log::debug!("Terminating pipeline");
        self.set_state(State::Stopped);
        self.set_media_status(MediaStatus::NoMedia);
        self.demuxer.abort(true);
        self.quit.store(true, Ordering::SeqCst);
        self.wait(false);
        *self.video_frame_rate.lock() = 0.0;
        self.video_queue.clear();
        self.video_queue.abort();
        self.audio_queue.clear();
        self.audio_queue.abort();

        // The loader spawns the other workers; joining it first means no
        // handle can appear after they are taken below.
        let loader = self.workers.lock().loader.take();
        if let Some(handle) = loader {
            let _ = handle.join();
        }
        let (demuxer, video, audio) = {
            let mut workers = self.workers.lock();
            (
                workers.demuxer.take(),
                workers.video.take(),
                workers.audio.take(),
            )
        };
        for handle in [demuxer, video, audio].into_iter().flatten() {
            let _ = handle.join();
        }

        // A loader that lost the race may have written stale status while
        // being joined.
        self.cell.lock().status = MediaStatus::NoMedia;
        *self.pending_position.lock() = None;
        *self.error.lock() = None;
        self.events.clear();
    }

    fn do_load(self: Arc<Self>, url: Url) {
        self.demuxer.abort(false);
        self.demuxer.unload();
        let loaded = self.demuxer.load(&url);
        if self.quit.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = loaded {
            self.set_error(ErrorKind::Resource, err.to_string());
            return;
        }
        if self.demuxer.video_stream().is_none() && self.demuxer.audio_stream().is_none() {
            self.set_error(ErrorKind::Resource, "no codecs found".to_string());
            return;
        }

        let duration = self.demuxer.duration();
        let seekable = self.demuxer.seekable();
        let frame_rate = self.demuxer.frame_rate();
        log::info!(
            "Loaded {}: seekable {}, duration {:.2}s",
            url,
            seekable,
            duration
        );
        self.set_seekable(seekable);
        self.set_duration(duration);
        self.set_video_frame_rate(frame_rate);
        self.set_media_status(MediaStatus::LoadedMedia);
        self.process_events(true);

        if self.quit.load(Ordering::SeqCst) {
            return;
        }
        if let Some(decoder) = self.demuxer.video_decoder() {
            self.video_queue.set_decoder(decoder);
        }
        if let Some(decoder) = self.demuxer.audio_decoder() {
            self.audio_queue.set_decoder(decoder);
        }

        let mut workers = self.workers.lock();
        let shared = Arc::clone(&self);
        workers.demuxer = Some(thread::spawn(move || shared.do_demux()));
        if self.has_video() {
            let shared = Arc::clone(&self);
            workers.video = Some(thread::spawn(move || shared.do_play_video()));
        }
        if self.has_audio() {
            let shared = Arc::clone(&self);
            workers.audio = Some(thread::spawn(move || shared.do_play_audio()));
        }
    }

    fn do_demux(&self) {
        while !self.quit.load(Ordering::SeqCst) {
            if self.gate.wait_if_set() {
                continue;
            }

            // Backpressure must not starve a pending seek: full queues are
            // about to be cleared anyway.
            if !self.is_seeking()
                && (self.video_queue.bytes() + self.audio_queue.bytes() > MAX_QUEUE_BYTES
                    || (self.video_queue.enough() && self.audio_queue.enough()))
            {
                thread::sleep(BACKPRESSURE_SLEEP);
                continue;
            }

            let pending = *self.pending_position.lock();
            if let Some(pos) = pending {
                log::debug!("Seeking to {:.3}s", pos);
                match self.demuxer.seek(pos) {
                    Ok(()) => {
                        self.video_queue.clear();
                        self.audio_queue.clear();
                        self.video_queue.wait_for_empty();
                        self.audio_queue.wait_for_empty();
                        log::debug!("Reading packets from {:.3}s", pos);
                    }
                    Err(err) => log::warn!("Could not seek: {}", err),
                }
                // A newer request supersedes the one just served.
                let mut pending = self.pending_position.lock();
                if pending.map_or(false, |p| about_eq(p, pos)) {
                    *pending = None;
                }
            }

            let Some(packet) = self.demuxer.read() else {
                if self.demuxer.eof()
                    && self.video_queue.is_empty()
                    && self.audio_queue.is_empty()
                    && !self.video_queue.finished()
                    && !self.audio_queue.finished()
                {
                    if self.has_video() {
                        self.video_queue.finish();
                    }
                    if self.has_audio() {
                        self.audio_queue.finish();
                    }
                    log::debug!("End of media");
                    self.set_media_status(MediaStatus::EndOfMedia);
                    self.stop();
                }
                thread::sleep(BACKPRESSURE_SLEEP);
                continue;
            };

            if Some(packet.stream_index()) == self.demuxer.video_stream() {
                self.video_queue.enqueue(packet);
            } else if Some(packet.stream_index()) == self.demuxer.audio_stream() {
                self.audio_queue.enqueue(packet);
            }
        }
    }

    fn do_play_video(&self) {
        self.video_queue.set_frame_rate(self.demuxer.frame_rate());

        while !self.quit.load(Ordering::SeqCst) {
            if self.gate.wait_if_set() {
                continue;
            }
            let frame = self
                .video_queue
                .sync(self.speed(), Some(self.audio_queue.pts()));
            let ticked = frame.is_some();
            if let Some(frame) = frame {
                let _ = self.video_tx.send(frame);
                self.video_queue.pop();
            }
            self.process_events(ticked);
        }

        let _ = self.video_tx.send(VideoFrame::empty());
        self.video_queue.clear();
    }

    fn do_play_audio(&self) {
        let has_video = self.has_video();

        while !self.quit.load(Ordering::SeqCst) {
            if self.gate.wait_if_set() {
                continue;
            }
            let speed = self.speed();
            let frame = self.audio_queue.sync(speed, None);
            let ticked = frame.is_some();
            if let Some(mut frame) = frame {
                // Rational resample request for the downstream sink.
                frame.sample_rate = (frame.sample_rate as f64 * speed).round() as u32;
                let _ = self.audio_tx.send(frame);
                self.audio_queue.pop();
            }
            if !has_video {
                self.process_events(ticked);
            }
        }

        self.audio_queue.clear();
    }

    /// Drains deferred events in FIFO order. `tick` is true when called
    /// from a frame boundary, false from the load-completion flush or an
    /// empty worker iteration. Skipped entirely while a seek is pending.
    fn process_events(&self, tick: bool) {
        if self.is_seeking() {
            return;
        }
        let _guard = self.events.drain_guard();
        while let Some(event) = self.events.front() {
            if !self.consume_event(event, tick) {
                break;
            }
            self.events.pop_front();
        }
    }

    fn consume_event(&self, event: Deferred, tick: bool) -> bool {
        match event {
            Deferred::Played => {
                self.wait(false);
                if !tick && self.media_status() != MediaStatus::EndOfMedia {
                    return false;
                }
                log::debug!("Played from {}ms", self.position());
                self.emit(PlayerEvent::Played(self.position()));
                true
            }
            Deferred::Paused => {
                if !tick && self.media_status() != MediaStatus::EndOfMedia {
                    return false;
                }
                log::debug!("Paused at {}ms", self.position());
                self.emit(PlayerEvent::Paused(self.position()));
                self.wait(true);
                true
            }
            Deferred::Stopped => {
                log::debug!("Stopped at {}ms", self.position());
                self.emit(PlayerEvent::Stopped(self.position()));
                if self.has_video() {
                    log::debug!("Flushing empty video frame");
                    let _ = self.video_tx.send(VideoFrame::empty());
                }
                self.wait(true);
                true
            }
            Deferred::Seeked => {
                if !tick || self.is_seeking() {
                    return false;
                }
                log::debug!("Seeked to {}ms", self.position());
                self.emit(PlayerEvent::Seeked(self.position()));
                if matches!(self.state(), State::Paused | State::Stopped) {
                    self.wait(true);
                }
                true
            }
            Deferred::Retry(op) => {
                match op {
                    PendingOp::Play => self.play(),
                    PendingOp::Pause => self.pause(),
                    PendingOp::Seek(pos_ms) => self.seek(pos_ms),
                }
                true
            }
        }
    }

    fn play(&self) {
        if self.source.lock().is_none() || self.media_status() == MediaStatus::InvalidMedia {
            return;
        }
        let status = self.media_status();
        if status == MediaStatus::LoadedMedia || status == MediaStatus::EndOfMedia {
            if self.set_state(State::Playing) {
                if status == MediaStatus::EndOfMedia {
                    log::debug!("Playing from the beginning");
                    self.seek(0);
                }
                self.events.push(Deferred::Played);
            }
            self.wait(false);
        } else {
            log::debug!("Not loaded yet, postponing play");
            self.events.push(Deferred::Retry(PendingOp::Play));
        }
    }

    fn pause(&self) {
        let status = self.media_status();
        if status == MediaStatus::LoadedMedia || status == MediaStatus::EndOfMedia {
            if status == MediaStatus::EndOfMedia {
                log::debug!("Pausing from the beginning");
                self.seek(0);
            }
            if self.set_state(State::Paused) {
                self.wait(false);
                self.events.push(Deferred::Paused);
            } else {
                self.wait(true);
            }
        } else {
            log::debug!("Not loaded yet, postponing pause");
            self.events.push(Deferred::Retry(PendingOp::Pause));
        }
    }

    fn stop(&self) {
        let status = self.media_status();
        if status == MediaStatus::LoadedMedia || status == MediaStatus::EndOfMedia {
            if self.set_state(State::Stopped) {
                self.wait(false);
                self.events.push(Deferred::Stopped);
            } else {
                self.wait(true);
            }
        }
    }

    fn seek(&self, pos_ms: i64) {
        if pos_ms < 0 || (self.duration_ms() > 0 && pos_ms > self.duration_ms()) {
            return;
        }
        let status = self.media_status();
        if status == MediaStatus::LoadedMedia || status == MediaStatus::EndOfMedia {
            *self.pending_position.lock() = Some(pos_ms as f64 / 1000.0);
            if status == MediaStatus::EndOfMedia {
                self.set_media_status(MediaStatus::LoadedMedia);
            }
            self.events.push_unique(Deferred::Seeked);
            self.wait(false);
        } else {
            log::debug!("Not loaded yet, postponing seek to {}ms", pos_ms);
            self.events.push(Deferred::Retry(PendingOp::Seek(pos_ms)));
        }
    }

    fn set_speed(&self, speed: f64) {
        if speed <= 0.0 {
            log::warn!("Ignoring non-positive speed {}", speed);
            return;
        }
        {
            let mut current = self.speed.lock();
            if about_eq(*current, speed) {
                return;
            }
            log::debug!("Speed: {} -> {}", *current, speed);
            *current = speed;
        }
        self.emit(PlayerEvent::SpeedChanged(speed));
    }
}
