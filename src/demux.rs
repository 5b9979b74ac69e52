//! Facade over demultiplexing and decoding.
//!
//! The player core drives any container backend through these traits; the
//! bundled FFmpeg implementation is [`crate::LibavDemuxer`].
//! Implementations are internally synchronized: every method takes `&self`
//! and may be called concurrently from the loader, the demuxer worker and
//! the client thread.

use url::Url;

use crate::error::Error;
use crate::frame::{AudioFrame, VideoFrame};

/// One compressed access unit of one elementary stream.
pub trait Packet: Send + 'static {
    /// Index of the stream this packet belongs to.
    fn stream_index(&self) -> usize;
    /// Payload size in bytes, used for queue backpressure accounting.
    fn size(&self) -> usize;
}

/// Turns packets of one elementary stream into presentable frames.
pub trait Decode<P, F>: Send {
    /// Feeds one packet; a packet may yield zero or more frames.
    fn decode(&mut self, packet: &P) -> Vec<F>;
    /// Drops buffered codec state after a container seek.
    fn flush(&mut self);
}

/// The demultiplexer consumed by the player core.
pub trait Demuxer: Send + Sync + 'static {
    type Packet: Packet;

    /// Opens the source and probes its streams.
    fn load(&self, url: &Url) -> Result<(), Error>;
    fn unload(&self);
    /// Arms (`true`) or clears (`false`) the abort latch; while armed,
    /// blocking operations return early.
    fn abort(&self, stop: bool);

    fn video_stream(&self) -> Option<usize>;
    fn audio_stream(&self) -> Option<usize>;

    /// Container duration in seconds; 0 when unknown.
    fn duration(&self) -> f64;
    /// Video frame rate in frames per second; 0 when unknown or absent.
    fn frame_rate(&self) -> f64;
    fn seekable(&self) -> bool;

    /// Repositions the container to `pos` seconds, at keyframe granularity.
    fn seek(&self, pos: f64) -> Result<(), Error>;

    /// Next packet in container order, or `None` at EOF or when no data is
    /// currently available (distinguish via [`Demuxer::eof`]).
    fn read(&self) -> Option<Self::Packet>;
    fn eof(&self) -> bool;

    /// Decoder for the selected video stream, built once per generation.
    fn video_decoder(&self) -> Option<Box<dyn Decode<Self::Packet, VideoFrame> + Send>>;
    /// Decoder for the selected audio stream, built once per generation.
    fn audio_decoder(&self) -> Option<Box<dyn Decode<Self::Packet, AudioFrame> + Send>>;
}
