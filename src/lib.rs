//! A headless media playback engine built on top of FFmpeg.
//!
//! This library ingests a container from a URL, demultiplexes it into
//! per-stream packet queues and emits decoded video and audio frames over
//! channels, paced against a shared clock. Rendering and audio output are
//! deliberately out of scope: sinks consume the frame channels from
//! whatever thread suits them.
//!
//! # Prerequisites
//!
//! FFmpeg 4.0+ libraries must be installed on your system:
//! - **macOS**: `brew install ffmpeg`
//! - **Ubuntu/Debian**: `apt-get install libavcodec-dev libavformat-dev libavutil-dev libswscale-dev libavfilter-dev`
//! - **Arch Linux**: `pacman -S ffmpeg`
//! - **Windows**: Download FFmpeg shared libraries from [ffmpeg.org](https://ffmpeg.org/download.html)
//!
//! The library uses dynamic linking for LGPL compliance.
//!
//! # Example
//!
//! ```no_run
//! use av_player::{Player, PlayerEvent, Url};
//!
//! let player = Player::new();
//! let events = player.events();
//! let frames = player.video_frames();
//!
//! player.set_source(Some(Url::parse("file:///tmp/clip.mp4").unwrap()));
//! player.play();
//!
//! std::thread::spawn(move || {
//!     for frame in frames {
//!         if frame.is_empty() {
//!             // stop() flushed the sink; clear the last picture
//!             continue;
//!         }
//!         // hand the frame to a renderer
//!     }
//! });
//!
//! for event in events {
//!     match event {
//!         PlayerEvent::MediaStatusChanged(status) => println!("status: {status:?}"),
//!         PlayerEvent::Stopped(_) => break,
//!         _ => {}
//!     }
//! }
//! ```
//!
//! # Playback control
//!
//! The [`Player`] handle is callable from any thread:
//!
//! ```no_run
//! # use av_player::Player;
//! # let player = Player::new();
//! player.play();
//! player.seek(30_000);     // jump to 30s
//! player.set_speed(1.5);   // play at 1.5x
//! player.pause();
//! player.stop();
//! ```
//!
//! The `played`/`paused`/`stopped`/`seeked` signals fire once the pipeline
//! actually delivers frames from the new state, so a UI can key off them
//! without guessing.
//!
//! # Custom backends
//!
//! The pipeline drives any container backend implementing the [`Demuxer`]
//! trait; [`LibavDemuxer`] is the bundled FFmpeg one.

mod demux;
mod error;
mod events;
mod frame;
mod gate;
mod libav;
mod player;
mod queue;

pub use demux::{Decode, Demuxer, Packet};
pub use error::{Error, ErrorKind};
pub use frame::{AudioFrame, PixelFormat, Timed, VideoFrame};
pub use libav::{LibavDemuxer, LibavPacket};
pub use player::{MediaStatus, Player, PlayerEvent, State};
pub use queue::PacketQueue;

// Re-export commonly used types
pub use url::Url;
