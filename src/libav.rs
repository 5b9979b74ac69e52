//! FFmpeg-backed implementation of the demuxer facade.
//!
//! Uses dynamically linked FFmpeg 4.0+ through `ffmpeg-next`. Video frames
//! are converted to NV12 through a scaler; audio frames are resampled to
//! packed stereo f32 at the source rate.

use std::sync::atomic::{AtomicBool, Ordering};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{self, Pixel, Sample};
use ffmpeg_next::media::Type;
use ffmpeg_next::software::resampling::Context as ResampleContext;
use ffmpeg_next::software::scaling::{context::Context as ScaleContext, flag::Flags};
use ffmpeg_next::util::frame::audio::Audio as RawAudioFrame;
use ffmpeg_next::util::frame::video::Video as RawVideoFrame;
use parking_lot::Mutex;
use url::Url;

use crate::demux::{Decode, Demuxer, Packet};
use crate::error::Error;
use crate::frame::{AudioFrame, PixelFormat, VideoFrame};

/// A compressed packet read from the container.
pub struct LibavPacket {
    inner: ffmpeg::Packet,
    stream_index: usize,
}

impl Packet for LibavPacket {
    fn stream_index(&self) -> usize {
        self.stream_index
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

struct Input {
    ictx: format::context::Input,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    duration: f64,
    frame_rate: f64,
    seekable: bool,
}

/// FFmpeg demuxer and decoder factory behind the [`Demuxer`] facade.
pub struct LibavDemuxer {
    input: Mutex<Option<Input>>,
    aborted: AtomicBool,
    eof: AtomicBool,
}

impl LibavDemuxer {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(None),
            aborted: AtomicBool::new(false),
            eof: AtomicBool::new(false),
        }
    }
}

impl Default for LibavDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn url_to_path(url: &Url) -> Result<String, Error> {
    if url.scheme() == "file" {
        Ok(url
            .to_file_path()
            .map_err(|_| Error::Uri)?
            .to_string_lossy()
            .into_owned())
    } else {
        Ok(url.as_str().to_string())
    }
}

fn time_base_seconds(ts: i64, time_base: ffmpeg::Rational) -> f64 {
    (ts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64).max(0.0)
}

impl Demuxer for LibavDemuxer {
    type Packet = LibavPacket;

    fn load(&self, url: &Url) -> Result<(), Error> {
        ffmpeg::init().map_err(|e| Error::Open(e.to_string()))?;
        let path = url_to_path(url)?;
        let ictx = format::input(&path).map_err(|e| Error::Open(e.to_string()))?;

        let video_stream = ictx.streams().best(Type::Video).map(|s| s.index());
        let audio_stream = ictx.streams().best(Type::Audio).map(|s| s.index());

        let duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else {
            0.0
        };
        let frame_rate = video_stream
            .and_then(|idx| ictx.stream(idx))
            .map(|stream| {
                let rate = stream.avg_frame_rate();
                if rate.numerator() > 0 && rate.denominator() > 0 {
                    rate.numerator() as f64 / rate.denominator() as f64
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);
        let seekable = duration > 0.0;

        log::info!(
            "Loaded {}: video {:?}, audio {:?}, {:.2}s @ {:.2}fps",
            path,
            video_stream,
            audio_stream,
            duration,
            frame_rate
        );

        *self.input.lock() = Some(Input {
            ictx,
            video_stream,
            audio_stream,
            duration,
            frame_rate,
            seekable,
        });
        self.eof.store(false, Ordering::Release);
        Ok(())
    }

    fn unload(&self) {
        *self.input.lock() = None;
        self.eof.store(false, Ordering::Release);
    }

    fn abort(&self, stop: bool) {
        self.aborted.store(stop, Ordering::Release);
    }

    fn video_stream(&self) -> Option<usize> {
        self.input.lock().as_ref().and_then(|i| i.video_stream)
    }

    fn audio_stream(&self) -> Option<usize> {
        self.input.lock().as_ref().and_then(|i| i.audio_stream)
    }

    fn duration(&self) -> f64 {
        self.input.lock().as_ref().map_or(0.0, |i| i.duration)
    }

    fn frame_rate(&self) -> f64 {
        self.input.lock().as_ref().map_or(0.0, |i| i.frame_rate)
    }

    fn seekable(&self) -> bool {
        self.input.lock().as_ref().is_some_and(|i| i.seekable)
    }

    fn seek(&self, pos: f64) -> Result<(), Error> {
        let mut guard = self.input.lock();
        let input = guard
            .as_mut()
            .ok_or_else(|| Error::Seek("no media loaded".into()))?;
        let timestamp = (pos * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        input
            .ictx
            .seek(timestamp, ..timestamp)
            .map_err(|e| Error::Seek(e.to_string()))?;
        self.eof.store(false, Ordering::Release);
        Ok(())
    }

    fn read(&self) -> Option<LibavPacket> {
        if self.aborted.load(Ordering::Acquire) {
            return None;
        }
        let mut guard = self.input.lock();
        let input = guard.as_mut()?;
        loop {
            match input.ictx.packets().next() {
                Some((stream, packet)) => {
                    let stream_index = stream.index();
                    // Skip streams we do not play (subtitles, data).
                    if Some(stream_index) == input.video_stream
                        || Some(stream_index) == input.audio_stream
                    {
                        return Some(LibavPacket {
                            inner: packet,
                            stream_index,
                        });
                    }
                }
                None => {
                    self.eof.store(true, Ordering::Release);
                    return None;
                }
            }
        }
    }

    fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    fn video_decoder(&self) -> Option<Box<dyn Decode<LibavPacket, VideoFrame> + Send>> {
        let guard = self.input.lock();
        let input = guard.as_ref()?;
        let stream = input.ictx.stream(input.video_stream?)?;
        match LibavVideoDecoder::from_stream(&stream) {
            Ok(decoder) => Some(Box::new(decoder)),
            Err(err) => {
                log::error!("Video decoder setup failed: {}", err);
                None
            }
        }
    }

    fn audio_decoder(&self) -> Option<Box<dyn Decode<LibavPacket, AudioFrame> + Send>> {
        let guard = self.input.lock();
        let input = guard.as_ref()?;
        let stream = input.ictx.stream(input.audio_stream?)?;
        match LibavAudioDecoder::from_stream(&stream) {
            Ok(decoder) => Some(Box::new(decoder)),
            Err(err) => {
                log::error!("Audio decoder setup failed: {}", err);
                None
            }
        }
    }
}

struct LibavVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    scaler: ScaleContext,
    time_base: ffmpeg::Rational,
}

impl LibavVideoDecoder {
    fn from_stream(stream: &format::stream::Stream<'_>) -> Result<Self, Error> {
        let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| Error::Decode(e.to_string()))?
            .decoder()
            .video()
            .map_err(|e| Error::Decode(e.to_string()))?;

        decoder.set_threading(ffmpeg::threading::Config {
            kind: ffmpeg::threading::Type::Frame,
            count: 0,
        });

        let scaler = ScaleContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::NV12,
            decoder.width(),
            decoder.height(),
            Flags::LANCZOS,
        )
        .map_err(|e| Error::Decode(e.to_string()))?;

        Ok(Self {
            decoder,
            scaler,
            time_base: stream.time_base(),
        })
    }
}

impl Decode<LibavPacket, VideoFrame> for LibavVideoDecoder {
    fn decode(&mut self, packet: &LibavPacket) -> Vec<VideoFrame> {
        let mut frames = Vec::new();
        if let Err(err) = self.decoder.send_packet(&packet.inner) {
            log::warn!("Send video packet error: {:?}", err);
            return frames;
        }

        let mut decoded = RawVideoFrame::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let mut nv12 = RawVideoFrame::empty();
            if let Err(err) = self.scaler.run(&decoded, &mut nv12) {
                log::error!("Scaling error: {:?}", err);
                continue;
            }

            let width = nv12.width();
            let height = nv12.height();
            let row_len = width as usize;

            // Tightly pack luma then interleaved chroma, dropping any
            // stride padding the scaler left on each row.
            let mut data = Vec::with_capacity(row_len * height as usize * 3 / 2);
            for (plane, rows) in [(0, height as usize), (1, height as usize / 2)] {
                data.extend(
                    nv12.data(plane)
                        .chunks(nv12.stride(plane))
                        .take(rows)
                        .flat_map(|line| &line[..row_len]),
                );
            }

            frames.push(VideoFrame {
                data,
                width,
                height,
                format: PixelFormat::Nv12,
                pts: time_base_seconds(decoded.pts().unwrap_or(0), self.time_base),
            });
        }
        frames
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

struct LibavAudioDecoder {
    decoder: ffmpeg::decoder::Audio,
    resampler: ResampleContext,
    time_base: ffmpeg::Rational,
    sample_rate: u32,
}

impl LibavAudioDecoder {
    fn from_stream(stream: &format::stream::Stream<'_>) -> Result<Self, Error> {
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| Error::Decode(e.to_string()))?
            .decoder()
            .audio()
            .map_err(|e| Error::Decode(e.to_string()))?;

        let sample_rate = decoder.rate();
        let resampler = ResampleContext::get(
            decoder.format(),
            decoder.channel_layout(),
            sample_rate,
            Sample::F32(ffmpeg::format::sample::Type::Packed),
            ffmpeg::ChannelLayout::STEREO,
            sample_rate,
        )
        .map_err(|e| Error::Decode(e.to_string()))?;

        Ok(Self {
            decoder,
            resampler,
            time_base: stream.time_base(),
            sample_rate,
        })
    }
}

impl Decode<LibavPacket, AudioFrame> for LibavAudioDecoder {
    fn decode(&mut self, packet: &LibavPacket) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        if let Err(err) = self.decoder.send_packet(&packet.inner) {
            log::warn!("Send audio packet error: {:?}", err);
            return frames;
        }

        let mut decoded = RawAudioFrame::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let mut resampled = RawAudioFrame::empty();
            if let Err(err) = self.resampler.run(&decoded, &mut resampled) {
                log::error!("Resampling error: {:?}", err);
                continue;
            }

            // Interleaved stereo f32: samples() counts per channel, the
            // plane may carry trailing padding beyond the payload.
            let payload = resampled.samples() * 2 * std::mem::size_of::<f32>();
            let pcm: Vec<f32> = resampled.data(0)[..payload]
                .chunks_exact(4)
                .flat_map(<[u8; 4]>::try_from)
                .map(f32::from_le_bytes)
                .collect();

            frames.push(AudioFrame {
                data: pcm,
                channels: 2,
                sample_rate: self.sample_rate,
                pts: time_base_seconds(decoded.pts().unwrap_or(0), self.time_base),
            });
        }
        frames
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}
