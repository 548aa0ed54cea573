//! H.264 encoder implementation via FFmpeg
//!
//! Supports libx264 and h264_nvenc. Input frames are converted to the
//! encoder's pixel format and scaled to the candidate size.

use async_trait::async_trait;
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{picture, Dictionary, Rational};
use tracing::{debug, info, trace};

use super::{EncodedUnit, EncoderOutput, EncoderProvider, VideoEncoder};
use crate::config::{EncoderCandidate, LatencyMode};
use crate::error::{CamrelayError, Result};
use crate::types::{Frame, PixelFormat};

/// Maximum GOP length handed to the encoder
///
/// Large enough that keyframes only appear where they are forced.
const GOP_LENGTH: u32 = 1 << 30;

/// Encoder provider backed by an FFmpeg encoder
#[derive(Debug, Clone)]
pub struct FfmpegEncoderProvider {
    backend: String,
}

impl FfmpegEncoderProvider {
    /// Provider for the named FFmpeg encoder, e.g. `libx264`
    pub fn new(backend: impl Into<String>) -> Result<Self> {
        ffmpeg::init().map_err(|e| CamrelayError::encoder(format!("FFmpeg init failed: {}", e)))?;
        let backend = backend.into();
        if encoder::find_by_name(&backend).is_none() {
            return Err(CamrelayError::encoder(format!(
                "Encoder {} not found in this FFmpeg build",
                backend
            )));
        }
        Ok(Self { backend })
    }
}

#[async_trait]
impl EncoderProvider for FfmpegEncoderProvider {
    fn name(&self) -> &str {
        &self.backend
    }

    async fn probe(&self, candidate: &EncoderCandidate) -> Result<bool> {
        // A throwaway open is the only reliable support check
        match open_encoder(&self.backend, candidate, false) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("{} rejected {}: {}", self.backend, candidate, e);
                Ok(false)
            }
        }
    }

    fn create(&self, output: EncoderOutput) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(FfmpegEncoder {
            backend: self.backend.clone(),
            output: Some(output),
            encoder: None,
            scaler: None,
            frame: None,
            packet: ffmpeg::Packet::empty(),
            frame_count: 0,
            framerate: 1,
            description: None,
        }))
    }
}

/// Scaling context owned by a single encoder
struct Scaler(scaling::Context);

// SAFETY: the context is only touched through `&mut FfmpegEncoder`, so it
// is never used from two threads at once.
unsafe impl Send for Scaler {}

struct FfmpegEncoder {
    backend: String,
    output: Option<EncoderOutput>,
    encoder: Option<encoder::Video>,
    scaler: Option<Scaler>,
    frame: Option<Video>,
    packet: ffmpeg::Packet,
    frame_count: u64,
    framerate: u32,
    /// Pending until the first packet after configuration is emitted
    description: Option<Bytes>,
}

// SAFETY: see `Scaler`; the codec context and frames are owned exclusively.
unsafe impl Send for FfmpegEncoder {}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    fn configure(&mut self, candidate: &EncoderCandidate) -> Result<()> {
        let encoder = open_encoder(&self.backend, candidate, true)?;
        self.description = extradata(&encoder);
        self.frame = Some(Video::new(
            pixel_format_for(&self.backend),
            candidate.width,
            candidate.height,
        ));
        self.scaler = None;
        self.frame_count = 0;
        self.framerate = candidate.framerate.max(1);
        self.encoder = Some(encoder);

        info!(
            "{} opened: {} ({} byte description)",
            self.backend,
            candidate,
            self.description.as_ref().map_or(0, |d| d.len())
        );
        Ok(())
    }

    fn encode(&mut self, input: &Frame, force_keyframe: bool) -> Result<()> {
        if input.format.pixel_format != PixelFormat::Bgra {
            return Err(CamrelayError::encoder(format!(
                "{:?} input is not supported",
                input.format.pixel_format
            )));
        }
        self.ensure_scaler(input.format.width, input.format.height)?;

        let width = input.format.width as usize;
        let height = input.format.height as usize;
        let src_stride = input.format.stride as usize;
        let row = width * 4;
        if input.data.len() < src_stride * height.saturating_sub(1) + row {
            return Err(CamrelayError::encoder(format!(
                "Frame buffer too small: {} bytes for {}x{}",
                input.data.len(),
                width,
                height
            )));
        }

        let mut src = Video::new(Pixel::BGRA, input.format.width, input.format.height);
        let dst_stride = src.stride(0);
        let plane = src.data_mut(0);
        for y in 0..height {
            plane[y * dst_stride..y * dst_stride + row]
                .copy_from_slice(&input.data[y * src_stride..y * src_stride + row]);
        }

        let (Some(scaler), Some(frame), Some(encoder)) =
            (self.scaler.as_mut(), self.frame.as_mut(), self.encoder.as_mut())
        else {
            return Err(CamrelayError::encoder("Encoder is not configured"));
        };

        scaler
            .0
            .run(&src, frame)
            .map_err(|e| CamrelayError::encoder(format!("Scaling failed: {}", e)))?;

        frame.set_pts(Some(self.frame_count as i64));
        frame.set_kind(if force_keyframe {
            picture::Type::I
        } else {
            picture::Type::None
        });
        self.frame_count += 1;

        encoder
            .send_frame(frame)
            .map_err(|e| CamrelayError::encoder(format!("Failed to send frame: {}", e)))?;

        self.receive_packets()
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        encoder
            .send_eof()
            .map_err(|e| CamrelayError::encoder(format!("Failed to send EOF: {}", e)))?;
        self.receive_packets()
    }

    fn close(&mut self) {
        self.encoder = None;
        self.scaler = None;
        self.frame = None;
        // Ends the packetizer's input
        self.output = None;
    }
}

impl FfmpegEncoder {
    /// Ensure the scaler converts from the input size
    fn ensure_scaler(&mut self, width: u32, height: u32) -> Result<()> {
        let Some(encoder) = self.encoder.as_ref() else {
            return Err(CamrelayError::encoder("Encoder is not configured"));
        };

        let matches = self.scaler.as_ref().is_some_and(|s| {
            let input = s.0.input();
            input.width == width && input.height == height
        });
        if matches {
            return Ok(());
        }

        let dst_format = pixel_format_for(&self.backend);
        debug!(
            "Creating scaler: BGRA {}x{} -> {:?} {}x{}",
            width,
            height,
            dst_format,
            encoder.width(),
            encoder.height()
        );

        let scaler = scaling::Context::get(
            Pixel::BGRA,
            width,
            height,
            dst_format,
            encoder.width(),
            encoder.height(),
            Flags::BILINEAR,
        )
        .map_err(|e| CamrelayError::encoder(format!("Failed to create scaler: {}", e)))?;

        self.scaler = Some(Scaler(scaler));
        Ok(())
    }

    /// Forward every packet the encoder has ready
    fn receive_packets(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };

        loop {
            match encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let data = Bytes::copy_from_slice(self.packet.data().unwrap_or_default());
                    let pts = self.packet.pts().unwrap_or(0).max(0) as u64;
                    let timestamp_us = pts * 1_000_000 / self.framerate as u64;
                    let keyframe = self.packet.is_key();

                    trace!(
                        "Encoded packet: pts={}, size={}, keyframe={}",
                        pts,
                        data.len(),
                        keyframe
                    );

                    let mut unit = EncodedUnit::ready(keyframe, data, timestamp_us);
                    if let Some(description) = self.description.take() {
                        unit = unit.with_description(description);
                    }
                    if let Some(output) = &self.output {
                        if output.send(unit).is_err() {
                            trace!("Packetizer gone, encoded packet discarded");
                        }
                    }
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(CamrelayError::encoder(format!(
                        "Failed to receive packet: {}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Open an encoder context for `candidate`
///
/// With `global_header` the SPS/PPS go to extradata instead of the stream.
fn open_encoder(
    backend: &str,
    candidate: &EncoderCandidate,
    global_header: bool,
) -> Result<encoder::Video> {
    let profile = candidate.profile()?;
    let codec = encoder::find_by_name(backend)
        .ok_or_else(|| CamrelayError::encoder(format!("Encoder {} not found", backend)))?;

    let mut ctx = codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| CamrelayError::encoder(format!("Failed to create encoder context: {}", e)))?;

    let fps = candidate.framerate.max(1) as i32;
    let bitrate = candidate.bitrate as usize;

    ctx.set_width(candidate.width);
    ctx.set_height(candidate.height);
    ctx.set_format(pixel_format_for(backend));
    ctx.set_time_base(Rational::new(1, fps));
    ctx.set_frame_rate(Some(Rational::new(fps, 1)));
    ctx.set_bit_rate(bitrate);
    ctx.set_max_bit_rate(bitrate);
    ctx.set_max_b_frames(0);
    ctx.set_gop(GOP_LENGTH);
    if global_header {
        ctx.set_flags(codec::Flags::GLOBAL_HEADER);
    }

    let profile_name = match profile.profile_name() {
        // libx264 and nvenc only know plain baseline
        "constrained_baseline" => "baseline",
        name => name,
    };

    let mut opts = Dictionary::new();
    opts.set("profile", profile_name);
    opts.set("level", &profile.level());

    match (backend, candidate.latency) {
        ("h264_nvenc", LatencyMode::Realtime) => {
            opts.set("preset", "p1");
            opts.set("tune", "ll");
            opts.set("zerolatency", "1");
            opts.set("rc", "cbr");
        }
        ("h264_nvenc", LatencyMode::Quality) => {
            opts.set("preset", "p5");
            opts.set("rc", "vbr");
        }
        (_, LatencyMode::Realtime) => {
            opts.set("preset", "veryfast");
            opts.set("tune", "zerolatency");
        }
        (_, LatencyMode::Quality) => {
            opts.set("preset", "medium");
        }
    }
    // A forced I-picture must be an IDR the receiver can start from
    opts.set("forced-idr", "1");

    ctx.open_with(opts)
        .map_err(|e| CamrelayError::encoder(format!("Failed to open {}: {}", backend, e)))
}

/// Copy the codec extradata (avcC or Annex B parameter sets)
fn extradata(encoder: &encoder::Video) -> Option<Bytes> {
    // SAFETY: the context pointer is valid while `encoder` is borrowed and
    // extradata/extradata_size are set together by avcodec_open2.
    unsafe {
        let ctx = encoder.as_ptr();
        let data = (*ctx).extradata;
        let size = (*ctx).extradata_size;
        if data.is_null() || size <= 0 {
            return None;
        }
        Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
            data,
            size as usize,
        )))
    }
}

/// Pixel format the backend encodes from
fn pixel_format_for(backend: &str) -> Pixel {
    match backend {
        "h264_nvenc" => Pixel::NV12,
        _ => Pixel::YUV420P,
    }
}
