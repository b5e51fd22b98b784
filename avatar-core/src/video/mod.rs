//! video — FFmpeg bridge
//!
//! The camera device itself is an external collaborator; this module only
//! defines the frame-source boundary (`FrameSource`) plus two concrete ends
//! of the pipe: `FileSource`, a pull-based decoder that stands in for a live
//! capture feed, and `Mp4Sink`, the H.264 encoder the stream bridge drains
//! into. Both keep the per-frame path allocation-free after the first frame.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use std::path::Path;
use tracing::{debug, info};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for the decode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

/// The boundary the render and detection loops pull frames through.
///
/// `dimensions` reports 0×0 until the first frame is decodable; callers gate
/// initialisation and detection warm-up on that. `latest` never blocks — it
/// returns the most recently decoded frame, which both loops re-read on
/// their own cadence.
pub trait FrameSource {
    fn dimensions(&self) -> (u32, u32);
    /// Decode the next frame. Returns `false` when the source is exhausted.
    fn advance(&mut self) -> Result<bool>;
    fn latest(&self) -> Option<&RgbFrame>;
}

// ── FileSource ───────────────────────────────────────────────────────────────

/// Pull-based decoder over a video file, converting every frame to RGB24.
pub struct FileSource {
    ictx: format::context::Input,
    decoder: codec::decoder::Video,
    to_rgb: scaling::Context,
    video_stream_index: usize,
    decoded_frame: frame::Video,
    rgb_frame: frame::Video,
    current: Option<RgbFrame>,
    frame_count: u64,
    width: u32,
    height: u32,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(input_path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&input_path).context("could not open input file")?;

        let video_stream_index = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?
            .index();

        let input_video_stream = ictx.stream(video_stream_index).unwrap();
        let decoder_ctx =
            codec::context::Context::from_parameters(input_video_stream.parameters())
                .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        let src_pixel_fmt = decoder.format();

        info!(width, height, ?src_pixel_fmt, "opened input video stream");

        let to_rgb = scaling::Context::get(
            src_pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            video_stream_index,
            decoded_frame: frame::Video::empty(),
            rgb_frame: frame::Video::empty(),
            current: None,
            frame_count: 0,
            width,
            height,
        })
    }

    /// Native size of the video stream, known from the container up front
    /// (unlike `dimensions`, which waits for the first decoded frame).
    pub fn native_dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Average frame rate of the underlying stream, as (numerator, denominator).
    pub fn frame_rate(&self) -> (i32, i32) {
        let rate = self
            .ictx
            .stream(self.video_stream_index)
            .map(|s| s.avg_frame_rate())
            .unwrap_or_else(|| Rational::new(30, 1));
        (rate.numerator(), rate.denominator())
    }

    /// Approximate total frame count (used for progress reporting).
    pub fn total_frames(&self) -> u64 {
        let Some(stream) = self.ictx.stream(self.video_stream_index) else {
            return 0;
        };
        let nb = stream.frames();
        if nb > 0 {
            return nb as u64;
        }
        let dur = stream.duration(); // in stream time-base units
        let tb = stream.time_base();
        let fps = stream.avg_frame_rate();
        if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
            let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
            let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
            return (seconds * fps_f).round() as u64;
        }
        0
    }

    fn take_decoded(&mut self) -> Result<()> {
        self.to_rgb
            .run(&self.decoded_frame, &mut self.rgb_frame)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any), reusing
        // the previous frame's allocation.
        let stride = self.rgb_frame.stride(0);
        let raw = self.rgb_frame.data(0);
        let row_len = self.width as usize * 3;
        let mut data = self
            .current
            .take()
            .map(|f| f.data)
            .unwrap_or_else(|| Vec::with_capacity(row_len * self.height as usize));
        data.clear();
        for row in 0..self.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        let pts = self.decoded_frame.pts().unwrap_or(self.frame_count as i64);
        self.current = Some(RgbFrame {
            data,
            width: self.width,
            height: self.height,
            pts,
        });
        self.frame_count += 1;
        if self.frame_count % 300 == 0 {
            debug!(frames = self.frame_count, "decoded frames");
        }
        Ok(())
    }
}

impl FrameSource for FileSource {
    fn dimensions(&self) -> (u32, u32) {
        // 0×0 until the first frame has actually decoded, so consumers can
        // gate on "source reports non-zero dimensions".
        if self.current.is_some() {
            (self.width, self.height)
        } else {
            (0, 0)
        }
    }

    fn advance(&mut self) -> Result<bool> {
        if self.decoder.receive_frame(&mut self.decoded_frame).is_ok() {
            self.take_decoded()?;
            return Ok(true);
        }

        let mut packets = Vec::new();
        loop {
            // Collect the next video packet (borrow of self.ictx must end
            // before send_packet, hence the buffer-of-one dance).
            {
                let mut iter = self.ictx.packets();
                loop {
                    match iter.next() {
                        Some((stream, packet)) => {
                            if stream.index() == self.video_stream_index {
                                packets.push(packet);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }

            let Some(packet) = packets.pop() else {
                // Input exhausted — flush the decoder once.
                self.decoder.send_eof().ok();
                if self.decoder.receive_frame(&mut self.decoded_frame).is_ok() {
                    self.take_decoded()?;
                    return Ok(true);
                }
                return Ok(false);
            };

            self.decoder
                .send_packet(&packet)
                .context("decoder send_packet")?;

            if self.decoder.receive_frame(&mut self.decoded_frame).is_ok() {
                self.take_decoded()?;
                return Ok(true);
            }
        }
    }

    fn latest(&self) -> Option<&RgbFrame> {
        self.current.as_ref()
    }
}

// ── Mp4Sink ──────────────────────────────────────────────────────────────────

/// H.264 encoder/muxer fed by the stream bridge.
///
/// The encoder is initialised lazily on the first frame, because the composed
/// canvas dimensions are only known once the scene composer is ready.
pub struct Mp4Sink {
    octx: format::context::Output,
    enc: Option<EncState>,
    fps: i32,
    frame_index: i64,
}

struct EncState {
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    video_out_index: usize,
    out_width: u32,
    out_height: u32,
}

impl Mp4Sink {
    /// `fps` is the fixed capture rate the stream bridge samples at.
    pub fn create<P: AsRef<Path>>(output_path: P, fps: u32) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let octx = format::output(&output_path).context("could not create output context")?;
        Ok(Self {
            octx,
            enc: None,
            fps: fps as i32,
            frame_index: 0,
        })
    }

    pub fn push(&mut self, frame: &RgbFrame) -> Result<()> {
        if self.enc.is_none() {
            self.init_encoder(frame.width, frame.height)?;
        }
        let state = self.enc.as_mut().unwrap();

        // Write the RGB data into the output AVFrame, honouring its stride.
        let out_stride = state.out_rgb_frame.stride(0);
        let (out_w, out_h) = (state.out_width, state.out_height);
        fill_rgb_plane(
            state.out_rgb_frame.data_mut(0),
            out_stride,
            out_w,
            out_h,
            frame,
        )?;

        state
            .to_yuv
            .run(&state.out_rgb_frame, &mut state.yuv_frame)
            .context("to-YUV scaling failed")?;

        state.yuv_frame.set_pts(Some(self.frame_index));
        self.frame_index += 1;

        state
            .video_encoder
            .send_frame(&state.yuv_frame)
            .context("encoder send_frame")?;

        drain_encoder(
            &mut state.video_encoder,
            &mut self.octx,
            state.video_out_index,
            Rational::new(1, self.fps),
        )
    }

    fn init_encoder(&mut self, out_w: u32, out_h: u32) -> Result<()> {
        let global_header = self
            .octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

        let mut video_out_stream = self.octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;

        builder.set_width(out_w);
        builder.set_height(out_h);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(Rational::new(1, self.fps));
        builder.set_frame_rate(Some(Rational::new(self.fps, 1)));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg_next::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;

        video_out_stream.set_parameters(&video_encoder);
        let video_out_index = video_out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            out_w,
            out_h,
            ENCODE_FORMAT,
            out_w,
            out_h,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        info!(out_w, out_h, "output dimensions determined; writing header");
        self.octx
            .write_header()
            .context("failed to write output header")?;

        self.enc = Some(EncState {
            video_encoder,
            to_yuv,
            out_rgb_frame: frame::Video::new(format::Pixel::RGB24, out_w, out_h),
            yuv_frame: frame::Video::empty(),
            video_out_index,
            out_width: out_w,
            out_height: out_h,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        let Some(state) = self.enc.as_mut() else {
            anyhow::bail!("no video frames were written");
        };

        state.video_encoder.send_eof().ok();
        drain_encoder(
            &mut state.video_encoder,
            &mut self.octx,
            state.video_out_index,
            Rational::new(1, self.fps),
        )?;

        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frames = self.frame_index, "encode complete");
        Ok(())
    }
}

/// Copy packed RGB24 rows into a stride-padded encoder plane.
///
/// The encoder is sized once from the first frame; a later frame with other
/// dimensions (a canvas rebuilt by a container resize mid-recording) is a
/// hard error rather than an out-of-bounds row copy.
fn fill_rgb_plane(
    plane: &mut [u8],
    stride: usize,
    out_w: u32,
    out_h: u32,
    frame: &RgbFrame,
) -> Result<()> {
    anyhow::ensure!(
        frame.width == out_w && frame.height == out_h,
        "frame size changed mid-recording: got {}x{}, encoder fixed at {}x{}",
        frame.width,
        frame.height,
        out_w,
        out_h
    );

    let row_len = out_w as usize * 3;
    for row in 0..out_h as usize {
        let dst_start = row * stride;
        let src_start = row * row_len;
        plane[dst_start..dst_start + row_len]
            .copy_from_slice(&frame.data[src_start..src_start + row_len]);
    }
    Ok(())
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn drain_encoder(
    encoder: &mut encoder::Video,
    octx: &mut format::context::Output,
    stream_index: usize,
    time_base: Rational,
) -> Result<()> {
    let mut encoded = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        encoded.rescale_ts(time_base, octx.stream(stream_index).unwrap().time_base());
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}

// ── Viewer remux ─────────────────────────────────────────────────────────────

/// Thin viewer support: copy a published session recording to `output_path`
/// without re-encoding. With `mute` set, the audio track is dropped.
pub fn remux<P: AsRef<Path>, Q: AsRef<Path>>(
    input_path: P,
    output_path: Q,
    mute: bool,
) -> Result<()> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    let mut ictx = format::input(&input_path).context("could not open session stream")?;
    let mut octx = format::output(&output_path).context("could not create output context")?;

    // Map kept input streams to output stream indices.
    let mut mapping: Vec<Option<usize>> = Vec::new();
    for stream in ictx.streams() {
        let medium = stream.parameters().medium();
        let keep = match medium {
            media::Type::Video => true,
            media::Type::Audio => !mute,
            _ => false,
        };
        if keep {
            let mut out = octx.add_stream(codec::Id::None)?;
            out.set_parameters(stream.parameters());
            mapping.push(Some(out.index()));
        } else {
            mapping.push(None);
        }
    }

    octx.write_header().context("failed to write header")?;

    for (stream, mut packet) in ictx.packets() {
        let Some(Some(out_index)) = mapping.get(stream.index()).copied() else {
            continue;
        };
        let src_tb = stream.time_base();
        let dst_tb = octx.stream(out_index).unwrap().time_base();
        packet.set_stream(out_index);
        packet.rescale_ts(src_tb, dst_tb);
        packet
            .write_interleaved(&mut octx)
            .context("failed to write packet")?;
    }

    octx.write_trailer().context("failed to write trailer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32) -> RgbFrame {
        RgbFrame {
            data: (0..(w * h * 3) as usize).map(|i| (i % 256) as u8).collect(),
            width: w,
            height: h,
            pts: 0,
        }
    }

    #[test]
    fn encoder_plane_rejects_resized_frames() {
        // Encoder fixed at 8×4; a canvas rebuilt at 4×4 must error, not panic.
        let stride = 8 * 3 + 8; // padded stride
        let mut plane = vec![0u8; stride * 4];

        let err = fill_rgb_plane(&mut plane, stride, 8, 4, &frame(4, 4)).unwrap_err();
        assert!(err.to_string().contains("frame size changed"));

        // Larger frames are rejected too, not silently cropped.
        assert!(fill_rgb_plane(&mut plane, stride, 8, 4, &frame(16, 16)).is_err());
    }

    #[test]
    fn encoder_plane_copy_honours_stride_padding() {
        let stride = 4 * 3 + 4;
        let mut plane = vec![0xAAu8; stride * 2];
        let f = frame(4, 2);

        fill_rgb_plane(&mut plane, stride, 4, 2, &f).unwrap();

        assert_eq!(&plane[..12], &f.data[..12]);
        assert_eq!(&plane[stride..stride + 12], &f.data[12..24]);
        // Padding bytes untouched.
        assert!(plane[12..stride].iter().all(|&b| b == 0xAA));
    }
}
