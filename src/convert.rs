//! Raw payload to display-format conversion.
//!
//! Conversion is pure: the same raw image always produces the same bytes, and
//! the output is written into caller-provided memory so the acquisition loop
//! can reuse one buffer for every frame.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{FrameMetadata, PixelFormat};

/// Layout of converted frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetFormat {
    /// 24-bit blue, green, red.
    #[default]
    Bgr8,
    /// 32-bit blue, green, red, opaque alpha.
    Bgra8,
    /// 24-bit red, green, blue.
    Rgb8,
}

impl TargetFormat {
    /// Bytes per output pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgr8 | Self::Rgb8 => 3,
            Self::Bgra8 => 4,
        }
    }

    /// Encoding label used by image consumers ("bgr8", "bgra8", "rgb8").
    pub const fn encoding(self) -> &'static str {
        match self {
            Self::Bgr8 => "bgr8",
            Self::Bgra8 => "bgra8",
            Self::Rgb8 => "rgb8",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bgr8" => Ok(Self::Bgr8),
            "bgra8" => Ok(Self::Bgra8),
            "rgb8" => Ok(Self::Rgb8),
            other => Err(format!("unknown target format '{other}' (bgr8, bgra8, rgb8)")),
        }
    }
}

/// A raw payload as delivered by the hardware.
#[derive(Debug, Clone, Copy)]
pub struct RawImage<'a> {
    /// Payload bytes.
    pub data: &'a [u8],
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Layout of `data`.
    pub pixel_format: PixelFormat,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Frame sequence number.
    pub sequence: u64,
}

impl<'a> RawImage<'a> {
    /// Wrap a payload without capture metadata.
    pub const fn new(data: &'a [u8], width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            pixel_format,
            timestamp: Duration::ZERO,
            sequence: 0,
        }
    }

    /// Wrap a payload described by buffer metadata.
    pub const fn from_metadata(data: &'a [u8], metadata: &FrameMetadata) -> Self {
        Self {
            data,
            width: metadata.width,
            height: metadata.height,
            pixel_format: metadata.pixel_format,
            timestamp: metadata.timestamp,
            sequence: metadata.sequence,
        }
    }
}

/// A converted frame borrowing the caller's output memory.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout of `data`.
    pub format: TargetFormat,
    /// Packed pixels, `width * height * bytes_per_pixel` bytes.
    pub data: &'a [u8],
    /// Capture timestamp of the source frame.
    pub timestamp: Duration,
    /// Sequence number of the source frame.
    pub sequence: u64,
}

impl Frame<'_> {
    /// Bytes per row.
    pub fn stride(&self) -> usize {
        usize::try_from(self.width).unwrap_or(usize::MAX) * self.format.bytes_per_pixel()
    }

    /// Red, green and blue of the pixel at (`x`, `y`), `None` outside the frame.
    pub fn pixel_rgb(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = usize::try_from(y)
            .ok()?
            .checked_mul(self.stride())?
            .checked_add(usize::try_from(x).ok()?.checked_mul(bpp)?)?;
        let pixel = self.data.get(offset..offset + bpp)?;
        let first = *pixel.first()?;
        let second = *pixel.get(1)?;
        let third = *pixel.get(2)?;
        Some(match self.format {
            TargetFormat::Bgr8 | TargetFormat::Bgra8 => (third, second, first),
            TargetFormat::Rgb8 => (first, second, third),
        })
    }
}

/// Output bytes needed for a `width` x `height` frame, `None` on overflow.
pub fn required_size(width: u32, height: u32, target: TargetFormat) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(target.bytes_per_pixel())
}

/// Convert `raw` into `target` layout, writing into `out`.
///
/// `out` must hold at least [`required_size`] bytes; only that prefix is
/// written and borrowed by the returned frame.
pub fn convert<'o>(raw: &RawImage<'_>, target: TargetFormat, out: &'o mut [u8]) -> Result<Frame<'o>> {
    let (width, height) = (raw.width, raw.height);
    if width == 0 || height == 0 {
        return Err(conversion(format!("empty {width}x{height} image")));
    }
    let expected = raw
        .pixel_format
        .payload_size(width, height)
        .ok_or_else(|| conversion(format!("{width}x{height} overflows the address space")))?;
    let data = raw.data.get(..expected).ok_or_else(|| {
        conversion(format!(
            "{} payload of {width}x{height} needs {expected} bytes, got {}",
            raw.pixel_format,
            raw.data.len()
        ))
    })?;
    let needed = required_size(width, height, target)
        .ok_or_else(|| conversion(format!("{width}x{height} overflows the address space")))?;
    let available = out.len();
    let out = out.get_mut(..needed).ok_or_else(|| {
        conversion(format!(
            "output holds {available} bytes, {target} frame needs {needed}"
        ))
    })?;
    let row = usize::try_from(width).map_err(|err| conversion(err.to_string()))?;

    match raw.pixel_format {
        PixelFormat::Mono8 => write_pixels(out, target, data.iter().map(|&v| (v, v, v))),
        // Little endian: the high byte is the second of each pair.
        PixelFormat::Mono16 => write_pixels(
            out,
            target,
            data.chunks_exact(2).map(|pair| {
                let high = byte(pair, 1);
                (high, high, high)
            }),
        ),
        PixelFormat::Rgb8 => write_pixels(
            out,
            target,
            data.chunks_exact(3)
                .map(|p| (byte(p, 0), byte(p, 1), byte(p, 2))),
        ),
        PixelFormat::Bgr8 => write_pixels(
            out,
            target,
            data.chunks_exact(3)
                .map(|p| (byte(p, 2), byte(p, 1), byte(p, 0))),
        ),
        PixelFormat::Rgba8 => write_pixels(
            out,
            target,
            data.chunks_exact(4)
                .map(|p| (byte(p, 0), byte(p, 1), byte(p, 2))),
        ),
        PixelFormat::Bgra8 => write_pixels(
            out,
            target,
            data.chunks_exact(4)
                .map(|p| (byte(p, 2), byte(p, 1), byte(p, 0))),
        ),
        PixelFormat::Yuv422 => {
            if width % 2 != 0 {
                return Err(conversion(format!("YUV422_8 needs an even width, got {width}")));
            }
            write_pixels(
                out,
                target,
                data.chunks_exact(4).flat_map(|quad| {
                    let (u, v) = (byte(quad, 1), byte(quad, 3));
                    [yuv_to_rgb(byte(quad, 0), u, v), yuv_to_rgb(byte(quad, 2), u, v)]
                }),
            );
        }
        PixelFormat::BayerRG8
        | PixelFormat::BayerGR8
        | PixelFormat::BayerGB8
        | PixelFormat::BayerBG8 => {
            if width % 2 != 0 || height % 2 != 0 {
                return Err(conversion(format!(
                    "{} needs even dimensions, got {width}x{height}",
                    raw.pixel_format
                )));
            }
            demosaic(data, row, raw.pixel_format, target, out);
        }
        PixelFormat::Mono12Packed => {
            return Err(conversion(format!(
                "{} frames cannot be converted",
                raw.pixel_format
            )));
        }
    }

    Ok(Frame {
        width,
        height,
        format: target,
        data: out,
        timestamp: raw.timestamp,
        sequence: raw.sequence,
    })
}

fn write_pixels<I>(out: &mut [u8], target: TargetFormat, pixels: I)
where
    I: Iterator<Item = (u8, u8, u8)>,
{
    for (dst, rgb) in out.chunks_exact_mut(target.bytes_per_pixel()).zip(pixels) {
        encode(target, rgb, dst);
    }
}

fn encode(target: TargetFormat, (r, g, b): (u8, u8, u8), dst: &mut [u8]) {
    match target {
        TargetFormat::Bgr8 => dst.copy_from_slice(&[b, g, r]),
        TargetFormat::Bgra8 => dst.copy_from_slice(&[b, g, r, u8::MAX]),
        TargetFormat::Rgb8 => dst.copy_from_slice(&[r, g, b]),
    }
}

/// 2x2 cell demosaic: every pixel of a cell gets the cell's red, blue and
/// mean green.
fn demosaic(data: &[u8], width: usize, pattern: PixelFormat, target: TargetFormat, out: &mut [u8]) {
    let bpp = target.bytes_per_pixel();
    let raw_rows = data.chunks_exact(2 * width);
    let out_rows = out.chunks_exact_mut(2 * width * bpp);
    for (raw_pair, out_pair) in raw_rows.zip(out_rows) {
        let (raw_top, raw_bottom) = raw_pair.split_at(width);
        let (out_top, out_bottom) = out_pair.split_at_mut(width * bpp);
        let cells = raw_top.chunks_exact(2).zip(raw_bottom.chunks_exact(2));
        let targets = out_top
            .chunks_exact_mut(2 * bpp)
            .zip(out_bottom.chunks_exact_mut(2 * bpp));
        for ((top, bottom), (dst_top, dst_bottom)) in cells.zip(targets) {
            let (t0, t1, b0, b1) = (byte(top, 0), byte(top, 1), byte(bottom, 0), byte(bottom, 1));
            let (r, g1, g2, b) = match pattern {
                PixelFormat::BayerGR8 => (t1, t0, b1, b0),
                PixelFormat::BayerGB8 => (b0, t0, b1, t1),
                PixelFormat::BayerBG8 => (b1, t1, b0, t0),
                _ => (t0, t1, b0, b1),
            };
            let g = u8::try_from((u16::from(g1) + u16::from(g2)) / 2).unwrap_or(u8::MAX);
            for dst in dst_top
                .chunks_exact_mut(bpp)
                .chain(dst_bottom.chunks_exact_mut(bpp))
            {
                encode(target, (r, g, b), dst);
            }
        }
    }
}

/// Sample a colour filter array would record at (`x`, `y`) for a scene
/// pixel `rgb`. Non-Bayer formats record green.
pub(crate) const fn bayer_sample(pattern: PixelFormat, x: usize, y: usize, rgb: (u8, u8, u8)) -> u8 {
    let red_at = match pattern {
        PixelFormat::BayerRG8 => (0, 0),
        PixelFormat::BayerGR8 => (1, 0),
        PixelFormat::BayerGB8 => (0, 1),
        PixelFormat::BayerBG8 => (1, 1),
        _ => return rgb.1,
    };
    let at = (x % 2, y % 2);
    if at.0 == red_at.0 && at.1 == red_at.1 {
        rgb.0
    } else if at.0 != red_at.0 && at.1 != red_at.1 {
        rgb.2
    } else {
        rgb.1
    }
}

fn byte(bytes: &[u8], index: usize) -> u8 {
    bytes.get(index).copied().unwrap_or_default()
}

fn conversion(reason: String) -> CameraError {
    CameraError::Conversion(reason)
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula with full-range luma.
#[allow(clippy::many_single_char_names)]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    (clamp(r), clamp(g), clamp(b))
}

/// Inverse of [`yuv_to_rgb`].
#[allow(clippy::many_single_char_names)]
pub(crate) fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r_f, g_f, b_f) = (f32::from(r), f32::from(g), f32::from(b));
    let y = 0.114f32.mul_add(b_f, 0.587f32.mul_add(g_f, 0.299 * r_f));
    let u = (b_f - y).mul_add(1.0 / 1.772, 128.0);
    let v = (r_f - y).mul_add(1.0 / 1.402, 128.0);
    (clamp(y.round()), clamp(u.round()), clamp(v.round()))
}

fn clamp(val: f32) -> u8 {
    if val < 0.0 {
        0
    } else if val > 255.0 {
        255
    } else {
        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        {
            val as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_vec(raw: &RawImage<'_>, target: TargetFormat) -> Result<Vec<u8>> {
        let size = required_size(raw.width, raw.height, target).expect("size");
        let mut out = vec![0u8; size];
        convert(raw, target, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_rgb8_to_bgr8_swaps_channels() {
        let data = [10, 20, 30, 40, 50, 60];
        let raw = RawImage::new(&data, 2, 1, PixelFormat::Rgb8);
        let out = convert_vec(&raw, TargetFormat::Bgr8).expect("convert");
        assert_eq!(out, [30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn test_bgr8_passes_through() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let raw = RawImage::new(&data, 2, 2, PixelFormat::Bgr8);
        let out = convert_vec(&raw, TargetFormat::Bgr8).expect("convert");
        assert_eq!(out, data);
    }

    #[test]
    fn test_alpha_is_opaque() {
        let data = [9, 8, 7, 0];
        let raw = RawImage::new(&data, 1, 1, PixelFormat::Bgra8);
        let out = convert_vec(&raw, TargetFormat::Bgra8).expect("convert");
        assert_eq!(out, [9, 8, 7, 255]);

        let mono = [42];
        let raw = RawImage::new(&mono, 1, 1, PixelFormat::Mono8);
        let out = convert_vec(&raw, TargetFormat::Bgra8).expect("convert");
        assert_eq!(out, [42, 42, 42, 255]);
    }

    #[test]
    fn test_mono16_keeps_high_byte() {
        let data = [0x34, 0x12, 0xff, 0x80];
        let raw = RawImage::new(&data, 2, 1, PixelFormat::Mono16);
        let out = convert_vec(&raw, TargetFormat::Rgb8).expect("convert");
        assert_eq!(out, [0x12, 0x12, 0x12, 0x80, 0x80, 0x80]);
    }

    #[test]
    fn test_bayer_cell_demosaic() {
        // R=200 G=100/50 B=20 in an RG cell.
        let data = [200, 100, 50, 20];
        let raw = RawImage::new(&data, 2, 2, PixelFormat::BayerRG8);
        let out = convert_vec(&raw, TargetFormat::Rgb8).expect("convert");
        assert_eq!(out, [200, 75, 20].repeat(4));

        let bg = [20, 100, 50, 200];
        let raw = RawImage::new(&bg, 2, 2, PixelFormat::BayerBG8);
        let out = convert_vec(&raw, TargetFormat::Rgb8).expect("convert");
        assert_eq!(out, [200, 75, 20].repeat(4));
    }

    #[test]
    fn test_bayer_sample_matches_demosaic() {
        let scene = (180, 90, 30);
        for pattern in [
            PixelFormat::BayerRG8,
            PixelFormat::BayerGR8,
            PixelFormat::BayerGB8,
            PixelFormat::BayerBG8,
        ] {
            let data: Vec<u8> = [(0, 0), (1, 0), (0, 1), (1, 1)]
                .iter()
                .map(|&(x, y)| bayer_sample(pattern, x, y, scene))
                .collect();
            let raw = RawImage::new(&data, 2, 2, pattern);
            let out = convert_vec(&raw, TargetFormat::Rgb8).expect("convert");
            assert_eq!(out, [180, 90, 30].repeat(4), "{pattern}");
        }
    }

    #[test]
    fn test_yuv422_round_trip_is_close() {
        let (y, u, v) = rgb_to_yuv(200, 40, 90);
        let data = [y, u, y, v];
        let raw = RawImage::new(&data, 2, 1, PixelFormat::Yuv422);
        let out = convert_vec(&raw, TargetFormat::Rgb8).expect("convert");
        for (actual, expected) in out.iter().zip([200u8, 40, 90, 200, 40, 90]) {
            assert!(actual.abs_diff(expected) <= 3, "{out:?}");
        }
    }

    #[test]
    fn test_short_payload_is_rejected() {
        let data = [0u8; 10];
        let raw = RawImage::new(&data, 4, 4, PixelFormat::Mono8);
        assert!(matches!(
            convert_vec(&raw, TargetFormat::Bgr8),
            Err(CameraError::Conversion(_))
        ));
    }

    #[test]
    fn test_unsupported_and_malformed_inputs() {
        let data = [0u8; 64];
        let packed = RawImage::new(&data, 4, 4, PixelFormat::Mono12Packed);
        assert!(convert_vec(&packed, TargetFormat::Bgr8).is_err());

        let odd = RawImage::new(&data, 3, 2, PixelFormat::BayerGR8);
        assert!(convert_vec(&odd, TargetFormat::Bgr8).is_err());

        let odd_yuv = RawImage::new(&data, 3, 2, PixelFormat::Yuv422);
        assert!(convert_vec(&odd_yuv, TargetFormat::Bgr8).is_err());
    }

    #[test]
    fn test_small_output_is_rejected() {
        let data = [0u8; 4];
        let raw = RawImage::new(&data, 2, 2, PixelFormat::Mono8);
        let mut out = [0u8; 11];
        assert!(convert(&raw, TargetFormat::Bgr8, &mut out).is_err());
    }

    #[test]
    fn test_frame_pixel_lookup() {
        let data = [1, 2, 3, 4, 5, 6];
        let raw = RawImage::new(&data, 2, 1, PixelFormat::Rgb8);
        let mut out = [0u8; 6];
        let frame = convert(&raw, TargetFormat::Bgr8, &mut out).expect("convert");
        assert_eq!(frame.pixel_rgb(1, 0), Some((4, 5, 6)));
        assert_eq!(frame.pixel_rgb(2, 0), None);
        assert_eq!(frame.stride(), 6);
    }

    #[test]
    fn test_target_format_parse() {
        assert_eq!("BGRA8".parse::<TargetFormat>(), Ok(TargetFormat::Bgra8));
        assert!("yuv".parse::<TargetFormat>().is_err());
    }
}
