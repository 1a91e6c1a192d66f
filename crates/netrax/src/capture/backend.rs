//! Platform capture backends
//!
//! The camera adapter tries these in order; the first one that opens the
//! device wins:
//! - V4L2 (`/dev/videoN`), with the `v4l2` feature
//! - `libcamera-vid` writing MJPEG to stdout (Pi cameras)

use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::Policy;
use crate::error::CaptureError;
use crate::frame::Frame;

/// Requested pixel format and size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub fourcc: [u8; 4],
    pub width: u32,
    pub height: u32,
}

impl CaptureFormat {
    /// MJPEG at the given size
    pub fn mjpeg(width: u32, height: u32) -> Self {
        Self {
            fourcc: *b"MJPG",
            width,
            height,
        }
    }
}

/// One way of reaching a capture device
pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    /// Open the device. Success means the device reported itself opened;
    /// on failure the backend has already released anything it acquired.
    fn open(&self, device_id: u32) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// An opened capture device
pub trait CaptureDevice: Send {
    /// Apply pixel format and size. Failure is not fatal: the device is
    /// then used with whatever format it already has.
    fn configure(&mut self, format: &CaptureFormat) -> Result<(), CaptureError>;

    /// Read the next frame. `Ok(None)` means nothing arrived within the
    /// read timeout.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn release(&mut self);
}

/// Backends in the order the camera adapter should try them
pub fn default_backends(policy: &Policy) -> Vec<Box<dyn CaptureBackend>> {
    let mut backends: Vec<Box<dyn CaptureBackend>> = Vec::new();
    #[cfg(feature = "v4l2")]
    backends.push(Box::new(V4l2Backend::new(policy.poll_interval)));
    backends.push(Box::new(LibcameraBackend::new(
        policy.frame_width,
        policy.frame_height,
        policy.poll_interval,
    )));
    backends
}

/// Decode a JPEG image into a packed RGB frame
pub fn decode_jpeg(data: &[u8]) -> Result<Frame, CaptureError> {
    let rgb = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.into_rgb8();
    let (width, height) = rgb.dimensions();
    Frame::from_rgb(width, height, rgb.into_raw())
        .ok_or_else(|| CaptureError::Stream("decoded jpeg has unexpected size".into()))
}

/// Converts YUYV (YUV 4:2:2) to packed RGB using BT.601 coefficients.
///
/// Returns `None` if `data` is shorter than `width * height * 2`.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let pixel_count = width as usize * height as usize;
    let expected_len = pixel_count * 2;
    if data.len() < expected_len {
        return None;
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for chunk in data[..expected_len].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }
    Some(rgb)
}

/// Build a frame from a YUYV buffer of the given size
pub fn yuyv_frame(data: &[u8], width: u32, height: u32) -> Result<Frame, CaptureError> {
    let rgb = yuyv_to_rgb(data, width, height)
        .ok_or_else(|| CaptureError::Stream("short YUYV buffer".into()))?;
    Frame::from_rgb(width, height, rgb).ok_or_else(|| {
        CaptureError::Stream(format!("YUYV buffer does not cover {width}x{height}"))
    })
}

/// A device read that timed out means no frame this tick
#[cfg_attr(not(feature = "v4l2"), allow(dead_code))]
fn none_on_timeout<T>(result: io::Result<T>) -> Result<Option<T>, CaptureError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(CaptureError::Stream(e.to_string())),
    }
}

/// Splits a concatenated MJPEG byte stream into individual JPEG images
/// by scanning for SOI (`FF D8`) and EOI (`FF D9`) markers.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

/// Upper bound on buffered bytes before giving up on the current image
const MAX_JPEG_SIZE: usize = 8 * 1024 * 1024;

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, return every complete image found so far
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut images = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, 0, 0xD8) else {
                // keep a trailing 0xFF, it may start the next SOI
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                break;
            };
            let Some(end) = find_marker(&self.buf, start + 2, 0xD9) else {
                self.buf.drain(..start);
                if self.buf.len() > MAX_JPEG_SIZE {
                    warn!("Discarding {} bytes without JPEG end marker", self.buf.len());
                    self.buf.clear();
                }
                break;
            };
            images.push(Bytes::copy_from_slice(&self.buf[start..end + 2]));
            self.buf.drain(..end + 2);
        }

        images
    }
}

fn find_marker(buf: &[u8], from: usize, marker: u8) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|p| p + from)
}

/// Captures through a `libcamera-vid` child process emitting MJPEG
#[derive(Debug, Clone)]
pub struct LibcameraBackend {
    width: u32,
    height: u32,
    read_timeout: Duration,
    open_timeout: Duration,
}

impl LibcameraBackend {
    pub fn new(width: u32, height: u32, read_timeout: Duration) -> Self {
        Self {
            width,
            height,
            read_timeout,
            open_timeout: Duration::from_secs(3),
        }
    }

    fn args(&self, device_id: u32) -> Vec<String> {
        vec![
            "-t".into(),
            "0".into(),
            "-n".into(),
            "--camera".into(),
            device_id.to_string(),
            "--width".into(),
            self.width.to_string(),
            "--height".into(),
            self.height.to_string(),
            "--codec".into(),
            "mjpeg".into(),
            "--flush".into(),
            "-o".into(),
            "-".into(),
        ]
    }
}

impl CaptureBackend for LibcameraBackend {
    fn name(&self) -> &'static str {
        "libcamera"
    }

    fn open(&self, device_id: u32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let args = self.args(device_id);
        debug!("libcamera-vid args: {:?}", args);

        let mut child = Command::new("libcamera-vid")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map(KillOnDrop::new)
            .map_err(|e| CaptureError::Device(format!("cannot spawn libcamera-vid: {e}")))?;

        // every early return below kills the child through the guard
        let Some(stdout) = child.stdout() else {
            return Err(CaptureError::Device("libcamera-vid has no stdout".into()));
        };

        let (tx, rx) = mpsc::sync_channel(2);
        std::thread::Builder::new()
            .name("libcamera-reader".into())
            .spawn(move || read_mjpeg(stdout, tx))?;

        // the device counts as opened once the first image arrives
        let first = rx.recv_timeout(self.open_timeout).map_err(|e| {
            CaptureError::Device(format!(
                "libcamera-vid produced no image for camera {device_id}: {e}"
            ))
        })?;
        info!(
            "libcamera-vid opened camera {}: {}x{} mjpeg",
            device_id, self.width, self.height
        );
        Ok(Box::new(LibcameraDevice {
            child: child.disarm(),
            rx,
            pending: Some(first),
            format: CaptureFormat::mjpeg(self.width, self.height),
            read_timeout: self.read_timeout,
        }))
    }
}

/// Reader thread body: split stdout into JPEG images, keep the queue short
fn read_mjpeg<R: Read>(mut reader: R, tx: SyncSender<Bytes>) {
    let mut splitter = JpegSplitter::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut images = 0u64;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("libcamera-vid stream ended (EOF)");
                break;
            }
            Ok(n) => {
                for image in splitter.push(&buf[..n]) {
                    images += 1;
                    match tx.try_send(image) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => {
                            debug!("libcamera-vid consumer dropped after {} images", images);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Error reading libcamera-vid stream: {}", e);
                break;
            }
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Owns a child process until it is handed over, killing it if dropped first
struct KillOnDrop(Option<Child>);

impl KillOnDrop {
    fn new(child: Child) -> Self {
        Self(Some(child))
    }

    fn stdout(&mut self) -> Option<ChildStdout> {
        self.0.as_mut().and_then(|child| child.stdout.take())
    }

    fn disarm(mut self) -> Option<Child> {
        self.0.take()
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            kill(&mut child);
        }
    }
}

struct LibcameraDevice {
    child: Option<Child>,
    rx: Receiver<Bytes>,
    pending: Option<Bytes>,
    format: CaptureFormat,
    read_timeout: Duration,
}

impl CaptureDevice for LibcameraDevice {
    fn configure(&mut self, format: &CaptureFormat) -> Result<(), CaptureError> {
        // format and size are fixed on the command line at spawn
        if *format == self.format {
            Ok(())
        } else {
            Err(CaptureError::Device(format!(
                "libcamera-vid is running at {}x{}",
                self.format.width, self.format.height
            )))
        }
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut latest = match self.pending.take() {
            Some(image) => image,
            None => match self.rx.recv_timeout(self.read_timeout) {
                Ok(image) => image,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::Stream("libcamera-vid exited".into()))
                }
            },
        };
        while let Ok(newer) = self.rx.try_recv() {
            latest = newer;
        }
        decode_jpeg(&latest).map(Some)
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping libcamera-vid");
            kill(&mut child);
        }
    }
}

impl Drop for LibcameraDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "v4l2")]
pub use self::v4l2::V4l2Backend;

#[cfg(feature = "v4l2")]
mod v4l2 {
    use std::time::Duration;

    use v4l::buffer::Type;
    use v4l::io::mmap::Stream as MmapStream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, Format, FourCC};

    use super::{
        decode_jpeg, none_on_timeout, yuyv_frame, CaptureBackend, CaptureDevice, CaptureFormat,
    };
    use crate::error::CaptureError;
    use crate::frame::Frame;

    /// Video4Linux2 capture through `/dev/videoN`
    #[derive(Debug, Clone, Copy)]
    pub struct V4l2Backend {
        read_timeout: Duration,
    }

    impl V4l2Backend {
        /// `read_timeout` bounds how long one read waits for a buffer
        pub fn new(read_timeout: Duration) -> Self {
            Self { read_timeout }
        }
    }

    impl CaptureBackend for V4l2Backend {
        fn name(&self) -> &'static str {
            "v4l2"
        }

        fn open(&self, device_id: u32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            let device = Device::new(device_id as usize)?;
            let format = Capture::format(&device)?;
            tracing::info!(
                "Opened /dev/video{}: {}x{} {}",
                device_id,
                format.width,
                format.height,
                format.fourcc
            );
            Ok(Box::new(V4l2Device {
                device: Some(device),
                format,
                stream: None,
                read_timeout: self.read_timeout,
            }))
        }
    }

    struct V4l2Device {
        device: Option<Device>,
        format: Format,
        stream: Option<MmapStream<'static>>,
        read_timeout: Duration,
    }

    impl CaptureDevice for V4l2Device {
        fn configure(&mut self, format: &CaptureFormat) -> Result<(), CaptureError> {
            let device = self
                .device
                .as_ref()
                .ok_or_else(|| CaptureError::Device("device released".into()))?;
            let actual = Capture::set_format(
                device,
                &Format::new(format.width, format.height, FourCC::new(&format.fourcc)),
            )?;
            self.format = actual;
            if actual.fourcc.repr != format.fourcc
                || actual.width != format.width
                || actual.height != format.height
            {
                return Err(CaptureError::Device(format!(
                    "device settled on {}x{} {}",
                    actual.width, actual.height, actual.fourcc
                )));
            }
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.stream.is_none() {
                let device = self
                    .device
                    .as_ref()
                    .ok_or_else(|| CaptureError::Device("device released".into()))?;
                let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|e| CaptureError::Stream(e.to_string()))?;
                stream.set_timeout(self.read_timeout);
                self.stream = Some(stream);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };

            let Some((data, _meta)) = none_on_timeout(CaptureStream::next(stream))? else {
                return Ok(None);
            };
            let (width, height) = (self.format.width, self.format.height);
            match &self.format.fourcc.repr {
                b"MJPG" => decode_jpeg(data).map(Some),
                b"YUYV" => yuyv_frame(data, width, height).map(Some),
                other => Err(CaptureError::Device(format!(
                    "unsupported pixel format {}",
                    String::from_utf8_lossy(other)
                ))),
            }
        }

        fn release(&mut self) {
            self.stream.take();
            self.device.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(body);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    #[test]
    fn splitter_finds_back_to_back_images() {
        let mut stream = fake_jpeg(&[1, 2, 3]);
        stream.extend(fake_jpeg(&[4, 5]));

        let images = JpegSplitter::new().push(&stream);
        assert_eq!(images.len(), 2);
        assert_eq!(&images[0][..], &fake_jpeg(&[1, 2, 3])[..]);
        assert_eq!(&images[1][..], &fake_jpeg(&[4, 5])[..]);
    }

    #[test]
    fn splitter_handles_images_split_across_reads() {
        let image = fake_jpeg(&[9; 100]);
        let mut splitter = JpegSplitter::new();

        let mut found = Vec::new();
        for chunk in image.chunks(7) {
            found.extend(splitter.push(chunk));
        }
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0][..], &image[..]);
    }

    #[test]
    fn splitter_handles_marker_split_between_reads() {
        let image = fake_jpeg(&[1, 2, 3]);
        let mut splitter = JpegSplitter::new();
        assert!(splitter.push(&[0x00, 0xFF]).is_empty());
        let found = splitter.push(&image[1..]);
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0][..], &image[..]);
    }

    #[test]
    fn splitter_skips_garbage_before_soi() {
        let mut stream = vec![0x00, 0x11, 0x22];
        stream.extend(fake_jpeg(&[7]));
        let images = JpegSplitter::new().push(&stream);
        assert_eq!(images.len(), 1);
        assert_eq!(&images[0][..], &fake_jpeg(&[7])[..]);
    }

    #[test]
    fn yuyv_gray_maps_to_gray() {
        // Y=128, U=V=128 is mid gray
        let rgb = yuyv_to_rgb(&[128, 128, 128, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![128; 6]);
        assert!(yuyv_to_rgb(&[0; 3], 2, 1).is_none());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_jpeg(&fake_jpeg(&[1, 2, 3])),
            Err(CaptureError::Decode(_))
        ));
    }

    #[test]
    fn decode_roundtrips_real_jpeg() {
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(&[200u8; 8 * 8 * 3], 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();

        let frame = decode_jpeg(&jpeg).unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 8));
        assert_eq!(frame.pixels().len(), 8 * 8 * 3);
    }

    #[test]
    fn libcamera_args_request_mjpeg() {
        let backend = LibcameraBackend::new(640, 480, Duration::from_millis(20));
        let args = backend.args(1);
        let joined = args.join(" ");
        assert!(joined.contains("--codec mjpeg"));
        assert!(joined.contains("--camera 1"));
        assert!(joined.contains("--width 640 --height 480"));
    }

    #[test]
    fn default_backends_end_with_libcamera() {
        let backends = default_backends(&Policy::default());
        assert_eq!(backends.last().unwrap().name(), "libcamera");
    }

    #[test]
    fn odd_width_yuyv_is_a_stream_error() {
        // 3x1: the last pixel has no YUYV pair
        let data = vec![128u8; 3 * 2];
        let err = yuyv_frame(&data, 3, 1).unwrap_err();
        assert!(matches!(err, CaptureError::Stream(_)));

        let frame = yuyv_frame(&vec![128u8; 4 * 2 * 2], 4, 2).unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 2));
        assert!(matches!(yuyv_frame(&[0u8; 4], 4, 2), Err(CaptureError::Stream(_))));
    }

    #[test]
    fn dropped_guard_kills_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        drop(KillOnDrop::new(child));
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn disarmed_guard_hands_child_over() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut child = KillOnDrop::new(child).disarm().unwrap();
        assert!(child.try_wait().unwrap().is_none());
        kill(&mut child);
    }

    #[test]
    fn read_timeout_is_no_frame() {
        let timed_out: io::Result<u8> = Err(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"));
        assert!(none_on_timeout(timed_out).unwrap().is_none());
        assert_eq!(none_on_timeout(Ok(7u8)).unwrap(), Some(7));

        let gone: io::Result<u8> = Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        assert!(matches!(none_on_timeout(gone), Err(CaptureError::Stream(_))));
    }
}
