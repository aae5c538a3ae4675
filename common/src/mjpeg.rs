//! Motion-JPEG helpers.
//!
//! Two unrelated things go by the name MJPEG here:
//! - the HTTP flavour, a `multipart/x-mixed-replace` response where every part is one JPEG,
//! - raw MJPEG files/pipes, which are nothing more than JPEG images written back to back.
//!
//! `as_jpeg_stream_item` produces parts of the former, `JpegSplitter` cuts the latter into
//! individual images.
use bytes::Bytes;

/// Boundary separating the parts of a multipart frame stream.
pub const BOUNDARY: &str = "frame";

/// Content type of a multipart frame stream.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap an encoded JPEG into one part of a multipart frame stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;

/// Outcome of scanning the buffer for one complete image.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// A complete image spans `start..end`.
    Complete { start: usize, end: usize },
    /// An image starts at `start` but is not complete yet.
    Incomplete { start: usize },
    /// The bytes after `start` are not a valid JPEG, drop them up to `resume`.
    Corrupt { resume: usize },
    /// No start-of-image marker in the buffer.
    NoImage,
}

/// Split a byte stream of concatenated JPEG images into single images.
///
/// Bytes are fed with `push` as they arrive; `next_frame` returns complete images in order.
/// Segment lengths are honoured, so end-of-image markers inside embedded thumbnails do not
/// cut an image short. Garbage between images is skipped.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as part of an image.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete image out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match scan(&self.buf) {
                Scan::Complete { start, end } => {
                    let frame = self.buf[start..end].to_vec();
                    self.buf.drain(..end);
                    return Some(frame);
                }
                Scan::Incomplete { start } => {
                    self.buf.drain(..start);
                    return None;
                }
                Scan::Corrupt { resume } => {
                    self.buf.drain(..resume);
                }
                Scan::NoImage => {
                    // Keep a trailing 0xFF, it may be the first half of the next SOI.
                    let keep = usize::from(self.buf.last() == Some(&MARKER));
                    let cut = self.buf.len() - keep;
                    self.buf.drain(..cut);
                    return None;
                }
            }
        }
    }
}

fn find_soi(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w[0] == MARKER && w[1] == SOI)
}

fn scan(data: &[u8]) -> Scan {
    let start = match find_soi(data) {
        Some(start) => start,
        None => return Scan::NoImage,
    };
    let incomplete = Scan::Incomplete { start };

    let mut pos = start + 2;
    loop {
        if pos + 1 >= data.len() {
            return incomplete;
        }
        if data[pos] != MARKER {
            return Scan::Corrupt { resume: start + 2 };
        }
        let marker = data[pos + 1];
        match marker {
            // Fill byte in front of a marker
            MARKER => pos += 1,
            EOI => {
                return Scan::Complete {
                    start,
                    end: pos + 2,
                }
            }
            TEM | 0xD0..=0xD7 => pos += 2,
            SOI => return Scan::Corrupt { resume: pos },
            _ => {
                if pos + 3 >= data.len() {
                    return incomplete;
                }
                let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
                if length < 2 {
                    return Scan::Corrupt { resume: start + 2 };
                }
                pos += 2 + length;

                if marker == SOS {
                    // Entropy-coded data follows; 0xFF is stuffed with 0x00 there and restart
                    // markers may appear, anything else is the next real marker.
                    match skip_entropy_coded(data, pos) {
                        Some(next_marker) => pos = next_marker,
                        None => return incomplete,
                    }
                }
            }
        }
    }
}

/// Return the index of the first marker following entropy-coded data starting at `pos`.
fn skip_entropy_coded(data: &[u8], mut pos: usize) -> Option<usize> {
    while pos + 1 < data.len() {
        if data[pos] != MARKER {
            pos += 1;
            continue;
        }
        match data[pos + 1] {
            0x00 | 0xD0..=0xD7 => pos += 2,
            MARKER => pos += 1,
            _ => return Some(pos),
        }
    }
    None
}
