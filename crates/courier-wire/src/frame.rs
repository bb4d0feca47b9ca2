/// End-of-message delimiter. Every frame on the wire is followed by these
/// three bytes.
pub const EOM: &[u8] = b"\n\nx";

/// Inbound frame accumulator for one byte stream.
///
/// A single TCP read may carry zero, one, or many frames, and a frame may
/// span reads. `extend` appends the new bytes, splits on [`EOM`] and returns
/// every complete frame; the trailing fragment (empty iff the input ended on
/// the delimiter) is retained as the prefix of the next frame.
///
/// The accumulator is bounded: if the buffered bytes ever exceed the limit,
/// the whole buffer is dropped and accumulation restarts from empty. The
/// stream itself stays usable.
#[derive(Debug)]
pub struct FrameBuf {
    buf: Vec<u8>,
    limit: usize,
}

impl FrameBuf {
    pub fn with_limit(limit: usize) -> Self {
        Self { buf: Vec::new(), limit }
    }

    /// Append `chunk` and extract every complete frame.
    ///
    /// Empty frames are dropped. Frames that are not valid UTF-8 are dropped
    /// silently; corrupt input from a peer is tolerated, not an error.
    pub fn extend(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        if self.buf.len() > self.limit {
            self.buf.clear();
            return Vec::new();
        }

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = find_eom(&self.buf[start..]) {
            let frame = &self.buf[start..start + pos];
            if !frame.is_empty()
                && let Ok(text) = core::str::from_utf8(frame)
            {
                frames.push(text.to_owned());
            }
            start += pos + EOM.len();
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        frames
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Frame `payload` for the wire: payload bytes followed by [`EOM`].
pub fn frame(payload: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + EOM.len());
    frame_into(&mut buf, payload.as_bytes());
    buf
}

/// Append payload + [`EOM`] to an existing buffer. Lets callers coalesce
/// several frames into one send.
pub fn frame_into(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(payload);
    buf.extend_from_slice(EOM);
}

fn find_eom(buf: &[u8]) -> Option<usize> {
    buf.windows(EOM.len()).position(|w| w == EOM)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 10 * 1024;

    #[test]
    fn single_frame() {
        let mut rx = FrameBuf::with_limit(LIMIT);
        assert_eq!(rx.extend(b"PUBLISH t hello\n\nx"), vec!["PUBLISH t hello"]);
        assert!(rx.is_empty());
    }

    #[test]
    fn many_frames_one_chunk() {
        let mut rx = FrameBuf::with_limit(LIMIT);
        let frames = rx.extend(b"a\n\nxb\n\nxc\n\nx");
        assert_eq!(frames, vec!["a", "b", "c"]);
        assert!(rx.is_empty());
    }

    #[test]
    fn frame_spanning_chunks() {
        let mut rx = FrameBuf::with_limit(LIMIT);
        assert!(rx.extend(b"PUBLISH t he").is_empty());
        assert!(rx.extend(b"llo").is_empty());
        assert_eq!(rx.extend(b"\n\nx"), vec!["PUBLISH t hello"]);
    }

    #[test]
    fn split_mid_delimiter() {
        // `…hello\n` then `\nx`: the delimiter itself straddles two reads.
        let mut rx = FrameBuf::with_limit(LIMIT);
        assert!(rx.extend(b"PUBLISH t hello\n").is_empty());
        assert_eq!(rx.extend(b"\nx"), vec!["PUBLISH t hello"]);
        assert!(rx.is_empty());
    }

    #[test]
    fn trailing_fragment_retained() {
        let mut rx = FrameBuf::with_limit(LIMIT);
        assert_eq!(rx.extend(b"one\n\nxtwo"), vec!["one"]);
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.extend(b"\n\nx"), vec!["two"]);
    }

    #[test]
    fn empty_frames_dropped() {
        let mut rx = FrameBuf::with_limit(LIMIT);
        assert!(rx.extend(b"\n\nx\n\nx").is_empty());
        assert!(rx.is_empty());
    }

    #[test]
    fn invalid_utf8_dropped() {
        let mut rx = FrameBuf::with_limit(LIMIT);
        let frames = rx.extend(b"ok\n\nx\xff\xfe\n\nxalso ok\n\nx");
        assert_eq!(frames, vec!["ok", "also ok"]);
    }

    #[test]
    fn overflow_resets_buffer() {
        let mut rx = FrameBuf::with_limit(16);
        assert!(rx.extend(b"0123456789").is_empty());
        // Crosses the limit: everything accumulated so far is dumped.
        assert!(rx.extend(b"0123456789").is_empty());
        assert!(rx.is_empty());
        // The stream keeps working afterwards.
        assert_eq!(rx.extend(b"next\n\nx"), vec!["next"]);
    }

    #[test]
    fn overflow_drops_completable_frames_too() {
        let mut rx = FrameBuf::with_limit(8);
        assert!(rx.extend(b"msg\n\nxmore").is_empty());
        assert!(rx.is_empty());
    }

    #[test]
    fn roundtrip_any_partition() {
        let wire: Vec<u8> = ["alpha", "beta gamma", "delta"]
            .iter()
            .flat_map(|m| frame(m))
            .collect();
        // Feed the same bytes one byte at a time.
        let mut rx = FrameBuf::with_limit(LIMIT);
        let mut got = Vec::new();
        for b in &wire {
            got.extend(rx.extend(core::slice::from_ref(b)));
        }
        assert_eq!(got, vec!["alpha", "beta gamma", "delta"]);
        assert!(rx.is_empty());
    }

    #[test]
    fn frame_appends_delimiter() {
        assert_eq!(frame("x y"), b"x y\n\nx");
        let mut buf = Vec::new();
        frame_into(&mut buf, b"a");
        frame_into(&mut buf, b"");
        assert_eq!(buf, b"a\n\nx\n\nx");
    }
}
