//! Wire framing for the sensor link: `<a,b,c,d|checksum>` in ASCII, where
//! the checksum is the sum of the four fields modulo 256.

use crate::error::ProtocolError;

pub const START: u8 = b'<';
pub const END: u8 = b'>';
const SEPARATOR: char = '|';

/// Runaway input without a frame in it is discarded past this length.
pub const MAX_BUFFERED: usize = 256;

/// Four raw integers in field order: soil A, soil B, main tank, second tank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub fields: [i64; 4],
}

impl RawFrame {
    pub fn new(soil_a: i64, soil_b: i64, main_tank: i64, second_tank: i64) -> Self {
        Self {
            fields: [soil_a, soil_b, main_tank, second_tank],
        }
    }

    pub fn checksum(&self) -> u32 {
        checksum(&self.fields)
    }

    /// `<a,b,c,d|sum>` including both markers.
    pub fn encode(&self) -> String {
        let [a, b, c, d] = self.fields;
        format!("<{a},{b},{c},{d}|{}>", self.checksum())
    }
}

pub fn checksum(fields: &[i64]) -> u32 {
    fields
        .iter()
        .fold(0i64, |acc, v| acc.wrapping_add(*v))
        .rem_euclid(256) as u32
}

/// Decode the text between the markers.
pub fn parse_body(body: &[u8]) -> Result<RawFrame, ProtocolError> {
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::NotText)?;
    let (values, sum) = text
        .split_once(SEPARATOR)
        .ok_or_else(|| ProtocolError::MissingSeparator(text.to_string()))?;

    let parts: Vec<&str> = values.split(',').collect();
    if parts.len() != 4 {
        return Err(ProtocolError::FieldCount(parts.len()));
    }

    let mut fields = [0i64; 4];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        *slot = part
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadField(part.to_string()))?;
    }

    let transmitted: u32 = sum
        .trim()
        .parse()
        .map_err(|_| ProtocolError::BadChecksum(sum.to_string()))?;
    let computed = checksum(&fields);
    if transmitted != computed {
        return Err(ProtocolError::ChecksumMismatch {
            transmitted,
            computed,
        });
    }

    Ok(RawFrame { fields })
}

/// Accumulates bytes from the transport and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next delimited frame, consuming everything through its
    /// end marker. Returns `None` once no complete frame remains, after
    /// compacting the buffer to the most recent start marker.
    pub fn next_frame(&mut self) -> Option<Result<RawFrame, ProtocolError>> {
        loop {
            let Some(end) = self.buf.iter().position(|&b| b == END) else {
                self.compact();
                return None;
            };
            match self.buf[..end].iter().rposition(|&b| b == START) {
                Some(start) => {
                    let parsed = parse_body(&self.buf[start + 1..end]);
                    self.buf.drain(..=end);
                    return Some(parsed);
                }
                // end marker with nothing opened before it
                None => {
                    self.buf.drain(..=end);
                }
            }
        }
    }

    fn compact(&mut self) {
        match self.buf.iter().rposition(|&b| b == START) {
            Some(start) => {
                self.buf.drain(..start);
            }
            None => self.buf.clear(),
        }
        if self.buf.len() > MAX_BUFFERED {
            self.buf.clear();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frames(buf: &mut FrameBuffer) -> Vec<Result<RawFrame, ProtocolError>> {
        std::iter::from_fn(|| buf.next_frame()).collect()
    }

    // -- Body parsing -----------------------------------------------------

    #[test]
    fn parses_reference_frame() {
        let frame = parse_body(b"45,60,10,90|205").unwrap();
        assert_eq!(frame, RawFrame::new(45, 60, 10, 90));
    }

    #[test]
    fn checksum_wraps_at_256() {
        assert_eq!(checksum(&[200, 100, 0, 0]), 44);
        assert_eq!(checksum(&[256, 0, 0, 0]), 0);
        assert_eq!(checksum(&[-1, 0, 0, 0]), 255);
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let err = parse_body(b"45,60,10,90|204").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ChecksumMismatch {
                transmitted: 204,
                computed: 205
            }
        );
    }

    #[test]
    fn wrong_field_count_rejected() {
        assert_eq!(
            parse_body(b"1,2,3|6").unwrap_err(),
            ProtocolError::FieldCount(3)
        );
        assert_eq!(
            parse_body(b"1,2,3,4,5|15").unwrap_err(),
            ProtocolError::FieldCount(5)
        );
    }

    #[test]
    fn non_numeric_field_rejected() {
        assert!(matches!(
            parse_body(b"1,x,3,4|8").unwrap_err(),
            ProtocolError::BadField(f) if f == "x"
        ));
    }

    #[test]
    fn non_numeric_checksum_rejected() {
        assert!(matches!(
            parse_body(b"1,2,3,4|ab").unwrap_err(),
            ProtocolError::BadChecksum(_)
        ));
    }

    #[test]
    fn missing_separator_rejected() {
        assert!(matches!(
            parse_body(b"1,2,3,4").unwrap_err(),
            ProtocolError::MissingSeparator(_)
        ));
    }

    #[test]
    fn fields_tolerate_whitespace() {
        let frame = parse_body(b" 1, 2 ,3,4 | 10\r").unwrap();
        assert_eq!(frame.fields, [1, 2, 3, 4]);
    }

    // -- Framing ----------------------------------------------------------

    #[test]
    fn frame_split_across_chunks() {
        let mut buf = FrameBuffer::new();
        buf.push(b"<45,60,");
        assert!(buf.next_frame().is_none());
        buf.push(b"10,90|205>");
        let frame = buf.next_frame().unwrap().unwrap();
        assert_eq!(frame.fields, [45, 60, 10, 90]);
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut buf = FrameBuffer::new();
        buf.push(b"<1,2,3,4|10><5,6,7,8|26>");
        let got = frames(&mut buf);
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].as_ref().unwrap().fields, [5, 6, 7, 8]);
    }

    #[test]
    fn garbage_before_start_is_discarded() {
        let mut buf = FrameBuffer::new();
        buf.push(b"noise>>junk<1,2,3,4|10>");
        let got = frames(&mut buf);
        assert_eq!(got, vec![Ok(RawFrame::new(1, 2, 3, 4))]);
        assert!(buf.is_empty());
    }

    #[test]
    fn restart_marker_resyncs_to_latest_start() {
        let mut buf = FrameBuffer::new();
        // truncated frame followed by a complete one
        buf.push(b"<1,2,<5,6,7,8|26>");
        let got = frames(&mut buf);
        assert_eq!(got, vec![Ok(RawFrame::new(5, 6, 7, 8))]);
    }

    #[test]
    fn incomplete_tail_kept_from_last_start() {
        let mut buf = FrameBuffer::new();
        buf.push(b"xx<1,2<3,4");
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.len(), "<3,4".len());
    }

    #[test]
    fn bad_frame_reported_then_stream_continues() {
        let mut buf = FrameBuffer::new();
        buf.push(b"<1,2,3,4|99><1,2,3,4|10>");
        let got = frames(&mut buf);
        assert!(matches!(got[0], Err(ProtocolError::ChecksumMismatch { .. })));
        assert_eq!(got[1], Ok(RawFrame::new(1, 2, 3, 4)));
    }

    #[test]
    fn runaway_input_is_cleared() {
        let mut buf = FrameBuffer::new();
        let mut junk = vec![START];
        junk.extend(std::iter::repeat(b'9').take(MAX_BUFFERED + 10));
        buf.push(&junk);
        assert!(buf.next_frame().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn input_without_start_is_dropped() {
        let mut buf = FrameBuffer::new();
        buf.push(b"hello world");
        assert!(buf.next_frame().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_matches_reference() {
        assert_eq!(RawFrame::new(45, 60, 10, 90).encode(), "<45,60,10,90|205>");
    }

    // -- Properties -------------------------------------------------------

    proptest! {
        #[test]
        fn checksum_is_sum_mod_256(a in 0i64..5000, b in 0i64..5000, c in 0i64..5000, d in 0i64..5000) {
            let sum = checksum(&[a, b, c, d]);
            prop_assert_eq!(sum as i64, (a + b + c + d) % 256);
        }

        #[test]
        fn altered_checksum_is_rejected(a in 0i64..1024, b in 0i64..1024, c in 0i64..1024, d in 0i64..1024, delta in 1u32..256) {
            let good = checksum(&[a, b, c, d]);
            let bad = (good + delta) % 256;
            let body = format!("{a},{b},{c},{d}|{bad}");
            let is_mismatch = matches!(
                parse_body(body.as_bytes()),
                Err(ProtocolError::ChecksumMismatch { .. })
            );
            prop_assert!(is_mismatch);
        }

        #[test]
        fn arbitrary_bytes_never_overflow_buffer(chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..32)) {
            let mut buf = FrameBuffer::new();
            for chunk in chunks {
                buf.push(&chunk);
                while buf.next_frame().is_some() {}
                prop_assert!(buf.len() <= MAX_BUFFERED);
            }
        }
    }
}
