//! Canonical hex rendering of a Z-Wave frame, and the offset mapping back
//! to raw bytes that rule matching and template capture substitution rely
//! on.
//!
//! Every frame is rendered as uppercase hex byte pairs separated by single
//! spaces (`"01 03 00 02 FE"`). Regex matching happens against this
//! rendering, never against raw bytes, so that patterns stay portable
//! across implementations (DESIGN NOTES, "Hex rendering is canonical").
//! A rendering is exactly 3 bytes of text per input byte except for the
//! very first, which has no leading space — capture offsets are mapped
//! back to byte indices by integer division by 3.

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Render `frame` as space-separated uppercase hex.
pub fn render(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len() * 3);
    for (i, &b) in frame.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
        out.push(HEX_DIGITS[(b & 0xF) as usize] as char);
    }
    out
}

/// Map a byte range within the rendered hex string (as produced by
/// [`render`]) back to a byte range within the original frame.
///
/// `start`/`end` are the string offsets of a regex match (e.g.
/// `Match::start()`/`Match::end()`). Because each byte occupies exactly 3
/// characters in the rendering except that the first byte has no leading
/// space, dividing by 3 recovers the byte index for every *start* of a
/// 2-hex-digit run; the `end` offset is adjusted by rounding the trailing
/// partial group (`"FE"`, no trailing space) up by 2 before dividing.
pub fn byte_range_of(start: usize, end: usize) -> (usize, usize) {
    let byte_start = start / 3;
    // `end` points just past the last hex digit of the final matched byte,
    // with no trailing separator to account for; (end + 2) / 3 performs
    // the equivalent of the C source's `(2 + rm_eo - rm_so) / 3` length
    // computation but expressed as an end-offset.
    let byte_end = (end + 2) / 3;
    (byte_start, byte_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty() {
        assert_eq!(render(&[]), "");
    }

    #[test]
    fn render_single_byte() {
        assert_eq!(render(&[0xFE]), "FE");
    }

    #[test]
    fn render_multiple_bytes_uppercase() {
        assert_eq!(render(&[0x01, 0x03, 0x00, 0x02, 0xFE]), "01 03 00 02 FE");
    }

    #[test]
    fn byte_range_of_first_byte() {
        // "01 03 00" - byte 0 ("01") spans string offsets 0..2
        assert_eq!(byte_range_of(0, 2), (0, 1));
    }

    #[test]
    fn byte_range_of_whole_match() {
        let rendered = render(&[0x01, 0x05, 0x00, 0x04, 0x00, 0x01, 0xFB]);
        assert_eq!(rendered, "01 05 00 04 00 01 FB");
        // whole-match capture spans the entire rendered string
        let (s, e) = byte_range_of(0, rendered.len());
        assert_eq!((s, e), (0, 7));
    }

    #[test]
    fn byte_range_of_middle_group() {
        let rendered = render(&[0x01, 0x05, 0x00, 0x04, 0x00, 0x01, 0xFB]);
        // group covering bytes 2..4 ("00 04") starts at string offset 6, ends at 11
        let start = rendered.find("00 04").unwrap();
        let end = start + "00 04".len();
        assert_eq!(byte_range_of(start, end), (2, 4));
    }
}
