//! DBGp wire protocol codec
//!
//! DBGp frames are `<ascii-decimal-length>\0<xml-bytes>\0`. The length is
//! a byte count, so the decoder operates on raw bytes and only converts
//! to UTF-8 once a complete payload is extracted.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Streaming frame decoder over an accumulating byte buffer
///
/// Feed arbitrary chunks; complete XML payloads come out in order. A
/// malformed length prefix is recovered from by skipping past its NUL.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain all complete frames
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(nul) = self.buffer.iter().position(|&b| b == 0) else {
                break;
            };

            let length = std::str::from_utf8(&self.buffer[..nul])
                .ok()
                .and_then(|s| s.parse::<i64>().ok());

            let length = match length {
                Some(l) if l > 0 => l as usize,
                _ => {
                    tracing::warn!(
                        prefix = %String::from_utf8_lossy(&self.buffer[..nul]),
                        "malformed DBGp length prefix, resynchronizing"
                    );
                    self.buffer.drain(..=nul);
                    continue;
                }
            };

            // Payload plus its trailing NUL must be present
            if self.buffer.len() < nul + 1 + length + 1 {
                break;
            }

            let payload = self.buffer[nul + 1..nul + 1 + length].to_vec();
            self.buffer.drain(..nul + 1 + length + 1);
            frames.push(String::from_utf8_lossy(&payload).into_owned());
        }

        frames
    }
}

/// Encode a DBGp command frame: `<verb> -i <txid> <args>\0`
///
/// `data`, when present, is base64-encoded after a literal `--` separator
/// per the DBGp convention for free-form payloads.
pub fn encode_command(
    verb: &str,
    txid: u32,
    args: &[(&str, String)],
    data: Option<&[u8]>,
) -> Vec<u8> {
    let mut command = format!("{verb} -i {txid}");
    for (flag, value) in args {
        command.push_str(&format!(" {flag} {value}"));
    }
    if let Some(data) = data {
        command.push_str(" -- ");
        command.push_str(&STANDARD.encode(data));
    }

    let mut bytes = command.into_bytes();
    bytes.push(0);
    bytes
}

/// Decode a `file://` URI into a plain path
///
/// Percent escapes are decoded; if any escape is invalid the remainder is
/// returned unchanged (scheme still stripped). Non-URI inputs pass
/// through untouched.
pub fn decode_file_uri(value: &str) -> String {
    let Some(rest) = value.strip_prefix("file://") else {
        return value.to_string();
    };
    percent_decode(rest).unwrap_or_else(|| rest.to_string())
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(xml: &str) -> Vec<u8> {
        let mut out = xml.len().to_string().into_bytes();
        out.push(0);
        out.extend_from_slice(xml.as_bytes());
        out.push(0);
        out
    }

    #[test]
    fn decodes_single_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame("<init/>"));
        assert_eq!(frames, vec!["<init/>"]);
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let mut wire = frame("<response command=\"run\"/>");
        wire.extend_from_slice(&frame("<response command=\"st\u{00e9}p\"/>"));

        let mut whole = FrameDecoder::new();
        let expected = whole.feed(&wire);
        assert_eq!(expected.len(), 2);

        let mut dribble = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in &wire {
            got.extend(dribble.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn length_is_bytes_not_chars() {
        // "é" is two bytes in UTF-8
        let xml = "<a v=\"\u{00e9}\"/>";
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame(xml));
        assert_eq!(frames, vec![xml]);
    }

    #[test]
    fn recovers_from_garbage_length_prefix() {
        let mut wire = b"not-a-number\0".to_vec();
        wire.extend_from_slice(&frame("<init/>"));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire);
        assert_eq!(frames, vec!["<init/>"]);
    }

    #[test]
    fn recovers_from_zero_length() {
        let mut wire = b"0\0".to_vec();
        wire.extend_from_slice(&frame("<init/>"));

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&wire), vec!["<init/>"]);
    }

    #[test]
    fn incomplete_frame_waits_for_more_input() {
        let wire = frame("<response/>");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&wire[..5]).is_empty());
        assert_eq!(decoder.feed(&wire[5..]), vec!["<response/>"]);
    }

    #[test]
    fn encodes_command_with_base64_payload() {
        let bytes = encode_command(
            "breakpoint_set",
            7,
            &[("-t", "conditional".to_string()), ("-n", "42".to_string())],
            Some("$i === 50".as_bytes()),
        );
        let text = String::from_utf8(bytes[..bytes.len() - 1].to_vec()).unwrap();
        assert_eq!(
            text,
            format!(
                "breakpoint_set -i 7 -t conditional -n 42 -- {}",
                STANDARD.encode("$i === 50")
            )
        );
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn base64_round_trips_utf8() {
        let original = "if ($名前 === \"héllo\") { return; }";
        let encoded = STANDARD.encode(original);
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), original);
    }

    #[test]
    fn decodes_file_uris() {
        assert_eq!(
            decode_file_uri("file:///var/www/html/a%20b.php"),
            "/var/www/html/a b.php"
        );
        assert_eq!(decode_file_uri("/plain/path.php"), "/plain/path.php");
        // Invalid escape passes through with the scheme stripped
        assert_eq!(decode_file_uri("file:///bad%zz"), "/bad%zz");
    }
}
