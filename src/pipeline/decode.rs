//! Streaming decoders (Bytes -> SSE frames)
//!
//! Frame semantics stay out of this module: it only splits the byte stream on blank
//! lines, joins `data:` lines and remembers the `event:` name. Drivers interpret the
//! payload.

use crate::BoxStream;
use bytes::Bytes;
use futures::{stream, StreamExt};

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn is_done_signal(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(self.data.trim()).ok()
    }
}

/// Parse one raw frame (the text between two blank lines). Comment-only or empty frames
/// yield `None`.
pub fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let v = &line[idx + 1..];
                (&line[..idx], v.strip_prefix(' ').unwrap_or(v))
            }
            // Bare JSON lines (some gateways drop the `data:` prefix).
            None => ("data", line),
        };
        match field {
            "event" => event = Some(value.trim().to_string()),
            "data" => data.push(value),
            // A line like `{"a":1}` has a ':' inside the payload; treat non-field lines as data.
            _ if line.trim_start().starts_with('{') => data.push(line),
            _ => {}
        }
    }
    if data.is_empty() && event.is_none() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Incrementally buffer bytes and emit complete frames. The `[DONE]` sentinel ends the
/// stream; trailing bytes without a final blank line are flushed at EOF.
pub struct SseDecoder;

impl SseDecoder {
    pub fn decode(input: BoxStream<'static, Bytes>) -> BoxStream<'static, SseFrame> {
        let stream = stream::unfold(
            (input, Vec::<u8>::new(), false),
            |(mut input, mut buf, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(idx) = find_delimiter(&buf) {
                        let raw = String::from_utf8_lossy(&buf[..idx]).into_owned();
                        buf.drain(..idx + 2);
                        match parse_frame(&raw) {
                            Some(frame) if frame.is_done_signal() => return None,
                            Some(frame) => return Some((Ok(frame), (input, buf, false))),
                            None => continue,
                        }
                    }

                    match input.next().await {
                        Some(Ok(bytes)) => {
                            // CRLF framing is normalised to LF.
                            buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
                        }
                        Some(Err(e)) => return Some((Err(e), (input, buf, true))),
                        None => {
                            let raw = String::from_utf8_lossy(&buf).into_owned();
                            return match parse_frame(&raw) {
                                Some(frame) if !frame.is_done_signal() => {
                                    Some((Ok(frame), (input, Vec::new(), true)))
                                }
                                _ => None,
                            };
                        }
                    }
                }
            },
        );
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> BoxStream<'static, Bytes> {
        let owned: Vec<crate::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        Box::pin(stream::iter(owned))
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks() {
        let input = chunks(&[
            "event: message_start\nda",
            "ta: {\"a\":1}\n\ndata: {\"b\":2}\r\n\r\n",
            ": keep-alive\n\n",
            "data: [DONE]\n\ndata: {\"ignored\":true}\n\n",
        ]);
        let frames: Vec<SseFrame> = SseDecoder::decode(input)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].json().unwrap()["a"], 1);
        assert_eq!(frames[1].data, "{\"b\":2}");
    }

    #[tokio::test]
    async fn test_trailing_frame_flushed_at_eof() {
        let input = chunks(&["data: {\"x\":1}\n\ndata: {\"y\":2}"]);
        let frames: Vec<SseFrame> = SseDecoder::decode(input)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].json().unwrap()["y"], 2);
    }

    #[test]
    fn test_multiline_data_joined() {
        let f = parse_frame("data: line1\ndata: line2").unwrap();
        assert_eq!(f.data, "line1\nline2");
        assert!(parse_frame(": comment only").is_none());
    }
}
