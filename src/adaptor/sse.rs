//! Server-sent event framing for upstream streams.
//!
//! Frames are split on blank lines as bytes arrive; nothing is decoded until
//! a whole frame is buffered, so multi-byte characters never straddle a
//! boundary.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{RelayError, UnavailableReason};

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Non-standard fields some providers add (e.g. `meta:`).
    pub extra: Vec<(String, String)>,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty() && self.extra.is_empty()
    }
}

/// Decode an upstream byte stream into SSE frames.
pub fn frames<S, E>(inner: S) -> impl Stream<Item = Result<SseFrame, RelayError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(inner), Vec::<u8>::new(), false),
        |(mut stream, mut buf, mut ended)| async move {
            loop {
                if let Some((frame_end, sep_len)) = find_frame_end(&buf) {
                    let raw: Vec<u8> = buf.drain(..frame_end + sep_len).collect();
                    let frame = parse_frame(&raw[..frame_end]);
                    if frame.is_empty() {
                        continue;
                    }
                    return Some((Ok(frame), (stream, buf, ended)));
                }
                if ended {
                    // Flush a trailing frame that was not blank-line terminated.
                    if buf.iter().all(|b| b.is_ascii_whitespace()) {
                        return None;
                    }
                    let raw = std::mem::take(&mut buf);
                    let frame = parse_frame(&raw);
                    if frame.is_empty() {
                        return None;
                    }
                    return Some((Ok(frame), (stream, buf, ended)));
                }
                match stream.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        ended = true;
                        buf.clear();
                        return Some((
                            Err(RelayError::unavailable(
                                UnavailableReason::Network,
                                format!("upstream stream broke: {}", e),
                            )),
                            (stream, buf, ended),
                        ));
                    }
                    None => ended = true,
                }
            }
        },
    )
}

/// Position of the first blank-line separator and its length.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Some((i, 2));
            }
            if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

fn parse_frame(raw: &[u8]) -> SseFrame {
    let text = String::from_utf8_lossy(raw);
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => frame.event = Some(value.to_string()),
            "id" | "retry" => {}
            other => frame.extra.push((other.to_string(), value.to_string())),
        }
    }
    frame.data = data_lines.join("\n");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn splits_frames_across_chunk_boundaries() {
        let stream = frames(chunked(&[
            "event: message_start\nda",
            "ta: {\"a\":1}\n\n: keep-alive\n\ndata: [DO",
            "NE]\n\n",
        ]));
        let got: Vec<_> = stream.collect().await;
        assert_eq!(got.len(), 2);
        let first = got[0].as_ref().unwrap();
        assert_eq!(first.event.as_deref(), Some("message_start"));
        assert_eq!(first.data, "{\"a\":1}");
        assert!(got[1].as_ref().unwrap().is_done());
    }

    #[tokio::test]
    async fn handles_crlf_and_multiline_data() {
        let stream = frames(chunked(&["data: line1\r\ndata: line2\r\n\r\nevent: finish\nmeta: {\"x\":1}\ndata:"]));
        let got: Vec<_> = stream.collect().await;
        assert_eq!(got[0].as_ref().unwrap().data, "line1\nline2");
        let last = got[1].as_ref().unwrap();
        assert_eq!(last.event.as_deref(), Some("finish"));
        assert_eq!(last.field("meta"), Some("{\"x\":1}"));
    }

    #[tokio::test]
    async fn transport_errors_end_the_stream() {
        let inner = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"data: 2\n\n")),
        ]);
        let got: Vec<_> = frames(inner).collect().await;
        assert_eq!(got.len(), 2);
        assert!(got[1].as_ref().unwrap_err().is_failover_eligible());
    }
}
