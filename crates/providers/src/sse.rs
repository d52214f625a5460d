//! Shared SSE plumbing for the provider adapters.
//!
//! Both wire formats used here (Anthropic events, OpenAI chat chunks) arrive
//! as `text/event-stream` bodies. The adapter hands this module the raw
//! `reqwest::Response` plus a parser closure for its `data:` payloads; the
//! module handles chunk buffering, event delimiting, end-of-body flushing,
//! and a fallback `Done` when the provider never sent one.

use rv_domain::error::Result;
use rv_domain::stream::{BoxStream, StreamEvent};

use crate::util::from_reqwest;

/// Pull complete `data:` payloads out of an SSE buffer.
///
/// Events are delimited by a blank line. `event:`, `id:`, and `retry:` lines
/// are ignored. Consumed bytes are drained in place; a trailing partial event
/// stays buffered for the next chunk.
pub(crate) fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_owned());
                }
            }
        }
    }

    payloads
}

/// Build a [`BoxStream`] of [`StreamEvent`]s from an SSE response.
///
/// `parse` is `FnMut` because Anthropic's parser carries tool-call assembly
/// state across payloads. The stream flushes the residual buffer when the
/// body closes and guarantees exactly one trailing `Done`.
pub(crate) fn event_stream<F>(
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_payloads(&mut buffer) {
                        for event in parse(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_payloads(&mut buffer) {
                            for event in parse(&data) {
                                if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_single_event() {
        let mut buf = String::from("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_stays_buffered() {
        let mut buf = String::from("data: whole\n\ndata: par");
        assert_eq!(drain_data_payloads(&mut buf), vec!["whole"]);
        assert_eq!(buf, "data: par");

        buf.push_str("tial\n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["partial"]);
    }

    #[test]
    fn ignores_non_data_lines_and_blanks() {
        let mut buf = String::from("event: ping\nid: 7\nretry: 100\ndata: x\n\ndata: \n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["x"]);
    }

    #[test]
    fn done_sentinel_passes_through_verbatim() {
        let mut buf = String::from("data: [DONE]\n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["[DONE]"]);
    }
}
