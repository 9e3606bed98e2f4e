use crate::error::{GatewayError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

/// One decoded server-sent event. `event` defaults to `message` when
/// the frame carries only data lines.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Decode an SSE byte stream into events, lazily: nothing is pulled
/// from the wire until the consumer asks for the next event.
pub(crate) fn decode_sse<S>(
    bytes_stream: S,
    provider: &'static str,
) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        move |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + 2..].to_string();

                    let mut event = String::new();
                    let mut data_lines = Vec::new();

                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("event:") {
                            event = rest.trim_start().to_string();
                            continue;
                        }
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }

                    let data = data_lines.join("\n");
                    if event.is_empty() && data.is_empty() {
                        continue;
                    }
                    if event.is_empty() {
                        event = "message".to_string();
                    }
                    return Some((Ok(SseEvent { event, data }), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(GatewayError::from_transport(provider, e)),
                            (stream, buffer),
                        ));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_stream(
        frames: Vec<&'static str>,
    ) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin {
        futures_util::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok(Bytes::from_static(f.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn decodes_named_events_and_defaults_to_message() {
        let input = bytes_stream(vec![
            "event: content_block_delta\ndata: {\"a\":1}\n\n",
            "data: [DONE]\n\n",
        ]);
        let mut events = Box::pin(decode_sse(input, "test"));

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.event, "content_block_delta");
        assert_eq!(first.data, "{\"a\":1}");

        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.event, "message");
        assert_eq!(second.data, "[DONE]");

        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn reassembles_events_split_across_chunks() {
        let input = bytes_stream(vec!["data: hel", "lo\n", "\ndata: world\n\n"]);
        let mut events = Box::pin(decode_sse(input, "test"));

        assert_eq!(events.next().await.unwrap().unwrap().data, "hello");
        assert_eq!(events.next().await.unwrap().unwrap().data, "world");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn joins_multi_line_data_frames() {
        let input = bytes_stream(vec!["data: one\ndata: two\n\n"]);
        let mut events = Box::pin(decode_sse(input, "test"));
        assert_eq!(events.next().await.unwrap().unwrap().data, "one\ntwo");
    }

    #[tokio::test]
    async fn comment_only_frames_are_skipped() {
        let input = bytes_stream(vec![": keep-alive\n\n", "data: x\n\n"]);
        let mut events = Box::pin(decode_sse(input, "test"));
        assert_eq!(events.next().await.unwrap().unwrap().data, "x");
        assert!(events.next().await.is_none());
    }
}
