pub mod decoder;
pub mod sse;

pub use decoder::{Delta, StreamDecoder, ToolArgs};
pub use sse::{SseFrame, SseParser};

use futures_util::Stream;

/// Decode a raw SSE byte stream into application-level deltas.
///
/// Builds one [`SseParser`] and one [`StreamDecoder`] for the stream —
/// the per-connection decode state required by the concurrency model —
/// and drives them as bytes arrive. Transport errors end the stream;
/// decode errors are absorbed inside the decoder.
pub fn delta_stream<S, E>(byte_stream: S) -> impl Stream<Item = Delta> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    use futures_util::StreamExt;

    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            SseParser::new(),
            StreamDecoder::new(),
            std::collections::VecDeque::<Delta>::new(),
        ),
        |(mut stream, mut parser, mut decoder, mut pending)| async move {
            loop {
                if let Some(delta) = pending.pop_front() {
                    return Some((delta, (stream, parser, decoder, pending)));
                }

                match stream.as_mut().next().await? {
                    Ok(bytes) => {
                        for frame in parser.feed(&bytes) {
                            pending.extend(decoder.process(&frame));
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "stream read failed, ending delta stream");
                        return None;
                    }
                }
            }
        },
    )
}
