//! Stream relay: engine output to the live channel and the run's buffers.
//!
//! Known noise lines are filtered out of what the observer sees, but the
//! accumulated buffers always keep the engine's original output.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use super::channel::{LiveChannel, StreamEvent};
use super::options::OutputFormat;

/// Printed by newer ElastAlert versions before every test run.
static RULES_LOADED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+ rules loaded\n").expect("static regex"));

const NO_RESULTS: &str = "Didn't get any results.\n";

const SCHEDULER_NOISE: &str = "INFO:apscheduler.scheduler:Adding job tentatively";

/// Strip the first rules-loaded line and the first no-results line.
pub fn clean_stdout(chunk: &str) -> Cow<'_, str> {
    let cleaned = RULES_LOADED.replace(chunk, "");
    if cleaned.contains(NO_RESULTS) {
        Cow::Owned(cleaned.replacen(NO_RESULTS, "", 1))
    } else {
        cleaned
    }
}

/// Scheduler start-up chatter that observers never need to see.
pub fn is_stderr_noise(chunk: &str) -> bool {
    chunk.starts_with(SCHEDULER_NOISE)
}

/// Decodes a byte stream into text without splitting UTF-8 sequences that
/// straddle chunk boundaries.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Invalid bytes: replace them and keep going.
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete trailing sequence: hold it back for the next chunk.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[derive(Debug)]
pub struct StreamRelay {
    channel: Option<LiveChannel>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    stdout_decoder: Utf8Decoder,
    stderr_decoder: Utf8Decoder,
}

impl StreamRelay {
    pub fn new(channel: Option<LiveChannel>) -> Self {
        Self {
            channel,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_decoder: Utf8Decoder::default(),
            stderr_decoder: Utf8Decoder::default(),
        }
    }

    pub fn on_stdout(&mut self, bytes: &[u8]) {
        if let Some(text) = self.stdout_decoder.push(bytes) {
            self.accept_stdout(text);
        }
    }

    pub fn on_stderr(&mut self, bytes: &[u8]) {
        if let Some(text) = self.stderr_decoder.push(bytes) {
            self.accept_stderr(text);
        }
    }

    /// Flush any bytes held back by the decoders. Call once the process exited.
    pub fn finish(&mut self) {
        if let Some(text) = self.stdout_decoder.finish() {
            self.accept_stdout(text);
        }
        if let Some(text) = self.stderr_decoder.finish() {
            self.accept_stderr(text);
        }
    }

    fn accept_stdout(&mut self, text: String) {
        if let Some(channel) = self.open_channel() {
            channel.send(&StreamEvent::Result(clean_stdout(&text).into_owned()));
        }
        self.stdout.push(text);
    }

    fn accept_stderr(&mut self, text: String) {
        if let Some(channel) = self.open_channel() {
            if !is_stderr_noise(&text) {
                channel.send(&StreamEvent::Progress(text.clone()));
            }
        }
        self.stderr.push(text);
    }

    fn open_channel(&self) -> Option<&LiveChannel> {
        self.channel.as_ref().filter(|c| c.is_open())
    }

    pub fn stdout_chunks(&self) -> &[String] {
        &self.stdout
    }

    pub fn stderr_chunks(&self) -> &[String] {
        &self.stderr
    }

    /// The success value: raw concatenation for JSON output, newline-joined
    /// chunks for plain output.
    pub fn transcript(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Json => self.stdout.concat(),
            OutputFormat::Plain => self.stdout.join("\n"),
        }
    }

    /// The failure value: newline-joined stderr chunks.
    pub fn error_text(&self) -> String {
        self.stderr.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_stdout_strips_noise() {
        assert_eq!(clean_stdout("3 rules loaded\nhits: 4\n"), "hits: 4\n");
        assert_eq!(clean_stdout("12 rules loaded\nok\n"), "ok\n");
        assert_eq!(
            clean_stdout("Didn't get any results.\n1 rules loaded\n"),
            ""
        );
        assert_eq!(clean_stdout("nothing to strip\n"), "nothing to strip\n");
    }

    #[test]
    fn test_clean_stdout_only_first_occurrence() {
        assert_eq!(
            clean_stdout("1 rules loaded\n2 rules loaded\n"),
            "2 rules loaded\n"
        );
    }

    #[test]
    fn test_stderr_noise() {
        assert!(is_stderr_noise(
            "INFO:apscheduler.scheduler:Adding job tentatively -- it will be properly scheduled when the scheduler starts\n"
        ));
        assert!(!is_stderr_noise("INFO:elastalert:Queried rule r1 from 2024-01-01"));
        assert!(!is_stderr_noise(
            "WARNING: x\nINFO:apscheduler.scheduler:Adding job tentatively"
        ));
    }

    #[tokio::test]
    async fn test_relay_filters_but_buffer_keeps_original() {
        let (channel, mut rx) = LiveChannel::new();
        let mut relay = StreamRelay::new(Some(channel));

        relay.on_stdout(b"3 rules loaded\nmatches: 2\n");
        relay.on_stderr(b"INFO:apscheduler.scheduler:Adding job tentatively\n");
        relay.on_stderr(b"INFO:elastalert:Queried rule\n");

        assert_eq!(
            rx.recv().await.unwrap(),
            r#"{"event":"result","data":"matches: 2\n"}"#
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"{"event":"progress","data":"INFO:elastalert:Queried rule\n"}"#
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(relay.stdout_chunks(), &["3 rules loaded\nmatches: 2\n"]);
        assert_eq!(relay.stderr_chunks().len(), 2);
    }

    #[tokio::test]
    async fn test_relay_without_channel_only_accumulates() {
        let mut relay = StreamRelay::new(None);
        relay.on_stdout(b"a\n");
        relay.on_stdout(b"b\n");
        relay.on_stderr(b"e1");
        relay.on_stderr(b"e2");

        assert_eq!(relay.transcript(OutputFormat::Plain), "a\n\nb\n");
        assert_eq!(relay.transcript(OutputFormat::Json), "a\nb\n");
        assert_eq!(relay.error_text(), "e1\ne2");
    }

    #[tokio::test]
    async fn test_relay_stops_sending_after_close() {
        let (channel, mut rx) = LiveChannel::new();
        let mut relay = StreamRelay::new(Some(channel.clone()));

        relay.on_stdout(b"first\n");
        channel.close();
        relay.on_stdout(b"second\n");

        assert!(rx.recv().await.unwrap().contains("first"));
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.stdout_chunks(), &["first\n", "second\n"]);
    }

    #[test]
    fn test_split_utf8_sequence_is_reassembled() {
        let mut relay = StreamRelay::new(None);
        let text = "größe\n".as_bytes();
        // Split inside the two-byte 'ö'.
        relay.on_stdout(&text[..3]);
        relay.on_stdout(&text[3..]);
        relay.finish();

        assert_eq!(relay.stdout_chunks().concat(), "größe\n");
        assert!(relay.stdout_chunks().iter().all(|c| !c.contains('\u{FFFD}')));
    }

    #[test]
    fn test_invalid_byte_does_not_split_following_sequence() {
        let mut relay = StreamRelay::new(None);
        relay.on_stdout(&[0xFF, 0xC3]);
        relay.on_stdout(&[0xB6, b'\n']);
        relay.finish();

        assert_eq!(relay.stdout_chunks(), &["\u{FFFD}", "ö\n"]);
    }

    #[test]
    fn test_invalid_bytes_mid_chunk_are_replaced() {
        let mut relay = StreamRelay::new(None);
        relay.on_stdout(&[b'a', 0xFF, b'b', 0xFE, b'c']);

        assert_eq!(relay.stdout_chunks(), &["a\u{FFFD}b\u{FFFD}c"]);
    }

    #[test]
    fn test_truncated_utf8_is_flushed_lossily() {
        let mut relay = StreamRelay::new(None);
        relay.on_stdout(&[b'o', b'k', 0xC3]);
        relay.finish();

        assert_eq!(relay.stdout_chunks(), &["ok", "\u{FFFD}"]);
    }
}
