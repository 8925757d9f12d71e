//! Host effects emitted as JSON lines.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::HostEffectSink;

/// One host action, as written by [`JsonLinesEffectSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum HostEffect<'a> {
    /// A short on-screen message.
    Toast {
        /// Requesting tenant alias.
        #[serde(rename = "botId")]
        alias: &'a str,
        /// Message text.
        message: &'a str,
    },
    /// A vibration request.
    Vibrate {
        /// Requesting tenant alias.
        #[serde(rename = "botId")]
        alias: &'a str,
        /// Duration in milliseconds.
        duration: u64,
    },
    /// A notification.
    Notification {
        /// Requesting tenant alias.
        #[serde(rename = "botId")]
        alias: &'a str,
        /// Notification title.
        title: &'a str,
        /// Notification body.
        body: &'a str,
    },
    /// A chat reply.
    Reply {
        /// Requesting tenant alias.
        #[serde(rename = "botId")]
        alias: &'a str,
        /// Target room.
        room: &'a str,
        /// Reply text.
        message: &'a str,
    },
}

/// [`HostEffectSink`] that serialises effects to a writer, one per line.
#[derive(Debug)]
pub struct JsonLinesEffectSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesEffectSink<W> {
    /// Wrap `writer`.
    #[must_use]
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Return the writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, effect: &HostEffect<'_>) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let result = serde_json::to_writer(&mut *writer, effect)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(error) = result {
            tracing::warn!(error = %error, ?effect, "failed to emit host effect");
        }
    }
}

impl<W: Write + Send> HostEffectSink for JsonLinesEffectSink<W> {
    fn toast(&self, alias: &str, message: &str) {
        self.emit(&HostEffect::Toast { alias, message });
    }

    fn vibrate(&self, alias: &str, duration_ms: u64) {
        self.emit(&HostEffect::Vibrate {
            alias,
            duration: duration_ms,
        });
    }

    fn notification(&self, alias: &str, title: &str, body: &str) {
        self.emit(&HostEffect::Notification { alias, title, body });
    }

    fn reply(&self, alias: &str, room: &str, message: &str) {
        self.emit(&HostEffect::Reply {
            alias,
            room,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn effects_are_written_one_per_line() {
        let sink = JsonLinesEffectSink::new(Vec::new());
        sink.toast("echo", "hi");
        sink.vibrate("echo", 200);
        sink.notification("echo", "Title", "Body");
        sink.reply("echo", "room-1", "pong");

        let written = String::from_utf8(sink.into_inner()).unwrap_or_default();
        assert_eq!(
            written.lines().collect::<Vec<_>>(),
            vec![
                r#"{"effect":"toast","botId":"echo","message":"hi"}"#,
                r#"{"effect":"vibrate","botId":"echo","duration":200}"#,
                r#"{"effect":"notification","botId":"echo","title":"Title","body":"Body"}"#,
                r#"{"effect":"reply","botId":"echo","room":"room-1","message":"pong"}"#,
            ]
        );
    }
}
