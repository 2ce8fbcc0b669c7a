use log::debug;
use serde::Deserialize;
use serde_json::Value;

/// Undecoded notification from a backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStreamEvent {
    Put { path: String, data: Value },
    Patch { path: String, data: Value },
    KeepAlive,
    /// The transport gave up on the channel; the caller has to re-subscribe.
    Closed { reason: String },
}

#[derive(Debug, Deserialize)]
struct ChangeBody {
    path: String,
    data: Value,
}

/// Line-oriented decoder for the backend's server-sent-event stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its line terminator). A blank line dispatches
    /// the buffered event.
    pub fn push_line(&mut self, line: &str) -> Option<RawStreamEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawStreamEvent> {
        let event = self.event.take()?;
        let data = std::mem::take(&mut self.data);

        match event.as_str() {
            "put" | "patch" => {
                let body = match serde_json::from_str::<ChangeBody>(&data) {
                    Ok(body) => body,
                    Err(err) => {
                        debug!("dropping malformed `{event}` stream payload: {err}");
                        return None;
                    }
                };
                if event == "put" {
                    Some(RawStreamEvent::Put {
                        path: body.path,
                        data: body.data,
                    })
                } else {
                    Some(RawStreamEvent::Patch {
                        path: body.path,
                        data: body.data,
                    })
                }
            }
            "keep-alive" => Some(RawStreamEvent::KeepAlive),
            "cancel" | "auth_revoked" => Some(RawStreamEvent::Closed { reason: event }),
            other => {
                debug!("ignoring stream event `{other}`");
                None
            }
        }
    }
}
