//! Framed request/response over an unreliable byte stream.
//!
//! [`CommandClient`] turns a [`Link`] into a bounded-wait request/response
//! primitive:
//!
//! 1. Discard any input already waiting (stale bytes from an earlier exchange
//!    that timed out)
//! 2. Write the command and a single `\n`
//! 3. Collect trimmed, non-empty lines until a terminal `OK:` / `Error:` line
//!    arrives or the per-call deadline passes
//!
//! A deadline expiry is a *soft* timeout: the lines received so far are
//! returned and [`Response::outcome`] reports them as indeterminate. No retries
//! happen here; retry policy belongs to the caller.

use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

use crate::config::ClientConfig;
use crate::error::CellSimResult;
use crate::protocol::{Command, Response, ResponseLine};
use crate::serial::{Link, LinkId, LinkOpener};

/// Command/response client owning exactly one open link.
///
/// `send_command` takes `&mut self`, so at most one command is ever in flight
/// on a client. [`CommandClient::close`] consumes the client together with its
/// link.
#[derive(Debug)]
pub struct CommandClient {
    link: Link,
    config: ClientConfig,
}

impl CommandClient {
    /// Build a client over an already opened link.
    pub fn new(link: Link, config: ClientConfig) -> Self {
        Self { link, config }
    }

    /// Open `id` through `opener` and build a client over it.
    ///
    /// # Errors
    ///
    /// `CellSimError::LinkUnavailable` if the link cannot be opened.
    pub async fn open(
        opener: &dyn LinkOpener,
        id: &LinkId,
        config: ClientConfig,
    ) -> CellSimResult<Self> {
        let link = opener.open(id).await?;
        Ok(Self::new(link, config))
    }

    /// Identifier of the underlying link.
    pub fn link_id(&self) -> &LinkId {
        self.link.id()
    }

    /// Send one command and collect its reply.
    ///
    /// Returns within the command's deadline (plus scheduling latency) no matter
    /// what the instrument does. Timeouts, garbled lines and `Error:` replies are
    /// all reported through the returned [`Response`].
    ///
    /// # Errors
    ///
    /// Only link I/O failures (the write fails, or a read reports an error).
    #[instrument(skip(self, command), fields(link = %self.link.id(), cmd = %command), err)]
    pub async fn send_command(&mut self, command: &Command) -> CellSimResult<Response> {
        let timeout = self.config.timeout_for(command);
        let poll_interval = self.config.poll_interval();

        self.link.discard_pending_input();
        self.link.write_line(command.as_str()).await?;

        let deadline = Instant::now() + timeout;
        let mut response = Response::new();

        loop {
            match tokio::time::timeout_at(deadline, self.link.read_line()).await {
                Ok(Ok(Some(raw))) => {
                    let text = raw.trim();
                    if text.is_empty() {
                        continue;
                    }
                    tracing::debug!("received {:?}", text);
                    if response.push(ResponseLine::classify(text)) {
                        return Ok(response);
                    }
                }
                Ok(Ok(None)) => {
                    // End of input: nothing will arrive until the stream recovers
                    if Instant::now() + poll_interval >= deadline {
                        tokio::time::sleep_until(deadline).await;
                    } else {
                        tokio::time::sleep(poll_interval).await;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        tracing::debug!(
            lines = response.len(),
            timeout_ms = timeout.as_millis() as u64,
            "no terminal line before deadline"
        );
        Ok(response)
    }

    /// Validate `text` as a [`Command`] and send it.
    ///
    /// # Errors
    ///
    /// `CellSimError::InvalidCommand` for empty or multi-line text, otherwise as
    /// [`CommandClient::send_command`].
    pub async fn send(&mut self, text: &str) -> CellSimResult<Response> {
        let command = Command::new(text)?;
        self.send_command(&command).await
    }

    /// Override the deadline for every command category.
    pub fn set_uniform_timeout(&mut self, timeout: Duration) {
        let poll_interval_ms = self.config.poll_interval_ms;
        self.config = ClientConfig {
            poll_interval_ms,
            ..ClientConfig::uniform(timeout)
        };
    }

    /// Close the link. The client cannot be used afterwards.
    pub async fn close(self) -> CellSimResult<()> {
        self.link.close().await?;
        Ok(())
    }
}
