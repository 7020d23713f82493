//! Per-connection control loop.
//!
//! A connection is registered before history is read, so nothing published in between is
//! lost. The writer then skips queued broadcasts already covered by the replay, which keeps
//! history strictly ahead of live traffic without any duplicates.

use axum::extract::ws::{Message as Frame, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{auth::Identity, AppState};

use super::{ChatError, Connection, ErrorFrame, Outbound, Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

impl SessionState {
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!((self, next), (Connecting, Active) | (Connecting, Closed) | (Active, Closed))
    }

    /// Moves to `next` if allowed. `Closed` is terminal.
    pub fn advance(self, next: SessionState) -> SessionState {
        if !self.can_advance(next) {
            debug!(from = ?self, to = ?next, "ignored session transition");
            return self;
        }

        debug!(from = ?self, to = ?next, "session transition");
        next
    }
}

struct Session {
    state: SessionState,
    connection: Connection,
    identity: Option<Identity>,
    app: AppState,
}

pub(crate) async fn run(socket: WebSocket, identity: Option<Identity>, app: AppState) {
    let (connection, outbox) = Connection::new(app.config.outbound_queue);
    let span = info_span!(
        "session",
        conn = %connection.id(),
        user = identity.as_ref().map_or("guest", |identity| identity.name.as_str())
    );

    let session = Session {
        state: SessionState::Connecting,
        connection,
        identity,
        app,
    };
    session.serve(socket, outbox).instrument(span).await
}

impl Session {
    async fn serve(mut self, socket: WebSocket, outbox: mpsc::Receiver<Outbound>) {
        let (mut sink, mut stream) = socket.split();

        self.app.registry.register(self.connection.clone());
        info!("connected");

        let replayed_through = match self.replay(&mut sink).await {
            Ok(last_id) => last_id,
            Err(e) => {
                debug!(error = %e, "replay failed");
                self.close();
                return;
            }
        };
        self.state = self.state.advance(SessionState::Active);

        let mut writer = tokio::spawn(write_loop(sink, outbox, replayed_through).in_current_span());

        tokio::select! {
            _ = self.read_loop(&mut stream) => {}
            _ = &mut writer => {}
            _ = self.connection.evicted() => warn!("evicted by broadcaster"),
        }

        writer.abort();
        self.close();
    }

    /// Sends recent history to this connection only. Returns the last replayed id.
    async fn replay(&self, sink: &mut SplitSink<WebSocket, Frame>) -> Result<i64, axum::Error> {
        let history = match self.app.store.recent(self.app.config.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "history unavailable");
                let frame = ErrorFrame::from(&ChatError::from(e));
                send_json(sink, &frame).await?;
                return Ok(0);
            }
        };

        for message in &history {
            send_json(sink, message).await?;
        }
        debug!(replayed = history.len(), "history replayed");

        Ok(history.last().map_or(0, |message| message.id))
    }

    async fn read_loop(&self, stream: &mut SplitStream<WebSocket>) {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    return;
                }
            };

            let submission = match frame {
                Frame::Text(text) => serde_json::from_str::<Submission>(text.as_str()),
                Frame::Binary(bytes) => serde_json::from_slice::<Submission>(&bytes),
                Frame::Close(_) => return,
                Frame::Ping(_) | Frame::Pong(_) => continue,
            };

            match submission {
                Ok(submission) => self.submit(submission).await,
                Err(e) => self.reply(ErrorFrame::malformed(e)).await,
            }
        }
    }

    async fn submit(&self, submission: Submission) {
        let submission = submission.attribute(self.identity.as_ref());
        let broadcaster = self.app.broadcaster.clone();

        // own task, so a disconnect mid-publish cannot cancel the append
        let published = tokio::spawn(async move { broadcaster.publish(submission).await }.in_current_span()).await;

        match published {
            Ok(Ok(message)) => debug!(id = message.id, "submitted"),
            Ok(Err(e)) => {
                debug!(error = %e, "submission rejected");
                self.reply(ErrorFrame::from(&e)).await;
            }
            Err(e) => warn!(error = %e, "publish task failed"),
        }
    }

    async fn reply(&self, frame: ErrorFrame) {
        if self.connection.reply(Outbound::Error(frame)).await.is_err() {
            debug!("reply dropped, connection closed");
        }
    }

    fn close(&mut self) {
        self.app.registry.deregister(self.connection.id());
        self.state = self.state.advance(SessionState::Closed);
        info!("disconnected");
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Frame>, mut outbox: mpsc::Receiver<Outbound>, replayed_through: i64) {
    while let Some(item) = outbox.recv().await {
        if let Outbound::Message(message) = &item
            && message.id <= replayed_through
        {
            continue;
        }

        let text = match item.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound item");
                continue;
            }
        };

        if let Err(e) = sink.send(Frame::Text(text.into())).await {
            debug!(error = %e, "write failed");
            return;
        }
    }
}

async fn send_json<T: serde::Serialize>(sink: &mut SplitSink<WebSocket, Frame>, item: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(item).map_err(axum::Error::new)?;
    sink.send(Frame::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn sessions_only_move_forward() {
        assert!(Connecting.can_advance(Active));
        assert!(Connecting.can_advance(Closed));
        assert!(Active.can_advance(Closed));

        assert!(!Active.can_advance(Connecting));
        assert!(!Closed.can_advance(Active));
        assert!(!Closed.can_advance(Connecting));
    }

    #[test]
    fn closed_is_terminal() {
        assert_eq!(Closed.advance(Active), Closed);
        assert_eq!(Connecting.advance(Closed).advance(Active), Closed);
        assert_eq!(Connecting.advance(Active).advance(Closed), Closed);
    }
}
