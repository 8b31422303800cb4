use std::sync::Arc;

use nexus_store::LogRecord;
use tokio::sync::mpsc;

use crate::LogConsumer;

/// Event delivered to a [`ChannelConsumer`] receiver.
#[derive(Debug, Clone)]
pub enum LogEvent {
  Record(LogRecord),
  Done,
}

/// Consumer that forwards broker callbacks into an unbounded channel.
pub struct ChannelConsumer {
  tx: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelConsumer {
  /// A consumer and the receiver its events arrive on.
  pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<LogEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Self { tx }), rx)
  }
}

impl LogConsumer for ChannelConsumer {
  fn message(&self, record: &LogRecord) {
    let _ = self.tx.send(LogEvent::Record(record.clone()));
  }

  fn done(&self) {
    let _ = self.tx.send(LogEvent::Done);
  }
}
