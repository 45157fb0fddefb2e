use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::gateway::session::types::ControlMessage;

/// Wall-clock milliseconds, used as the heartbeat nonce so the echo alone
/// is enough to compute latency.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sends a heartbeat every `interval`. `awaiting_ack` is set on every send
/// and cleared by whoever sees the server's answer; if it is still set when
/// the next beat is due the server is gone, and the reason is reported on
/// `missed` before the task stops.
pub fn spawn_heartbeat(
    tx_hb: tokio::sync::mpsc::UnboundedSender<Message>,
    interval: Duration,
    awaiting_ack: Arc<AtomicBool>,
    missed: flume::Sender<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if awaiting_ack.swap(true, Ordering::AcqRel) {
                let _ = missed.send("server missed last heartbeat".into());
                break;
            }

            let hb = ControlMessage::Heartbeat { nonce: now_ms() }.into_raw();
            if let Ok(json) = serde_json::to_string(&hb) {
                if tx_hb.send(Message::Text(json.into())).is_err() {
                    break; // channel closed, session ending
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::types::{VoiceGatewayMessage, op};

    #[tokio::test(start_paused = true)]
    async fn sends_nonce_on_every_acked_tick() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (missed_tx, missed_rx) = flume::unbounded();
        let awaiting_ack = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(
            tx,
            Duration::from_millis(100),
            awaiting_ack.clone(),
            missed_tx,
            cancel.clone(),
        );

        for _ in 0..3 {
            let Some(Message::Text(text)) = rx.recv().await else {
                panic!("heartbeat channel closed");
            };
            let msg: VoiceGatewayMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(msg.op, op::HEARTBEAT);
            assert!(msg.d.as_u64().is_some());
            awaiting_ack.store(false, Ordering::Release);
        }

        cancel.cancel();
        handle.await.unwrap();
        assert!(missed_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_beat_is_reported_on_the_next_tick() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (missed_tx, missed_rx) = flume::unbounded();
        let handle = spawn_heartbeat(
            tx,
            Duration::from_millis(100),
            Arc::new(AtomicBool::new(false)),
            missed_tx,
            CancellationToken::new(),
        );

        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
        let reason = missed_rx.recv_async().await.unwrap();
        assert!(reason.contains("missed"));
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
