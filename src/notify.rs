//! Write-notification channel
//!
//! Carries one [`WriteNotification`] per write the server applied to the
//! mapping, from the protocol context to the application context. The
//! channel holds a single in-flight item: publishing while the previous
//! notification is unconsumed waits instead of dropping, so every write is
//! delivered in the order it was applied.
//!
//! The channel has its own synchronisation and is never touched while the
//! mapping lock is held.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusAddress, ModbusFunction};

/// In-flight capacity of the channel
pub const NOTIFICATION_CAPACITY: usize = 1;

/// One write that just landed in the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteNotification {
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub count: u16,
}

/// Create a connected notifier/listener pair
pub fn write_channel() -> (WriteNotifier, WriteListener) {
    let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
    (WriteNotifier { tx }, WriteListener { rx })
}

/// Producer half, owned by the protocol context
#[derive(Debug, Clone)]
pub struct WriteNotifier {
    tx: mpsc::Sender<WriteNotification>,
}

impl WriteNotifier {
    /// Publish, waiting while the previous notification is unconsumed
    ///
    /// Call only after the corresponding mapping update has been committed
    /// and the lock released.
    pub async fn publish(&self, notification: WriteNotification) -> ModbusResult<()> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| ModbusError::internal("Write listener dropped"))
    }

    /// Same as [`WriteNotifier::publish`] for callers outside the runtime
    pub fn blocking_publish(&self, notification: WriteNotification) -> ModbusResult<()> {
        self.tx
            .blocking_send(notification)
            .map_err(|_| ModbusError::internal("Write listener dropped"))
    }

    /// Whether a notification is waiting to be consumed
    pub fn is_pending(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the application context
#[derive(Debug)]
pub struct WriteListener {
    rx: mpsc::Receiver<WriteNotification>,
}

impl WriteListener {
    /// Take the pending notification, if any, without waiting
    pub fn try_consume(&mut self) -> Option<WriteNotification> {
        match self.rx.try_recv() {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the next notification; `None` once every notifier is gone
    pub async fn consume(&mut self) -> Option<WriteNotification> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(address: u16) -> WriteNotification {
        WriteNotification {
            function: ModbusFunction::WriteSingleRegister,
            address,
            count: 1,
        }
    }

    #[tokio::test]
    async fn test_try_consume_empty() {
        let (_notifier, mut listener) = write_channel();
        assert_eq!(listener.try_consume(), None);
    }

    #[tokio::test]
    async fn test_publish_then_consume() {
        let (notifier, mut listener) = write_channel();
        notifier.publish(notification(4)).await.unwrap();
        assert!(notifier.is_pending());

        assert_eq!(listener.try_consume(), Some(notification(4)));
        assert!(!notifier.is_pending());
        assert_eq!(listener.try_consume(), None);
    }

    #[tokio::test]
    async fn test_second_publish_waits_for_consume() {
        let (notifier, mut listener) = write_channel();
        notifier.publish(notification(1)).await.unwrap();

        let mut second = tokio_test::task::spawn(notifier.publish(notification(2)));
        tokio_test::assert_pending!(second.poll());

        assert_eq!(listener.try_consume(), Some(notification(1)));
        assert!(second.is_woken());
        tokio_test::assert_ready_ok!(second.poll());
        assert_eq!(listener.try_consume(), Some(notification(2)));
    }

    #[tokio::test]
    async fn test_interleaved_order_is_preserved() {
        let (notifier, mut listener) = write_channel();
        let mut seen = Vec::new();
        for address in 0..50 {
            notifier.publish(notification(address)).await.unwrap();
            seen.push(listener.try_consume().unwrap().address);
        }
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_publish_fails_without_listener() {
        let (notifier, listener) = write_channel();
        drop(listener);
        assert!(notifier.is_closed());
        assert!(matches!(
            notifier.publish(notification(0)).await,
            Err(ModbusError::Internal { .. })
        ));
    }
}
