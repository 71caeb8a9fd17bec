//! FIFO channels used to move DKG messages, events and block notifications
//! between the engine's tasks.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::error::*;

#[cfg(feature = "channel_sync_crossbeam")]
mod crossbeam;

#[cfg(any(feature = "channel_sync_flume", feature = "channel_mixed_flume"))]
mod flume_mpmc;

/**
Sync channels
 */
pub struct ChannelSyncRx<T> {
    name: Option<Arc<str>>,
    #[cfg(feature = "channel_sync_crossbeam")]
    inner: crossbeam::ChannelSyncRx<T>,
    #[cfg(feature = "channel_sync_flume")]
    inner: flume_mpmc::ChannelMixedRx<T>,
}

pub struct ChannelSyncTx<T> {
    channel_identifier: Option<Arc<str>>,
    #[cfg(feature = "channel_sync_crossbeam")]
    inner: crossbeam::ChannelSyncTx<T>,
    #[cfg(feature = "channel_sync_flume")]
    inner: flume_mpmc::ChannelMixedTx<T>,
}

impl<T> ChannelSyncRx<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn try_recv(&self) -> std::result::Result<T, TryRecvError> {
        self.inner.try_recv()
    }

    #[inline]
    pub fn recv(&self) -> Result<T> {
        #[cfg(feature = "channel_sync_crossbeam")]
        {
            self.inner.recv()
        }
        #[cfg(feature = "channel_sync_flume")]
        {
            self.inner.recv_sync()
        }
    }

    #[inline]
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<T, TryRecvError> {
        self.inner.recv_timeout(timeout)
    }
}

impl<T> ChannelSyncTx<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn send(&self, value: T) -> Result<()> {
        self.send_return(value)
            .map_err(SendError::from)
            .map_err(anyhow::Error::from)
    }

    /// Attempts a non-blocking send first; if the channel is full the send
    /// falls back to blocking, so callers that must never block should use
    /// [`Self::try_send_return`] and handle the `Full` case themselves.
    #[inline]
    pub fn send_return(&self, value: T) -> std::result::Result<(), SendReturnError<T>> {
        let value = match self.try_send_return(value) {
            Ok(_) => {
                return Ok(());
            }
            Err(err) => match err {
                TrySendReturnError::Full(value) => {
                    error!(
                        "Channel {:?} is full, blocking on the send",
                        self.channel_identifier
                    );

                    value
                }
                TrySendReturnError::Disconnected(value) => {
                    error!("Channel {:?} is disconnected", self.channel_identifier);

                    value
                }
                TrySendReturnError::Timeout(value) => value,
            },
        };

        #[cfg(feature = "channel_sync_crossbeam")]
        {
            self.inner.send(value)
        }
        #[cfg(feature = "channel_sync_flume")]
        {
            self.inner.send_sync(value)
        }
    }

    #[inline]
    pub fn try_send(&self, value: T) -> Result<()> {
        self.try_send_return(value)
            .map_err(TrySendError::from)
            .map_err(anyhow::Error::from)
    }

    #[inline]
    pub fn try_send_return(&self, value: T) -> std::result::Result<(), TrySendReturnError<T>> {
        self.inner.try_send(value)
    }
}

impl<T> Clone for ChannelSyncTx<T> {
    fn clone(&self) -> Self {
        ChannelSyncTx {
            channel_identifier: self.channel_identifier.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for ChannelSyncRx<T> {
    fn clone(&self) -> Self {
        ChannelSyncRx {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

#[inline]
pub fn new_bounded_sync<T>(bound: usize, name: Option<&str>) -> (ChannelSyncTx<T>, ChannelSyncRx<T>) {
    let name: Option<Arc<str>> = name.map(Arc::from);

    #[cfg(feature = "channel_sync_crossbeam")]
    let (tx, rx) = crossbeam::new_bounded(bound);

    #[cfg(feature = "channel_sync_flume")]
    let (tx, rx) = flume_mpmc::new_bounded(bound);

    (
        ChannelSyncTx {
            channel_identifier: name.clone(),
            inner: tx,
        },
        ChannelSyncRx { name, inner: rx },
    )
}

#[inline]
pub fn new_unbounded_sync<T>(name: Option<&str>) -> (ChannelSyncTx<T>, ChannelSyncRx<T>) {
    let name: Option<Arc<str>> = name.map(Arc::from);

    #[cfg(feature = "channel_sync_crossbeam")]
    let (tx, rx) = crossbeam::new_unbounded();

    #[cfg(feature = "channel_sync_flume")]
    let (tx, rx) = flume_mpmc::new_unbounded();

    (
        ChannelSyncTx {
            channel_identifier: name.clone(),
            inner: tx,
        },
        ChannelSyncRx { name, inner: rx },
    )
}

/**
Mixed channels, connecting the sync engine core with async transport workers
 */
pub struct ChannelMixedRx<T> {
    #[cfg(feature = "channel_mixed_flume")]
    inner: flume_mpmc::ChannelMixedRx<T>,
}

pub struct ChannelMixedTx<T> {
    #[cfg(feature = "channel_mixed_flume")]
    inner: flume_mpmc::ChannelMixedTx<T>,
}

impl<T> ChannelMixedRx<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn recv(&self) -> Result<T> {
        self.inner.recv_sync()
    }

    #[inline]
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<T, TryRecvError> {
        self.inner.recv_timeout(timeout)
    }

    #[inline]
    pub async fn recv_async(&mut self) -> Result<T> {
        self.inner.recv().await
    }

    #[inline]
    pub fn try_recv(&self) -> std::result::Result<T, TryRecvError> {
        self.inner.try_recv()
    }
}

impl<T> ChannelMixedTx<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub async fn send_async(&self, value: T) -> Result<()> {
        self.send_async_return(value)
            .await
            .map_err(SendError::from)
            .map_err(anyhow::Error::from)
    }

    #[inline]
    pub async fn send_async_return(&self, value: T) -> std::result::Result<(), SendReturnError<T>> {
        self.inner.send(value).await
    }

    #[inline]
    pub fn send(&self, value: T) -> Result<()> {
        self.send_return(value)
            .map_err(SendError::from)
            .map_err(anyhow::Error::from)
    }

    #[inline]
    pub fn send_return(&self, value: T) -> std::result::Result<(), SendReturnError<T>> {
        self.inner.send_sync(value)
    }

    #[inline]
    pub fn try_send_return(&self, value: T) -> std::result::Result<(), TrySendReturnError<T>> {
        self.inner.try_send(value)
    }

    #[inline]
    pub fn send_timeout(
        &self,
        value: T,
        timeout: Duration,
    ) -> std::result::Result<(), TrySendReturnError<T>> {
        self.inner.send_timeout_sync(value, timeout)
    }
}

impl<T> Clone for ChannelMixedTx<T> {
    fn clone(&self) -> Self {
        ChannelMixedTx {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for ChannelMixedRx<T> {
    fn clone(&self) -> Self {
        ChannelMixedRx {
            inner: self.inner.clone(),
        }
    }
}

pub fn new_bounded_mixed<T>(bound: usize) -> (ChannelMixedTx<T>, ChannelMixedRx<T>) {
    let (tx, rx) = {
        #[cfg(feature = "channel_mixed_flume")]
        {
            flume_mpmc::new_bounded(bound)
        }
    };

    (ChannelMixedTx { inner: tx }, ChannelMixedRx { inner: rx })
}

/**
Errors
 **/
#[derive(Error, Debug)]
pub enum TryRecvError {
    #[error("Channel has disconnected")]
    ChannelDc,
    #[error("Channel is empty")]
    ChannelEmpty,
    #[error("Receive operation timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum RecvError {
    #[error("Channel has disconnected")]
    ChannelDc,
}

#[derive(Error)]
pub enum TrySendReturnError<T> {
    #[error("Channel has disconnected")]
    Disconnected(T),
    #[error("Send operation has timed out")]
    Timeout(T),
    #[error("Channel is full")]
    Full(T),
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Failed to send message")]
    FailedToSend,
}

#[derive(Error, Debug)]
pub enum TrySendError {
    #[error("Channel has disconnected")]
    Disconnected,
    #[error("Send operation has timed out")]
    Timeout,
    #[error("Channel is full")]
    Full,
}

#[derive(Error)]
pub enum SendReturnError<T> {
    #[error("Failed to send message, channel disconnected")]
    FailedToSend(T),
}

impl<T> Debug for SendReturnError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to send message")
    }
}

impl<T> Debug for TrySendReturnError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to send message")
    }
}

impl<T> From<SendReturnError<T>> for SendError {
    fn from(value: SendReturnError<T>) -> Self {
        match value {
            SendReturnError::FailedToSend(_) => SendError::FailedToSend,
        }
    }
}

impl<T> From<TrySendReturnError<T>> for TrySendError {
    fn from(value: TrySendReturnError<T>) -> Self {
        match value {
            TrySendReturnError::Disconnected(_) => TrySendError::Disconnected,
            TrySendReturnError::Timeout(_) => TrySendError::Timeout,
            TrySendReturnError::Full(_) => TrySendError::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_sync_channel_rejects_past_capacity() {
        let (tx, rx) = new_bounded_sync(2, Some("test-bounded"));

        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();

        match tx.try_send_return(3) {
            Err(TrySendReturnError::Full(3)) => {}
            other => panic!("expected full channel, got {:?}", other),
        }

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn mixed_channel_bridges_sync_sends() {
        let (tx, rx) = new_bounded_mixed(4);

        tx.send(7).unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
    }
}
