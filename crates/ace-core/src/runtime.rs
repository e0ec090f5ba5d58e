//! Tokio driver
//!
//! [`spawn`] moves a device into its own task. The task sleeps until the next
//! timer deadline or host request, whichever comes first, so the device is
//! only ever touched from one place. Hosts talk to it through a cloneable
//! [`AceHandle`].

use std::future;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::device::status::DeviceStatus;
use crate::device::{AceDevice, HostCallback};
use crate::error::AceError;
use crate::protocol::{Reply, RequestId, Response};
use crate::scheduler::{Scheduler, TimerQueue, TokioClock};

/// Scheduler used by devices running under tokio
pub type TokioTimers = TimerQueue<TokioClock>;

type Job<S> = Box<dyn FnOnce(&mut AceDevice<S>) + Send>;

enum HostRequest<S: Scheduler> {
    Run(Job<S>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a spawned device
pub struct AceHandle<S: Scheduler = TokioTimers> {
    tx: mpsc::UnboundedSender<HostRequest<S>>,
}

impl<S: Scheduler> Clone for AceHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Start the device loop in a new task
pub fn spawn<S: Scheduler + 'static>(device: AceDevice<S>) -> (AceHandle<S>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(device, rx));
    (AceHandle { tx }, task)
}

async fn run<S: Scheduler>(mut device: AceDevice<S>, mut rx: mpsc::UnboundedReceiver<HostRequest<S>>) {
    device.start();
    loop {
        device.run_due();
        let deadline = device.next_deadline();

        tokio::select! {
            request = rx.recv() => match request {
                Some(HostRequest::Run(job)) => job(&mut device),
                Some(HostRequest::Shutdown(done)) => {
                    device.shutdown();
                    let _ = done.send(());
                    break;
                }
                None => {
                    debug!("all handles dropped, stopping device task");
                    device.shutdown();
                    break;
                }
            },
            _ = sleep_until(deadline) => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => future::pending().await,
    }
}

impl<S: Scheduler + 'static> AceHandle<S> {
    /// Run `f` on the device task and return its result
    pub async fn call<R, F>(&self, f: F) -> Result<R, AceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut AceDevice<S>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |device| {
            let _ = tx.send(f(device));
        });
        self.tx
            .send(HostRequest::Run(job))
            .map_err(|_| AceError::DeviceStopped)?;
        rx.await.map_err(|_| AceError::DeviceStopped)
    }

    /// Issue a request through one of the device's host commands and wait
    /// for the device's answer
    ///
    /// ```ignore
    /// let response = handle.request(|dev, reply| dev.feed(0, 50, None, Some(reply))).await?;
    /// ```
    pub async fn request<F>(&self, f: F) -> Result<Response, AceError>
    where
        F: FnOnce(&mut AceDevice<S>, HostCallback) -> Result<RequestId, AceError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Reply>();
        let callback: HostCallback = Box::new(move |reply| {
            let _ = tx.send(reply);
        });
        self.call(move |device| f(device, callback)).await??;
        // dropped without a reply when the link went down mid-request
        let reply = rx.await.map_err(|_| AceError::Abandoned)?;
        Ok(reply?)
    }

    /// Snapshot of the mirrored status
    pub async fn status(&self) -> Result<DeviceStatus, AceError> {
        self.call(|device| device.status().clone()).await
    }

    /// Whether the link is up
    pub async fn is_connected(&self) -> Result<bool, AceError> {
        self.call(|device| device.is_connected()).await
    }

    /// Start parking `slot`; see [`AceDevice::park_to_toolhead`]
    pub async fn park_to_toolhead(&self, slot: u8) -> Result<RequestId, AceError> {
        self.call(move |device| device.park_to_toolhead(slot)).await?
    }

    /// Start a tool change to `to`
    pub async fn change_tool(&self, to: Option<u8>) -> Result<(), AceError> {
        self.call(move |device| device.change_tool(to)).await?
    }

    /// Advance to the next spool
    pub async fn infinity_spool(&self) -> Result<(), AceError> {
        self.call(|device| device.infinity_spool()).await?
    }

    /// Stop the device task; waits until the link is closed
    pub async fn shutdown(&self) -> Result<(), AceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(HostRequest::Shutdown(tx))
            .map_err(|_| AceError::DeviceStopped)?;
        rx.await.map_err(|_| AceError::DeviceStopped)
    }
}
