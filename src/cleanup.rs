//! Teardown of everything a call acquired.
//!
//! All resources live in one [`CallResources`] value and every field is
//! taken out as it is released, so a second [`CallResources::release`] finds
//! nothing left to do.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::media::transform::TrackTransform;
use crate::media::{MediaSink, MediaStream};
use crate::peer::ConnectionHandle;
use crate::signaling::Subscription;

/// Background work a call may have pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    MediaAcquisition,
    IceResolve,
    Retry,
    EstablishTimeout,
    CallTimeLimit,
}

/// At most one task per kind; scheduling a kind again aborts the old one.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: HashMap<TaskKind, JoinHandle<()>>,
}

impl TaskSet {
    pub fn schedule(&mut self, kind: TaskKind, handle: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(kind, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, kind: TaskKind) -> bool {
        match self.tasks.remove(&kind) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, kind: TaskKind) -> bool {
        self.tasks
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn abort_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
        count
    }
}

/// What one release pass actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub tasks_aborted: usize,
    pub unsubscribed: bool,
    pub connection_closed: bool,
    pub local_tracks_stopped: usize,
    pub transform_closed: bool,
    pub sinks_detached: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default)]
pub struct CallResources {
    pub local_stream: Option<MediaStream>,
    pub handle: Option<ConnectionHandle>,
    pub subscription: Option<Subscription>,
    pub transform: Option<Arc<dyn TrackTransform>>,
    pub sinks: Vec<Arc<dyn MediaSink>>,
    pub tasks: TaskSet,
}

impl CallResources {
    /// Closes the current connection handle, if any, leaving local media
    /// untouched.
    pub async fn close_handle(&mut self) -> bool {
        match self.handle.take() {
            Some(mut handle) => handle.close().await,
            None => false,
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn MediaSink>) {
        if !self.sinks.iter().any(|s| Arc::ptr_eq(s, &sink)) {
            self.sinks.push(sink);
        }
    }

    pub async fn release(&mut self) -> CleanupReport {
        let mut report = CleanupReport {
            tasks_aborted: self.tasks.abort_all(),
            ..Default::default()
        };

        if let Some(mut subscription) = self.subscription.take() {
            report.unsubscribed = subscription.unsubscribe();
        }

        report.connection_closed = self.close_handle().await;

        if let Some(mut stream) = self.local_stream.take() {
            report.local_tracks_stopped = stream.stop_all();
        }

        if let Some(transform) = self.transform.take() {
            transform.close();
            report.transform_closed = true;
        }

        for sink in self.sinks.drain(..) {
            sink.detach();
            report.sinks_detached += 1;
        }

        if report.is_empty() {
            debug!("cleanup found nothing to release");
        } else {
            info!(?report, "call resources released");
        }
        report
    }
}
