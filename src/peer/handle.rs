use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::CallError;
use crate::media::{MediaStream, TrackRef};
use crate::peer::types::IceServerSet;
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEventSink};

/// One native connection with the local tracks it sends and the remote
/// stream it produced.
///
/// Local tracks are only borrowed: closing the handle leaves them running so
/// a rebuilt connection can send them again. Remote tracks die with it.
pub struct ConnectionHandle {
    generation: u64,
    pc: Arc<dyn PeerConnection>,
    local_tracks: Vec<TrackRef>,
    remote: Option<MediaStream>,
    closed: bool,
}

impl ConnectionHandle {
    pub async fn open(
        generation: u64,
        factory: &dyn PeerConnectionFactory,
        servers: &IceServerSet,
        events: PeerEventSink,
        local: &MediaStream,
    ) -> Result<Self, CallError> {
        let pc = factory.create(servers, events).await?;
        let mut handle = Self {
            generation,
            pc,
            local_tracks: Vec::new(),
            remote: None,
            closed: false,
        };
        for track in local.tracks() {
            if let Err(err) = handle.pc.add_track(track).await {
                handle.close().await;
                return Err(err);
            }
            handle.local_tracks.push(track.clone());
        }
        debug!(generation, tracks = handle.local_tracks.len(), "connection handle opened");
        Ok(handle)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pc(&self) -> Arc<dyn PeerConnection> {
        self.pc.clone()
    }

    pub fn local_tracks(&self) -> &[TrackRef] {
        &self.local_tracks
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote.as_ref()
    }

    /// Adds to the single remote stream, creating it on first use.
    pub fn add_remote_track(&mut self, track: TrackRef) -> &MediaStream {
        let stream = self.remote.get_or_insert_with(MediaStream::empty);
        stream.add_track(track);
        stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the native connection and stops remote tracks. Returns false if
    /// it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Some(mut remote) = self.remote.take() {
            remote.stop_all();
        }
        if let Err(err) = self.pc.close().await {
            warn!(generation = self.generation, error = %err, "closing peer connection failed");
        }
        debug!(generation = self.generation, "connection handle closed");
        true
    }
}
