//! Remote media received over the peer link

use crate::media::TrackKind;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Inbound track as announced by the peer link.
///
/// RTP payloads are fanned out to any number of subscribers; nobody
/// subscribing is fine, packets are simply dropped.
#[derive(Debug)]
pub struct RemoteTrack {
    kind: TrackKind,
    id: String,
    stream_id: String,
    payloads: broadcast::Sender<Bytes>,
}

impl RemoteTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let (payloads, _) = broadcast::channel(256);
        Self {
            kind,
            id: id.into(),
            stream_id: stream_id.into(),
            payloads,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.payloads.subscribe()
    }

    /// Fan one payload out. Returns the number of subscribers reached.
    pub fn publish(&self, payload: Bytes) -> usize {
        self.payloads.send(payload).unwrap_or(0)
    }
}

/// Read-only view of the remote party's tracks
#[derive(Debug, Default)]
pub struct RemoteMedia {
    tracks: RwLock<Vec<Arc<RemoteTrack>>>,
}

impl RemoteMedia {
    pub(crate) fn new(tracks: Vec<Arc<RemoteTrack>>) -> Self {
        Self {
            tracks: RwLock::new(tracks),
        }
    }

    pub(crate) fn add(&self, track: Arc<RemoteTrack>) {
        let mut tracks = self.tracks.write();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.tracks.read().clone()
    }

    pub fn track(&self, kind: TrackKind) -> Option<Arc<RemoteTrack>> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_track_ids_are_ignored() {
        let media = RemoteMedia::new(vec![Arc::new(RemoteTrack::new(TrackKind::Audio, "a", "s"))]);
        media.add(Arc::new(RemoteTrack::new(TrackKind::Audio, "a", "s")));
        media.add(Arc::new(RemoteTrack::new(TrackKind::Video, "v", "s")));
        assert_eq!(media.tracks().len(), 2);
        assert!(media.has_video());
    }

    #[tokio::test]
    async fn payloads_reach_subscribers() {
        let track = RemoteTrack::new(TrackKind::Audio, "a", "s");
        assert_eq!(track.publish(Bytes::from_static(b"x")), 0);
        let mut rx = track.subscribe();
        assert_eq!(track.publish(Bytes::from_static(b"y")), 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"y"));
    }
}
