//! Fake peer connector for the mesh path.

use async_trait::async_trait;
use serde_json::json;
use stage_client::errors::MediaError;
use stage_client::media::LocalTrack;
use stage_client::mesh::{PeerConnector, PeerLink};
use stage_protocol::types::{IceCandidate, SessionDescription};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fake [`PeerConnector`] that hands out introspectable links, each
/// pre-seeded with a fixed number of local ICE candidates.
pub struct FakePeerConnector {
    links: Mutex<Vec<Arc<FakePeerLink>>>,
    candidates_per_link: usize,
    next_id: AtomicUsize,
}

impl FakePeerConnector {
    #[must_use]
    pub fn new(candidates_per_link: usize) -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(Vec::new()),
            candidates_per_link,
            next_id: AtomicUsize::new(0),
        })
    }

    /// Every link created so far, in creation order.
    #[must_use]
    pub fn links(&self) -> Vec<Arc<FakePeerLink>> {
        self.links.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create_link(&self) -> Result<Arc<dyn PeerLink>, MediaError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(FakePeerLink::new(id, self.candidates_per_link));
        self.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

/// Fake [`PeerLink`] recording everything applied to it.
pub struct FakePeerLink {
    id: usize,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    accepted_offer: Mutex<Option<SessionDescription>>,
    accepted_answer: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    local_candidates: tokio::sync::Mutex<VecDeque<IceCandidate>>,
    tracks: Mutex<Vec<LocalTrack>>,
    closed: AtomicBool,
}

impl FakePeerLink {
    fn new(id: usize, candidate_count: usize) -> Self {
        let local_candidates = (0..candidate_count)
            .map(|n| IceCandidate(json!({ "candidate": format!("candidate:fake {id} {n}") })))
            .collect();
        Self {
            id,
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            accepted_offer: Mutex::new(None),
            accepted_answer: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            local_candidates: tokio::sync::Mutex::new(local_candidates),
            tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn offer_count(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn answer_count(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn accepted_offer(&self) -> Option<SessionDescription> {
        self.accepted_offer.lock().unwrap().clone()
    }

    #[must_use]
    pub fn accepted_answer(&self) -> Option<SessionDescription> {
        self.accepted_answer.lock().unwrap().clone()
    }

    #[must_use]
    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.lock().unwrap().len()
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.track_id.clone())
            .collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakePeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription(
            json!({ "type": "offer", "link": self.id }),
        ))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        *self.accepted_offer.lock().unwrap() = Some(offer.clone());
        self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription(
            json!({ "type": "answer", "link": self.id }),
        ))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), MediaError> {
        *self.accepted_answer.lock().unwrap() = Some(answer.clone());
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.remote_candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn next_candidate(&self) -> Option<IceCandidate> {
        self.local_candidates.lock().await.pop_front()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        self.tracks.lock().unwrap().push(track.clone());
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), MediaError> {
        self.tracks
            .lock()
            .unwrap()
            .retain(|t| t.track_id != track_id);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
