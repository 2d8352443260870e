//! Per-participant media session tables.
//!
//! The stage actor owns these tables; participants reference their
//! transports/producers/consumers by id only. Mutation happens exclusively
//! through the orchestration steps the stage actor executes, never from
//! broadcast handlers.

use stage_protocol::types::{
    ConsumerId, MediaKind, ParticipantId, ProducerId, TransportDirection, TransportId,
};
use std::collections::HashMap;

/// A transport owned by a participant.
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub connected: bool,
}

/// A producer owned by a participant's send transport.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
}

/// A consumer owned by a participant's receive transport.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub consumer_id: ConsumerId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub resumed: bool,
}

/// Everything one participant owns in the media engine.
#[derive(Debug, Default)]
pub struct ParticipantMedia {
    transports: HashMap<TransportId, TransportRecord>,
    send_transport: Option<TransportId>,
    receive_transport: Option<TransportId>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl ParticipantMedia {
    /// Register a freshly created transport for `direction`.
    ///
    /// At most one transport per direction exists at a time; the previous
    /// one (if any) is returned so the caller can close it in the engine
    /// together with everything it owned (renegotiation).
    pub fn set_transport(
        &mut self,
        transport_id: TransportId,
        direction: TransportDirection,
    ) -> Option<ReplacedTransport> {
        let slot = match direction {
            TransportDirection::Send => &mut self.send_transport,
            TransportDirection::Receive => &mut self.receive_transport,
        };
        let previous = slot.replace(transport_id.clone());

        self.transports.insert(
            transport_id.clone(),
            TransportRecord {
                transport_id,
                direction,
                connected: false,
            },
        );

        previous.map(|old_id| {
            self.transports.remove(&old_id);
            let producers: Vec<ProducerId> = self
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == old_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &producers {
                self.producers.remove(id);
            }
            let consumers: Vec<ConsumerId> = self
                .consumers
                .iter()
                .filter(|(_, c)| c.transport_id == old_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &consumers {
                self.consumers.remove(id);
            }
            ReplacedTransport {
                transport_id: old_id,
                producers,
                consumers,
            }
        })
    }

    /// Look up an owned transport.
    #[must_use]
    pub fn transport(&self, transport_id: &str) -> Option<&TransportRecord> {
        self.transports.get(transport_id)
    }

    /// Mark an owned transport connected.
    pub fn mark_connected(&mut self, transport_id: &str) -> bool {
        match self.transports.get_mut(transport_id) {
            Some(record) => {
                record.connected = true;
                true
            }
            None => false,
        }
    }

    pub fn record_producer(&mut self, record: ProducerRecord) {
        self.producers.insert(record.producer_id.clone(), record);
    }

    /// Remove an owned producer; `None` if not owned.
    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerRecord> {
        self.producers.remove(producer_id)
    }

    #[must_use]
    pub fn producer(&self, producer_id: &str) -> Option<&ProducerRecord> {
        self.producers.get(producer_id)
    }

    pub fn record_consumer(&mut self, record: ConsumerRecord) {
        self.consumers.insert(record.consumer_id.clone(), record);
    }

    /// Mark an owned consumer resumed; false if not owned.
    pub fn mark_consumer_resumed(&mut self, consumer_id: &str) -> bool {
        match self.consumers.get_mut(consumer_id) {
            Some(record) => {
                record.resumed = true;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &str) -> Option<&ConsumerRecord> {
        self.consumers.get(consumer_id)
    }

    /// Drain every owned resource, consumers first, for engine teardown.
    #[must_use]
    pub fn into_cleanup(self) -> MediaCleanup {
        MediaCleanup {
            consumers: self.consumers.into_keys().collect(),
            producers: self.producers.into_keys().collect(),
            transports: self.transports.into_keys().collect(),
        }
    }
}

/// A transport displaced by renegotiation, with everything it owned.
#[derive(Debug)]
pub struct ReplacedTransport {
    pub transport_id: TransportId,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

/// Resources to close in the engine, in dependency order.
#[derive(Debug)]
pub struct MediaCleanup {
    pub consumers: Vec<ConsumerId>,
    pub producers: Vec<ProducerId>,
    pub transports: Vec<TransportId>,
}

/// Media tables for every participant of one stage.
#[derive(Debug, Default)]
pub struct MediaSessions {
    sessions: HashMap<ParticipantId, ParticipantMedia>,
}

impl MediaSessions {
    pub fn create(&mut self, participant_id: ParticipantId) {
        self.sessions.entry(participant_id).or_default();
    }

    /// Remove a participant's session for teardown; `None` if absent.
    pub fn remove(&mut self, participant_id: &str) -> Option<ParticipantMedia> {
        self.sessions.remove(participant_id)
    }

    #[must_use]
    pub fn get(&self, participant_id: &str) -> Option<&ParticipantMedia> {
        self.sessions.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut ParticipantMedia> {
        self.sessions.get_mut(participant_id)
    }

    /// Find the participant owning a still-alive producer.
    #[must_use]
    pub fn producer_owner(&self, producer_id: &str) -> Option<&ParticipantId> {
        self.sessions
            .iter()
            .find(|(_, media)| media.producers.contains_key(producer_id))
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_one_transport_per_direction() {
        let mut media = ParticipantMedia::default();
        assert!(media
            .set_transport("t1".to_string(), TransportDirection::Send)
            .is_none());

        // A receive transport does not displace the send transport.
        assert!(media
            .set_transport("t2".to_string(), TransportDirection::Receive)
            .is_none());

        // Renegotiating the send direction displaces t1.
        let replaced = media
            .set_transport("t3".to_string(), TransportDirection::Send)
            .expect("t1 should be displaced");
        assert_eq!(replaced.transport_id, "t1");
        assert!(media.transport("t1").is_none());
        assert!(media.transport("t3").is_some());
    }

    #[test]
    fn test_renegotiation_carries_owned_resources() {
        let mut media = ParticipantMedia::default();
        media.set_transport("t1".to_string(), TransportDirection::Send);
        media.record_producer(ProducerRecord {
            producer_id: "p1".to_string(),
            transport_id: "t1".to_string(),
            kind: MediaKind::Audio,
        });

        let replaced = media
            .set_transport("t2".to_string(), TransportDirection::Send)
            .expect("t1 should be displaced");
        assert_eq!(replaced.producers, vec!["p1".to_string()]);
        assert!(media.producer("p1").is_none());
    }

    #[test]
    fn test_cleanup_drains_everything() {
        let mut media = ParticipantMedia::default();
        media.set_transport("t1".to_string(), TransportDirection::Send);
        media.set_transport("t2".to_string(), TransportDirection::Receive);
        media.record_producer(ProducerRecord {
            producer_id: "p1".to_string(),
            transport_id: "t1".to_string(),
            kind: MediaKind::Audio,
        });
        media.record_consumer(ConsumerRecord {
            consumer_id: "c1".to_string(),
            transport_id: "t2".to_string(),
            producer_id: "p-remote".to_string(),
            resumed: false,
        });

        let cleanup = media.into_cleanup();
        assert_eq!(cleanup.consumers, vec!["c1".to_string()]);
        assert_eq!(cleanup.producers, vec!["p1".to_string()]);
        assert_eq!(cleanup.transports.len(), 2);
    }

    #[test]
    fn test_producer_owner_lookup() {
        let mut sessions = MediaSessions::default();
        sessions.create("alice".to_string());
        sessions
            .get_mut("alice")
            .unwrap()
            .record_producer(ProducerRecord {
                producer_id: "p1".to_string(),
                transport_id: "t1".to_string(),
                kind: MediaKind::Video,
            });

        assert_eq!(sessions.producer_owner("p1").map(String::as_str), Some("alice"));
        assert!(sessions.producer_owner("p2").is_none());

        sessions.get_mut("alice").unwrap().remove_producer("p1");
        assert!(sessions.producer_owner("p1").is_none());
    }

    #[test]
    fn test_consumer_resume_tracking() {
        let mut media = ParticipantMedia::default();
        media.record_consumer(ConsumerRecord {
            consumer_id: "c1".to_string(),
            transport_id: "t2".to_string(),
            producer_id: "p1".to_string(),
            resumed: false,
        });

        assert!(!media.consumer("c1").unwrap().resumed);
        assert!(media.mark_consumer_resumed("c1"));
        assert!(media.consumer("c1").unwrap().resumed);
        assert!(!media.mark_consumer_resumed("c9"));
    }
}
