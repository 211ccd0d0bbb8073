//! Tier-based admission of inbound messages.
//!
//! Runs after deduplication and before a message reaches subscribers.
//! Rejections are final: the message is logged with its reason code and
//! dropped, never retried.

use thiserror::Error;
use tracing::{debug, info};

use crate::directory::{PeerDirectory, Tier};
use crate::messages::GossipMessage;

/// Why a message was kept from subscribers. The `Display` form is the reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("UntrustedSender")]
    UntrustedSender,
    #[error("MissingTopic")]
    MissingTopic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { tier: Tier },
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    directory: PeerDirectory,
}

impl MessageRouter {
    pub fn new(directory: PeerDirectory) -> Self {
        Self { directory }
    }

    /// Decides whether `message` may be delivered and logs the outcome.
    pub async fn admit(&self, message: &GossipMessage) -> Admission {
        let admission = self.classify(message).await;
        match admission {
            Admission::Accepted { tier } => debug!(
                sender = %message.sender.short(),
                topic = %message.topic,
                sequence = message.sequence,
                tier = %tier,
                "admitted"
            ),
            Admission::Rejected(reason) => info!(
                sender = %message.sender.short(),
                topic = %message.topic,
                sequence = message.sequence,
                reason = %reason,
                "rejected"
            ),
        }
        admission
    }

    async fn classify(&self, message: &GossipMessage) -> Admission {
        let tier = self.directory.tier_of(&message.sender).await;
        if !tier.is_trusted() {
            return Admission::Rejected(RejectReason::UntrustedSender);
        }
        if message.topic.is_empty() {
            return Admission::Rejected(RejectReason::MissingTopic);
        }
        Admission::Accepted { tier }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PeerRecord;
    use crate::identity::Keypair;

    fn message_from(keypair: &Keypair, topic: &str) -> GossipMessage {
        GossipMessage::signed(keypair, topic, 1, b"payload".to_vec())
    }

    #[tokio::test]
    async fn unknown_sender_is_untrusted_for_any_message() {
        let dir = PeerDirectory::new();
        let router = MessageRouter::new(dir.clone());
        let stranger = Keypair::generate();
        dir.record_discovered(stranger.identity(), "10.0.0.1:1".into()).await;

        for topic in ["news", "", "did:tiermesh:00"] {
            assert_eq!(
                router.admit(&message_from(&stranger, topic)).await,
                Admission::Rejected(RejectReason::UntrustedSender)
            );
        }

        let absent = Keypair::generate();
        assert_eq!(
            router.admit(&message_from(&absent, "news")).await,
            Admission::Rejected(RejectReason::UntrustedSender)
        );
    }

    #[tokio::test]
    async fn trusted_sender_without_topic_is_rejected() {
        let dir = PeerDirectory::new();
        let trusted = Keypair::generate();
        dir.upsert(PeerRecord::configured(trusted.identity(), Tier::Tier2, "10.0.0.1:1")).await;
        let router = MessageRouter::new(dir);

        assert_eq!(
            router.admit(&message_from(&trusted, "")).await,
            Admission::Rejected(RejectReason::MissingTopic)
        );
    }

    #[tokio::test]
    async fn trusted_senders_are_accepted_with_their_tier() {
        let dir = PeerDirectory::new();
        let tier1 = Keypair::generate();
        let tier2 = Keypair::generate();
        dir.upsert(PeerRecord::configured(tier1.identity(), Tier::Tier1, "10.0.0.1:1")).await;
        dir.upsert(PeerRecord::configured(tier2.identity(), Tier::Tier2, "10.0.0.2:1")).await;
        let router = MessageRouter::new(dir);

        assert_eq!(
            router.admit(&message_from(&tier1, "news")).await,
            Admission::Accepted { tier: Tier::Tier1 }
        );
        assert_eq!(
            router.admit(&message_from(&tier2, "news")).await,
            Admission::Accepted { tier: Tier::Tier2 }
        );
    }

    #[test]
    fn reason_codes_render_verbatim() {
        assert_eq!(RejectReason::UntrustedSender.to_string(), "UntrustedSender");
        assert_eq!(RejectReason::MissingTopic.to_string(), "MissingTopic");
    }
}
