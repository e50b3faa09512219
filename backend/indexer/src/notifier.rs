//! Live change notifications for connected clients.
//!
//! Delivery is at most once and fire-and-forget: a subscriber that lags or
//! disconnects simply misses updates and is expected to re-fetch full state.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{CampaignAggregate, Donation};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct DonationNotice {
    pub campaign_id: i64,
    pub blockchain_id: Option<String>,
    pub donation: Donation,
    pub campaign: CampaignAggregate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    CampaignUpdated(CampaignAggregate),
    NewDonation(Box<DonationNotice>),
}

#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Broadcast the updated aggregate, plus a donation notice when the
    /// update was caused by one.
    pub fn publish(&self, aggregate: &CampaignAggregate, donation: Option<&Donation>) {
        self.emit(Notification::CampaignUpdated(aggregate.clone()));

        if let Some(donation) = donation {
            self.emit(Notification::NewDonation(Box::new(DonationNotice {
                campaign_id: aggregate.campaign.id,
                blockchain_id: aggregate.campaign.blockchain_id.clone(),
                donation: donation.clone(),
                campaign: aggregate.clone(),
            })));
        }
    }

    fn emit(&self, notification: Notification) {
        // An error only means nobody is listening right now.
        match self.tx.send(notification) {
            Ok(receivers) => debug!("Notification delivered to {receivers} subscriber(s)"),
            Err(_) => debug!("Notification dropped: no subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Campaign;

    fn aggregate() -> CampaignAggregate {
        CampaignAggregate {
            campaign: Campaign {
                id: 1,
                blockchain_id: Some("7".to_string()),
                title: "Clean water".to_string(),
                description: String::new(),
                target_amount: 10.0,
                deadline: None,
                amount_collected: 1.0,
                verified: false,
                withdrawn: false,
                created_at: 0,
            },
            milestones: vec![],
            donations: vec![],
        }
    }

    fn donation() -> Donation {
        Donation {
            id: 1,
            campaign_id: 1,
            user_id: Some(1),
            donor: "0xabc".to_string(),
            amount: 1.0,
            tx_hash: "0xaaa".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        ChangeNotifier::new().publish(&aggregate(), Some(&donation()));
    }

    #[tokio::test]
    async fn donation_update_emits_both_channels() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.publish(&aggregate(), Some(&donation()));

        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::CampaignUpdated(_)
        ));
        match rx.recv().await.unwrap() {
            Notification::NewDonation(notice) => {
                assert_eq!(notice.blockchain_id.as_deref(), Some("7"));
                assert_eq!(notice.donation.tx_hash, "0xaaa");
            }
            other => panic!("unexpected notification {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wire_format_uses_event_names() {
        let json = serde_json::to_value(Notification::CampaignUpdated(aggregate())).unwrap();
        assert_eq!(json["event"], "CAMPAIGN_UPDATED");
        assert_eq!(json["data"]["blockchain_id"], "7");
        assert_eq!(json["data"]["amount_collected"], 1.0);
    }
}
