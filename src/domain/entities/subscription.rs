use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Local lifecycle status of a subscription.
///
/// `Canceled` is terminal: a user who subscribes again gets a new row.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[derive(Default)]
pub enum SubscriptionStatus {
    #[default]
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    /// Maps a status string reported by the payment provider.
    ///
    /// `incomplete_expired` is the provider's way of saying the first payment never
    /// completed, which ends the lifecycle locally. Unrecognized values (e.g. `paused`)
    /// return `None` and leave the local status untouched.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> &'static [SubscriptionStatus] {
        use SubscriptionStatus::*;
        match self {
            Incomplete => &[Active, Trialing, Canceled],
            Trialing => &[Active, PastDue, Canceled],
            Active => &[PastDue, Canceled],
            PastDue => &[Active, Unpaid, Canceled],
            Unpaid => &[Active, Canceled],
            Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// Statuses in which a payment failure is tracked by dunning.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Unpaid
        )
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[derive(Default)]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_customer_id: String,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub tier: Tier,
    pub current_period_start: Option<NaiveDateTime>,
    pub current_period_end: Option<NaiveDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<NaiveDateTime>,
    pub trial_end: Option<NaiveDateTime>,
    pub grace_period_end: Option<NaiveDateTime>,
    pub canceled_at: Option<NaiveDateTime>,
    /// Provider timestamp of the newest event applied to this row.
    pub last_event_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Subscription {
    /// A fresh `incomplete` subscription, as opened by checkout.
    pub fn open_checkout(user_id: Uuid, provider_customer_id: &str, now: NaiveDateTime) -> Self {
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            provider_customer_id: provider_customer_id.to_string(),
            provider_subscription_id: None,
            provider_price_id: None,
            status: SubscriptionStatus::Incomplete,
            tier: Tier::Free,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_start: None,
            trial_end: None,
            grace_period_end: None,
            canceled_at: None,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Paid access rule. Every consumer asks this one method.
    pub fn is_entitled(&self, now: NaiveDateTime) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => true,
            SubscriptionStatus::PastDue => self.grace_period_end.is_some_and(|end| now < end),
            _ => false,
        }
    }

    /// True when an event stamped `event_at` predates what this row already reflects.
    pub fn is_stale(&self, event_at: NaiveDateTime) -> bool {
        self.last_event_at.is_some_and(|last| event_at < last)
    }
}
