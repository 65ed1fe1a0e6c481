use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the cart services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    // Cart lifecycle
    CartCreated(Uuid),
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemUpdated {
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartCleared(Uuid),
    CartsMerged {
        source_cart_id: Uuid,
        target_cart_id: Uuid,
    },
    CartConverted {
        cart_id: Uuid,
        order_id: Uuid,
    },
    CartAbandoned(Uuid),
    CartsExpired(u64),

    // Coupons
    CouponApplied {
        cart_id: Uuid,
        code: String,
    },
    CouponRemoved {
        cart_id: Uuid,
        code: String,
        reason: String,
    },

    // Abandonment tracking
    AbandonmentTracked {
        cart_id: Uuid,
        stage: String,
    },
    CartRecovered {
        cart_id: Uuid,
        order_id: Uuid,
    },
}

impl Event {
    /// Stable event name, used for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartCreated(_) => "cart_created",
            Event::CartItemAdded { .. } => "cart_item_added",
            Event::CartItemUpdated { .. } => "cart_item_updated",
            Event::CartItemRemoved { .. } => "cart_item_removed",
            Event::CartCleared(_) => "cart_cleared",
            Event::CartsMerged { .. } => "carts_merged",
            Event::CartConverted { .. } => "cart_converted",
            Event::CartAbandoned(_) => "cart_abandoned",
            Event::CartsExpired(_) => "carts_expired",
            Event::CouponApplied { .. } => "coupon_applied",
            Event::CouponRemoved { .. } => "coupon_removed",
            Event::AbandonmentTracked { .. } => "abandonment_tracked",
            Event::CartRecovered { .. } => "cart_recovered",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Best-effort emission: never waits and never fails the caller.
    pub fn send_or_log(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), "event channel full; dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event = event.name(), "event channel closed; dropping event");
            }
        }
    }
}

/// Drains the event channel, logging each event and bumping its counter.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CartItemAdded {
                cart_id,
                product_id,
                quantity,
            } => {
                metrics::counter!("cart.items.added", *quantity as u64);
                info!(%cart_id, %product_id, quantity, "item added to cart");
            }
            Event::CartsMerged {
                source_cart_id,
                target_cart_id,
            } => {
                metrics::counter!("cart.merged", 1);
                info!(%source_cart_id, %target_cart_id, "guest cart merged");
            }
            Event::CouponApplied { cart_id, code } => {
                metrics::counter!("cart.coupon.applied", 1);
                info!(%cart_id, code = %code, "coupon applied");
            }
            Event::CouponRemoved {
                cart_id,
                code,
                reason,
            } => {
                info!(%cart_id, code = %code, reason = %reason, "coupon removed");
            }
            Event::CartConverted { cart_id, order_id } => {
                metrics::counter!("cart.converted", 1);
                info!(%cart_id, %order_id, "cart converted to order");
            }
            Event::CartsExpired(count) => {
                metrics::counter!("cart.expired", *count);
                info!(count, "expired guest carts swept");
            }
            Event::AbandonmentTracked { cart_id, stage } => {
                metrics::counter!("cart.abandonment.tracked", 1);
                info!(%cart_id, stage = %stage, "abandonment tracked");
            }
            Event::CartRecovered { cart_id, order_id } => {
                metrics::counter!("cart.recovered", 1);
                info!(%cart_id, %order_id, "abandoned cart recovered");
            }
            other => {
                info!(event = other.name(), "Received event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_does_not_block_when_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);

        sender.send_or_log(Event::CartCreated(Uuid::nil()));
        // second send finds the channel full and is dropped
        sender.send_or_log(Event::CartCleared(Uuid::nil()));

        assert_eq!(rx.recv().await, Some(Event::CartCreated(Uuid::nil())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        EventSender::new(tx).send_or_log(Event::CartsExpired(3));
    }

    #[tokio::test]
    async fn process_events_ends_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender.send_or_log(Event::CouponApplied {
            cart_id: Uuid::nil(),
            code: "SAVE10".into(),
        });
        drop(sender);
        process_events(rx).await;
    }
}
