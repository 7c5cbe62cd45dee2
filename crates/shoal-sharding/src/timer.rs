//! Actor Timers
//!
//! Scheduled and periodic self-messages built on plain tokio tasks. All
//! timers hold only a weak ref to their target, so a stopped actor makes
//! its timers wind down on the next tick instead of keeping it alive.

use kameo::request::MessageSend;
use kameo::actor::WeakActorRef;
use kameo::message::Message;
use kameo::Actor;
use std::time::Duration;

/// Deliver `msg` to the actor once, after `delay`. Dropped silently if
/// the actor is gone by then.
pub(crate) fn schedule_once<A, Msg>(actor: WeakActorRef<A>, delay: Duration, msg: Msg)
where
    A: Actor + Message<Msg>,
    Msg: Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(actor) = actor.upgrade() {
            let _ = actor.tell(msg).send().await;
        }
    });
}

/// Deliver a fresh `make()` message every `every`, until the actor stops.
/// The first tick fires after one full interval.
pub(crate) fn schedule_interval<A, Msg, F>(actor: WeakActorRef<A>, every: Duration, make: F)
where
    A: Actor + Message<Msg>,
    Msg: Send + 'static,
    F: Fn() -> Msg + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately on the first tick
        interval.tick().await;
        loop {
            interval.tick().await;
            match actor.upgrade() {
                Some(actor) => {
                    if actor.tell(make()).send().await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });
}
