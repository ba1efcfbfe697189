use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Counts WARN events seen by the subscriber it is layered on.
#[derive(Clone, Default)]
struct WarnCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Runs `f` on this thread with a subscriber that counts warnings, and
/// returns its result with the number of warnings logged.
pub(crate) fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let counter = WarnCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, counter.0.load(Ordering::SeqCst))
}
