use biometrics::{Collector, Counter, Moments};

pub(crate) static TURNS: Counter = Counter::new("ragchat.pipeline.turns");
pub(crate) static TURN_FAILURES: Counter = Counter::new("ragchat.pipeline.turn_failures");
pub(crate) static TURN_DURATION: Moments = Moments::new("ragchat.pipeline.turn_duration_seconds");

pub(crate) static RETRIEVAL_REQUESTS: Counter = Counter::new("ragchat.retrieval.requests");
pub(crate) static RETRIEVAL_ERRORS: Counter = Counter::new("ragchat.retrieval.errors");
pub(crate) static RETRIEVAL_DURATION: Moments =
    Moments::new("ragchat.retrieval.duration_seconds");
pub(crate) static RETRIEVAL_FRAGMENTS: Moments = Moments::new("ragchat.retrieval.fragments");

pub(crate) static COMPLETION_REQUESTS: Counter = Counter::new("ragchat.completion.requests");
pub(crate) static COMPLETION_ERRORS: Counter = Counter::new("ragchat.completion.errors");
pub(crate) static COMPLETION_DURATION: Moments =
    Moments::new("ragchat.completion.duration_seconds");

pub(crate) static RETRIES: Counter = Counter::new("ragchat.retry.attempts");
pub(crate) static RETRY_BACKOFF: Moments = Moments::new("ragchat.retry.backoff_seconds");

pub(crate) static SESSIONS_CREATED: Counter = Counter::new("ragchat.sessions.created");
pub(crate) static SESSIONS_EVICTED: Counter = Counter::new("ragchat.sessions.evicted");
pub(crate) static SESSIONS_REJECTED: Counter = Counter::new("ragchat.sessions.rejected");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&TURNS);
    collector.register_counter(&TURN_FAILURES);
    collector.register_moments(&TURN_DURATION);

    collector.register_counter(&RETRIEVAL_REQUESTS);
    collector.register_counter(&RETRIEVAL_ERRORS);
    collector.register_moments(&RETRIEVAL_DURATION);
    collector.register_moments(&RETRIEVAL_FRAGMENTS);

    collector.register_counter(&COMPLETION_REQUESTS);
    collector.register_counter(&COMPLETION_ERRORS);
    collector.register_moments(&COMPLETION_DURATION);

    collector.register_counter(&RETRIES);
    collector.register_moments(&RETRY_BACKOFF);

    collector.register_counter(&SESSIONS_CREATED);
    collector.register_counter(&SESSIONS_EVICTED);
    collector.register_counter(&SESSIONS_REJECTED);
}
