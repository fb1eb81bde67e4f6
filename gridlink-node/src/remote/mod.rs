/// Remote subscription protocol - request/notification exchange over a
/// wire channel
///
/// The client allocates a tid per registration and dispatches replies by
/// tid lookup; the server mirrors each tid with a local registration on the
/// addressed asset. Reconnects replay live registrations verbatim, so
/// bootstrap redelivery replaces silent gaps with a fresh snapshot.
pub mod client;
pub mod server;

pub use client::{RemoteSubscriptionClient, SubscriberSink, spawn_dispatch};
pub use server::SubscriptionServer;
