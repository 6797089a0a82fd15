/// Outbound notification collaborator and its broadcast-hub implementation.
pub mod messaging;
/// Client-facing payload construction and stripping.
pub mod quiz_events;
/// The periodic reconciliation tick.
pub mod reconciliation_service;
/// Start-task and tick scheduling glue.
pub mod schedule_service;
/// Cache facade for the request-handling layer.
pub mod session_service;
/// Statistics aggregation collaborator.
pub mod statistics;
