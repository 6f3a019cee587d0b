// apix-protocol: value types and wire formats for the event gateway.
//
// Every WebSocket frame uses a top-level `type` field for discriminated
// deserialization. HTTP DTOs mirror the REST surface described in the
// gateway's external interface. Nothing in this crate talks to storage,
// the network, or a runtime -- it is pure data.

pub mod audit;
pub mod channel;
pub mod circuit;
pub mod delivery;
pub mod error_codes;
pub mod event;
pub mod http;
pub mod principal;
pub mod session;
pub mod subscription;
pub mod ws;

pub use audit::{AuditCategory, AuditRecord, AuditSeverity};
pub use channel::Channel;
pub use circuit::{CircuitBreakerState, CircuitState};
pub use delivery::{
    Backoff, DeliveryEndpoint, DeliveryMethod, DeliveryReceipt, DeliveryReceiptStatus,
    DeliverySemantics, RetryPolicy,
};
pub use event::{compute_checksum, is_valid_event_type, Event, EventStatus, Priority};
pub use principal::{Principal, TokenClaims};
pub use session::{ClientType, Session, SessionQuality, SessionStatus};
pub use subscription::{EventFilter, Subscription};
pub use ws::{ClientFrame, ServerFrame};
