//! SIP server location
//!
//! Turns a logical destination into the hops a sender tries in order,
//! following NAPTR, SRV and A records and RFC 2782 weighted selection.

pub mod destination;
pub mod records;
pub mod resolver;
pub mod result;
pub mod selector;

pub use destination::SipDestination;
pub use records::{service_type, unquote, DnsARecord, DnsSrvRecord, NaptrRecord, RecordSource, SrvCandidate};
pub use resolver::DestinationResolver;
pub use result::{Hop, ResolutionKind, ResolutionResult, ScrubbedResult};
pub use selector::order_candidates;
