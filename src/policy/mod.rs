//! Network policy: address classification and inbound/outbound admission.
//!
//! The outbound side is the sole SSRF defense. The address classified here is
//! the address the dispatcher dials; callers pin it rather than re-resolving.

mod address;
mod outbound;

pub use address::{AddressClass, classify, in_cidr_set};
pub use outbound::{PinnedTarget, authorize_inbound, resolve_and_authorize};
