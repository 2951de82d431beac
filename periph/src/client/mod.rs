//! Protocol clients layered over a framed [`Channel`](periph_transport::Channel)

pub mod cdm;
pub mod ssi;

pub use cdm::{CdmClient, CdmVariant};
pub use ssi::SsiClient;
