//! Seams for services the relay calls but does not implement.
//!
//! An [`Alerter`] receives operator alerts when the activity log itself can
//! no longer be written (a mail sender is the usual backend). A
//! [`PeerClassifier`] labels connecting addresses, for example by country.

use std::{fmt, net::IpAddr};

use tracing::error;

pub trait Alerter: Send + Sync {
    fn alert(&self, subject: &str, body: &str);
}

/// Default alerter: emits an error event to the process diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, subject: &str, body: &str) {
        error!(subject, body, "operator alert");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLabel {
    Known(String),
    Unknown,
}

impl fmt::Display for PeerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerLabel::Known(label) => f.write_str(label),
            PeerLabel::Unknown => f.write_str("unknown"),
        }
    }
}

pub trait PeerClassifier: Send + Sync {
    fn classify(&self, ip: IpAddr) -> PeerLabel;
}

/// Default classifier with no lookup data.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownClassifier;

impl PeerClassifier for UnknownClassifier {
    fn classify(&self, _ip: IpAddr) -> PeerLabel {
        PeerLabel::Unknown
    }
}
