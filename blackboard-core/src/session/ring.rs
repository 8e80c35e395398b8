use std::mem;
use std::sync::Arc;

use crate::delta::{DeltaEnvelope, EnvelopeTarget};

/// Three recycled envelope lists: pending, in flight and idle
///
/// The coordinator appends to `pending`. Opening a transaction moves
/// `pending` into `in_flight`, where it stays until the next open so a
/// snapshot can save what the last transaction consumed.
#[derive(Debug, Default)]
pub(crate) struct DeltaRing {
    pending: Vec<Arc<DeltaEnvelope>>,
    in_flight: Vec<Arc<DeltaEnvelope>>,
    idle: Vec<Arc<DeltaEnvelope>>,
}

impl DeltaRing {
    pub(crate) fn receive(&mut self, envelope: Arc<DeltaEnvelope>) {
        self.pending.push(envelope);
    }

    /// Rotate the slots and return the envelopes now in flight
    pub(crate) fn begin(&mut self) -> Vec<Arc<DeltaEnvelope>> {
        self.in_flight.clear();
        mem::swap(&mut self.idle, &mut self.in_flight);
        mem::swap(&mut self.pending, &mut self.in_flight);
        self.in_flight.clone()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Envelopes worth saving: ordinary fan-out only
    pub(crate) fn persistable(&self) -> (Vec<Arc<DeltaEnvelope>>, Vec<Arc<DeltaEnvelope>>) {
        let keep = |list: &[Arc<DeltaEnvelope>]| {
            list.iter()
                .filter(|env| env.target() == EnvelopeTarget::All)
                .cloned()
                .collect()
        };
        (keep(&self.pending), keep(&self.in_flight))
    }
}
