//! Serial-id assignment for interactive-tx contributions.
//!
//! Every input and output added to a jointly-constructed transaction carries
//! a `serial_id` whose parity identifies which side added it: even for the
//! session initiator, odd for the non-initiator. Within one side's own
//! contribution the ids must additionally come out in the order the items
//! are sent, so we assign them only after the final send order (randomized,
//! see [`shuffle`]) has been fixed.

use common::rng::Crng;

/// An interactive-tx serial-id. The parity bit (`id & 1`) identifies the
/// side that added the input/output; ordering among one side's own ids must
/// be strictly increasing in send order.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SerialId(pub u64);

impl SerialId {
    pub fn parity(&self) -> u64 {
        self.0 & 1
    }
}

/// A uniform capability for reading and assigning a serial-id, implemented
/// once per contribution type (see `crate::types::OutgoingInput` and
/// `OutgoingOutput`) rather than duplicated per variant at every call site.
pub trait HasSerialId {
    fn serial_id(&self) -> SerialId;
    fn set_serial_id(&mut self, serial_id: SerialId);
}

/// Assigns serial-ids to a side's finalized inputs and outputs in place.
///
/// Input `i` (0-indexed, in final send order) receives `2*i + parity`;
/// output `j` receives `2*(j + num_inputs) + parity`, so that all of this
/// side's input ids sort below all of its output ids, matching the order
/// `tx_add_input`/`tx_add_output` messages are actually sent in.
pub fn assign_serial_ids<I: HasSerialId, O: HasSerialId>(
    inputs: &mut [I],
    outputs: &mut [O],
    parity: u64,
) {
    debug_assert!(parity == 0 || parity == 1);
    let num_inputs = inputs.len() as u64;
    for (i, input) in inputs.iter_mut().enumerate() {
        input.set_serial_id(SerialId(2 * i as u64 + parity));
    }
    for (j, output) in outputs.iter_mut().enumerate() {
        output.set_serial_id(SerialId(2 * (j as u64 + num_inputs) + parity));
    }
}

/// Fisher-Yates shuffle driven by an injectable Crng, used to randomize the
/// send order of inputs and outputs before [`assign_serial_ids`] fixes their
/// ids. Randomizing order (rather than e.g. sorting by outpoint) avoids
/// leaking coin-selection structure to the counterparty.
pub fn shuffle<T>(items: &mut [T], rng: &mut impl Crng) {
    for i in (1..items.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}
