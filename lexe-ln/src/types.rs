//! The data model shared by the Interactive-Tx Funder and the Replaceable-Tx
//! Publisher: funding parameters, the tagged [`Purpose`] variants, the
//! contributed inputs/outputs, and the final assembled contribution.

use bitcoin::{
    absolute::LockTime, Amount, OutPoint, ScriptBuf, Sequence, SignedAmount,
    Transaction, Weight,
};

use crate::serial_id::{HasSerialId, SerialId};

/// A Lightning channel identifier. Opaque to this crate; we only need it to
/// route a terminal reply back to the right caller and to tag log lines.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Which side of the interactive-tx session this instance represents.
/// Determines the serial-id parity bit and several funding-needed /
/// final-assembly predicates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    NonInitiator,
}

impl Role {
    /// The serial-id parity bit: 0 for the initiator, 1 for the
    /// non-initiator.
    pub fn serial_id_parity(&self) -> u64 {
        match self {
            Role::Initiator => 0,
            Role::NonInitiator => 1,
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Whether each side requires its contributed inputs to have at least one
/// confirmation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RequireConfirmedInputs {
    pub for_local: bool,
    pub for_remote: bool,
}

/// The previous channel funding outpoint, present whenever this operation
/// splices an existing channel.
#[derive(Clone, Debug)]
pub struct SharedInputParams {
    pub outpoint: OutPoint,
    pub script: ScriptBuf,
    /// The weight this input will add to the final transaction once
    /// witnessed. Passed to the Wallet Adapter as an "external input weight"
    /// so its own fee accounting doesn't have to guess at our witness size.
    pub witness_weight: Weight,
}

/// A transaction funded during a previous attempt at this same operation
/// (an earlier RBF round). Retained so that every previous attempt remains
/// double-spent by the next one, and so its outpoints stay locked until it
/// is superseded or confirms.
#[derive(Clone, Debug)]
pub struct PreviousAttempt {
    pub tx: Transaction,
    /// The index into `tx.input` of the shared input, if this attempt
    /// included one. Excluded when collecting this side's previously
    /// wallet-contributed inputs.
    pub shared_input_index: Option<usize>,
}

impl PreviousAttempt {
    /// This side's previously wallet-contributed input outpoints, i.e.
    /// every input of `tx` except the shared input.
    pub fn local_input_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.tx.input.iter().enumerate().filter_map(move |(i, txin)| {
            if Some(i) == self.shared_input_index {
                None
            } else {
                Some(txin.previous_output)
            }
        })
    }
}

/// The operation being funded. Carries both the control-flow discriminant
/// (whether a fee budget applies, whether there's RBF history) and the
/// balance context needed to size the shared output on a splice.
#[derive(Clone, Debug)]
pub enum Purpose {
    FundingTx {
        fee_budget: Option<Amount>,
    },
    FundingTxRbf {
        previous_attempts: Vec<PreviousAttempt>,
        fee_budget: Option<Amount>,
    },
    SpliceTx {
        prev_local_balance: SignedAmount,
        prev_remote_balance: SignedAmount,
        htlc_balance: Amount,
        prev_funding_amount: Amount,
    },
    SpliceTxRbf {
        prev_local_balance: SignedAmount,
        prev_remote_balance: SignedAmount,
        htlc_balance: Amount,
        prev_funding_amount: Amount,
        previous_attempts: Vec<PreviousAttempt>,
        fee_budget: Option<Amount>,
    },
}

impl Purpose {
    pub fn is_splice(&self) -> bool {
        matches!(self, Purpose::SpliceTx { .. } | Purpose::SpliceTxRbf { .. })
    }

    pub fn fee_budget(&self) -> Option<Amount> {
        match self {
            Purpose::FundingTx { fee_budget } => *fee_budget,
            Purpose::FundingTxRbf { fee_budget, .. } => *fee_budget,
            Purpose::SpliceTx { .. } => None,
            Purpose::SpliceTxRbf { fee_budget, .. } => *fee_budget,
        }
    }

    pub fn previous_attempts(&self) -> &[PreviousAttempt] {
        match self {
            Purpose::FundingTx { .. } => &[],
            Purpose::FundingTxRbf { previous_attempts, .. } => previous_attempts,
            Purpose::SpliceTx { .. } => &[],
            Purpose::SpliceTxRbf { previous_attempts, .. } => previous_attempts,
        }
    }

    pub fn prev_funding_amount(&self) -> Amount {
        match self {
            Purpose::SpliceTx { prev_funding_amount, .. }
            | Purpose::SpliceTxRbf { prev_funding_amount, .. } => {
                *prev_funding_amount
            }
            Purpose::FundingTx { .. } | Purpose::FundingTxRbf { .. } => {
                Amount::ZERO
            }
        }
    }
}

/// Complete parameters for one interactive-tx funding attempt.
#[derive(Clone, Debug)]
pub struct FundingParams {
    pub role: Role,
    pub channel_id: ChannelId,
    pub funding_script: ScriptBuf,
    /// This side's contribution in satoshis. May be negative on a
    /// splice-out.
    pub local_contribution: SignedAmount,
    pub remote_contribution: SignedAmount,
    /// User-requested non-change outputs (e.g. a splice-out destination).
    pub local_outputs: Vec<(ScriptBuf, Amount)>,
    pub shared_input: Option<SharedInputParams>,
    pub target_feerate: bitcoin::FeeRate,
    pub lock_time: LockTime,
    pub require_confirmed_inputs: RequireConfirmedInputs,
    pub purpose: Purpose,
}

impl FundingParams {
    /// Sum of this side's requested non-change output amounts.
    pub fn local_outputs_total(&self) -> Amount {
        self.local_outputs
            .iter()
            .map(|(_, amount)| *amount)
            .fold(Amount::ZERO, |acc, a| acc + a)
    }

    /// Whether this session needs to ask the Wallet Adapter for additional
    /// inputs, per the role/operation table in §4.2 of the funding spec.
    ///
    /// NOTE: the splice predicates use `>= 0`, not `> 0`. At exactly zero
    /// this forces a wallet funding round even though nothing is strictly
    /// needed, ensuring fees are covered by fresh wallet inputs rather than
    /// by shaving the channel balance in edge cases. Preserved as specified.
    pub fn needs_additional_funding(&self) -> bool {
        let local_outputs_total = signed_sats(self.local_outputs_total());
        let local_contribution = self.local_contribution.to_sat();

        match (self.role, self.purpose.is_splice()) {
            (Role::Initiator, false) => {
                local_contribution > 0 || !self.local_outputs.is_empty()
            }
            (Role::Initiator, true) => {
                local_contribution + local_outputs_total >= 0
            }
            (Role::NonInitiator, _) if self.local_outputs.is_empty() => {
                local_contribution > 0
            }
            (Role::NonInitiator, _) => {
                local_contribution + local_outputs_total >= 0
            }
        }
    }
}

fn signed_sats(amount: Amount) -> i64 {
    amount.to_sat() as i64
}


/// A finalized input contributed by this side, with its serial-id already
/// assigned.
#[derive(Clone, Debug)]
pub enum OutgoingInput {
    Local(LocalInput),
    Shared(SharedInput),
}

#[derive(Clone, Debug)]
pub struct LocalInput {
    pub serial_id: SerialId,
    /// The backing transaction, with witness data stripped so the
    /// serialized size stays within the `tx_add_input` envelope.
    pub prev_tx: Transaction,
    pub output_index: u32,
    pub sequence: Sequence,
}

#[derive(Clone, Debug)]
pub struct SharedInput {
    pub serial_id: SerialId,
    pub outpoint: OutPoint,
    pub script: ScriptBuf,
    pub sequence: Sequence,
    pub local_balance: SignedAmount,
    pub remote_balance: SignedAmount,
    pub htlc_balance: Amount,
}

impl HasSerialId for OutgoingInput {
    fn serial_id(&self) -> SerialId {
        match self {
            OutgoingInput::Local(i) => i.serial_id,
            OutgoingInput::Shared(i) => i.serial_id,
        }
    }

    fn set_serial_id(&mut self, serial_id: SerialId) {
        match self {
            OutgoingInput::Local(i) => i.serial_id = serial_id,
            OutgoingInput::Shared(i) => i.serial_id = serial_id,
        }
    }
}

/// A finalized output contributed by this side, with its serial-id already
/// assigned.
#[derive(Clone, Debug)]
pub enum OutgoingOutput {
    Shared(SharedOutput),
    Local(LocalOutput),
}

#[derive(Clone, Debug)]
pub struct SharedOutput {
    pub serial_id: SerialId,
    pub script: ScriptBuf,
    pub local_amount: Amount,
    pub remote_amount: Amount,
    pub htlc_balance: Amount,
}

#[derive(Clone, Debug)]
pub enum LocalOutput {
    NonChange(NonChangeOutput),
    Change(ChangeOutput),
}

#[derive(Clone, Debug)]
pub struct NonChangeOutput {
    pub serial_id: SerialId,
    pub amount: Amount,
    pub script: ScriptBuf,
}

#[derive(Clone, Debug)]
pub struct ChangeOutput {
    pub serial_id: SerialId,
    pub amount: Amount,
    pub script: ScriptBuf,
}

impl HasSerialId for OutgoingOutput {
    fn serial_id(&self) -> SerialId {
        match self {
            OutgoingOutput::Shared(o) => o.serial_id,
            OutgoingOutput::Local(LocalOutput::NonChange(o)) => o.serial_id,
            OutgoingOutput::Local(LocalOutput::Change(o)) => o.serial_id,
        }
    }

    fn set_serial_id(&mut self, serial_id: SerialId) {
        match self {
            OutgoingOutput::Shared(o) => o.serial_id = serial_id,
            OutgoingOutput::Local(LocalOutput::NonChange(o)) => {
                o.serial_id = serial_id
            }
            OutgoingOutput::Local(LocalOutput::Change(o)) => {
                o.serial_id = serial_id
            }
        }
    }
}

/// The final local contribution to a jointly-constructed interactive-tx
/// funding transaction, ready to be sent to the counterparty as a sequence
/// of `tx_add_input`/`tx_add_output` messages.
#[derive(Clone, Debug, Default)]
pub struct FundingContributions {
    pub inputs: Vec<OutgoingInput>,
    pub outputs: Vec<OutgoingOutput>,
}

/// An outpoint the Wallet Adapter selected that cannot be used in this
/// interactive-tx session (oversized backing tx or non-SegWit output). Kept
/// locked for the rest of the session so the wallet doesn't re-offer it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UnusableInput(pub OutPoint);

/// A signed, ready-to-broadcast transaction produced by the Replaceable-Tx
/// Publisher's funding step.
#[derive(Clone, Debug)]
pub struct FundedTx {
    pub tx: Transaction,
    pub feerate: bitcoin::FeeRate,
    pub fee: Amount,
}

impl FundedTx {
    pub fn txid(&self) -> bitcoin::Txid {
        self.tx.compute_txid()
    }

    pub fn input_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.tx.input.iter().map(|txin| txin.previous_output)
    }
}
