// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::PhysAddr;
use bitstruct::bitstruct;
use strum::FromRepr;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Transfer Request Block: the 16-byte descriptor exchanged with the
/// controller (xHCI 1.2 sect 6.4). Copied by value into ring slots; the
/// `parameter` field may carry a physical pointer to an externally owned
/// buffer, but the TRB itself owns nothing.
#[repr(C)]
#[derive(Copy, Clone, FromBytes, Immutable)]
pub struct Trb {
    /// May be an address or immediate data, depending on the TRB type.
    pub parameter: u64,
    pub status: TrbStatusField,
    pub control: TrbControlField,
}

impl std::fmt::Debug for Trb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Trb {{ parameter: 0x{:x}, control.trb_type: {:?} }}",
            self.parameter,
            self.control.trb_type()
        )
    }
}

impl Default for Trb {
    fn default() -> Self {
        Self {
            parameter: 0,
            status: Default::default(),
            control: TrbControlField { normal: Default::default() },
        }
    }
}

impl Trb {
    /// Build a Link TRB redirecting the controller to `target`, the first
    /// slot of the next segment. Link TRBs are never chained and never part
    /// of a TD (xHCI 1.2 sect 4.9.2.2).
    pub fn link(target: PhysAddr, toggle_cycle: bool) -> Self {
        Self {
            parameter: target.0,
            status: TrbStatusField::default(),
            control: TrbControlField {
                link: TrbControlFieldLink::default()
                    .with_trb_type(TrbType::Link)
                    .with_toggle_cycle(toggle_cycle),
            },
        }
    }

    /// Whether this TRB is associated with the next one on the ring, i.e.
    /// whether the TD it belongs to continues past it.
    pub fn is_chained(&self) -> bool {
        self.control.chain_bit().unwrap_or(false)
    }
}

/// The 'control' dword of a TRB. Field definitions vary with the TRB type,
/// but the cycle bit and the type field are common to all variants.
/// See xHCI 1.2 section 6.4.1.
#[derive(Copy, Clone, FromBytes, Immutable)]
pub union TrbControlField {
    pub normal: TrbControlFieldNormal,
    pub setup_stage: TrbControlFieldSetupStage,
    pub data_stage: TrbControlFieldDataStage,
    pub status_stage: TrbControlFieldStatusStage,
    pub link: TrbControlFieldLink,
    pub event: TrbControlFieldEvent,
    pub transfer_event: TrbControlFieldTransferEvent,
}

impl TrbControlField {
    pub fn trb_type(&self) -> TrbType {
        // all variants are alike in TRB type location
        unsafe { self.normal.trb_type() }
    }

    pub fn cycle(&self) -> bool {
        // all variants are alike in cycle bit location
        unsafe { self.normal.cycle() }
    }

    pub fn set_cycle(&mut self, cycle_state: bool) {
        // all variants are alike in cycle bit location
        unsafe { self.normal.set_cycle(cycle_state) }
    }

    pub fn chain_bit(&self) -> Option<bool> {
        Some(match self.trb_type() {
            TrbType::Normal => unsafe { self.normal.chain_bit() },
            TrbType::DataStage => unsafe { self.data_stage.chain_bit() },
            TrbType::StatusStage => unsafe { self.status_stage.chain_bit() },
            TrbType::Link => unsafe { self.link.chain_bit() },
            _ => return None,
        })
    }
}

bitstruct! {
    /// Normal TRB control fields (xHCI 1.2 table 6-22)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldNormal(pub u32) {
        /// Marks the slot as valid relative to the consumer's cycle state.
        pub cycle: bool = 0;

        /// "ENT": the controller evaluates the next TRB before saving
        /// endpoint state.
        pub evaluate_next_trb: bool = 1;

        /// "ISP": generate a Transfer Event with Short Packet status if the
        /// transfer comes up short of the TRB Transfer Length.
        pub interrupt_on_short_packet: bool = 2;

        /// "NS": permit No Snoop on the controller's PCIe transactions.
        pub no_snoop: bool = 3;

        /// "CH": this TRB continues into the next one; unset on the last
        /// TRB of a TD.
        pub chain_bit: bool = 4;

        /// "IOC": deposit a Transfer Event on completion of this TRB.
        pub interrupt_on_completion: bool = 5;

        /// "IDT": `parameter` holds up to 8 bytes of immediate data rather
        /// than a buffer pointer.
        pub immediate_data: bool = 6;

        reserved1: u8 = 7..9;

        /// "BEI": suppress the interrupt for the event this TRB generates.
        pub block_event_interrupt: bool = 9;

        /// Set to [TrbType::Normal] for Normal TRBs.
        pub trb_type: TrbType = 10..16;

        reserved2: u16 = 16..32;
    }
}

bitstruct! {
    /// Setup Stage TRB control fields (xHCI 1.2 table 6-26)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldSetupStage(pub u32) {
        pub cycle: bool = 0;

        reserved1: u8 = 1..5;

        /// "IOC". See [TrbControlFieldNormal::interrupt_on_completion]
        pub interrupt_on_completion: bool = 5;

        /// "IDT". See [TrbControlFieldNormal::immediate_data]
        pub immediate_data: bool = 6;

        reserved2: u8 = 7..10;

        /// Set to [TrbType::SetupStage] for Setup Stage TRBs.
        pub trb_type: TrbType = 10..16;

        /// "TRT": type and direction of the control transfer.
        pub transfer_type: TrbTransferType = 16..18;

        reserved3: u16 = 18..32;
    }
}

bitstruct! {
    /// Data Stage TRB control fields (xHCI 1.2 table 6-29)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldDataStage(pub u32) {
        pub cycle: bool = 0;

        /// "ENT". See [TrbControlFieldNormal::evaluate_next_trb]
        pub evaluate_next_trb: bool = 1;

        /// "ISP". See [TrbControlFieldNormal::interrupt_on_short_packet]
        pub interrupt_on_short_packet: bool = 2;

        /// "NS". See [TrbControlFieldNormal::no_snoop]
        pub no_snoop: bool = 3;

        /// "CH". See [TrbControlFieldNormal::chain_bit]
        pub chain_bit: bool = 4;

        /// "IOC". See [TrbControlFieldNormal::interrupt_on_completion]
        pub interrupt_on_completion: bool = 5;

        /// "IDT". See [TrbControlFieldNormal::immediate_data]
        pub immediate_data: bool = 6;

        reserved1: u8 = 7..10;

        /// Set to [TrbType::DataStage] for Data Stage TRBs.
        pub trb_type: TrbType = 10..16;

        /// "DIR": OUT (0) toward the device, IN (1) toward the host.
        pub direction: TrbDirection = 16;

        reserved2: u16 = 17..32;
    }
}

bitstruct! {
    /// Status Stage TRB control fields (xHCI 1.2 table 6-31)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldStatusStage(pub u32) {
        pub cycle: bool = 0;

        /// "ENT". See [TrbControlFieldNormal::evaluate_next_trb]
        pub evaluate_next_trb: bool = 1;

        reserved1: u8 = 2..4;

        /// "CH". See [TrbControlFieldNormal::chain_bit]
        pub chain_bit: bool = 4;

        /// "IOC". See [TrbControlFieldNormal::interrupt_on_completion]
        pub interrupt_on_completion: bool = 5;

        reserved2: u8 = 6..10;

        /// Set to [TrbType::StatusStage] for Status Stage TRBs.
        pub trb_type: TrbType = 10..16;

        /// "DIR". See [TrbControlFieldDataStage::direction]
        pub direction: TrbDirection = 16;

        reserved3: u16 = 17..32;
    }
}

bitstruct! {
    /// Link TRB control fields (xHCI 1.2 table 6-34)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldLink(pub u32) {
        pub cycle: bool = 0;

        /// "TC": the consumer toggles its interpretation of the cycle bit
        /// when it traverses this Link TRB. Marks the point where one full
        /// revolution of the ring completes.
        pub toggle_cycle: bool = 1;

        reserved1: u8 = 2..4;

        /// "CH". See [TrbControlFieldNormal::chain_bit]
        pub chain_bit: bool = 4;

        /// "IOC". See [TrbControlFieldNormal::interrupt_on_completion]
        pub interrupt_on_completion: bool = 5;

        reserved2: u8 = 6..10;

        /// Set to [TrbType::Link] for Link TRBs.
        pub trb_type: TrbType = 10..16;

        reserved3: u16 = 16..32;
    }
}

bitstruct! {
    /// Control fields common to Event TRBs (xHCI 1.2 sect 6.4.2)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldEvent(pub u32) {
        pub cycle: bool = 0;

        reserved1: u16 = 1..10;

        /// Set to the [TrbType] corresponding to the event.
        pub trb_type: TrbType = 10..16;

        pub virtual_function_id: u8 = 16..24;

        /// ID of the Device Slot the event belongs to.
        pub slot_id: u8 = 24..32;
    }
}

bitstruct! {
    /// Transfer Event TRB control fields (xHCI 1.2 table 6-38)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbControlFieldTransferEvent(pub u32) {
        pub cycle: bool = 0;

        reserved0: bool = 1;

        /// "ED": the event was generated by an Event Data TRB, and
        /// `parameter` carries its 64-bit payload instead of a pointer to
        /// the TRB that completed.
        pub event_data: bool = 2;

        reserved1: u16 = 3..10;

        /// Set to [TrbType::TransferEvent] for Transfer Event TRBs.
        pub trb_type: TrbType = 10..16;

        /// Device Context Index of the endpoint that generated the event.
        pub endpoint_id: u8 = 16..21;

        reserved2: u16 = 21..24;

        /// ID of the Device Slot the event belongs to.
        pub slot_id: u8 = 24..32;
    }
}

/// The 'status' dword of a TRB.
#[derive(Copy, Clone, FromBytes, Immutable)]
pub union TrbStatusField {
    pub transfer: TrbStatusFieldTransfer,
    pub event: TrbStatusFieldEvent,
}

impl Default for TrbStatusField {
    fn default() -> Self {
        Self { transfer: TrbStatusFieldTransfer(0) }
    }
}

bitstruct! {
    /// Status fields of transfer-type TRBs (xHCI 1.2 sect 6.4.1)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbStatusFieldTransfer(pub u32) {
        /// For OUT, the number of bytes the controller sends for this TRB;
        /// for IN, the size of the buffer behind the Data Buffer Pointer.
        pub trb_transfer_length: u32 = 0..17;

        /// Number of packets remaining in the TD (xHCI 1.2 sect 4.10.2.4).
        pub td_size: u8 = 17..22;

        /// Index of the interrupter receiving events from this TRB.
        pub interrupter_target: u16 = 22..32;
    }
}

bitstruct! {
    /// Status fields of event-type TRBs (xHCI 1.2 sect 6.4.2)
    #[derive(Clone, Copy, Debug, Default, FromBytes, Immutable)]
    pub struct TrbStatusFieldEvent(pub u32) {
        /// For Transfer Events, the residual number of bytes not
        /// transferred; for command completions, an optional parameter.
        pub completion_parameter: u32 = 0..24;

        /// Raw completion status; interpret via
        /// [TrbCompletionCode::from_repr].
        pub completion_code: u8 = 24..32;
    }
}

/// The 6-bit TRB type vocabulary (xHCI 1.2 section 6.4.6). The whole range
/// is enumerated so the control-word field conversion is total.
#[derive(FromRepr, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum TrbType {
    Reserved0 = 0,
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlotCmd = 9,
    DisableSlotCmd = 10,
    AddressDeviceCmd = 11,
    ConfigureEndpointCmd = 12,
    EvaluateContextCmd = 13,
    ResetEndpointCmd = 14,
    StopEndpointCmd = 15,
    SetTRDequeuePointerCmd = 16,
    ResetDeviceCmd = 17,
    ForceEventCmd = 18,
    NegotiateBandwidthCmd = 19,
    SetLatencyToleranceValueCmd = 20,
    GetPortBandwidthCmd = 21,
    ForceHeaderCmd = 22,
    NoOpCmd = 23,
    GetExtendedPropertyCmd = 24,
    SetExtendedPropertyCmd = 25,
    Reserved26 = 26,
    Reserved27 = 27,
    Reserved28 = 28,
    Reserved29 = 29,
    Reserved30 = 30,
    Reserved31 = 31,
    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
    BandwidthRequestEvent = 35,
    DoorbellEvent = 36,
    HostControllerEvent = 37,
    DeviceNotificationEvent = 38,
    MfIndexWrapEvent = 39,
    Reserved40 = 40,
    Reserved41 = 41,
    Reserved42 = 42,
    Reserved43 = 43,
    Reserved44 = 44,
    Reserved45 = 45,
    Reserved46 = 46,
    Reserved47 = 47,
    Vendor48 = 48,
    Vendor49 = 49,
    Vendor50 = 50,
    Vendor51 = 51,
    Vendor52 = 52,
    Vendor53 = 53,
    Vendor54 = 54,
    Vendor55 = 55,
    Vendor56 = 56,
    Vendor57 = 57,
    Vendor58 = 58,
    Vendor59 = 59,
    Vendor60 = 60,
    Vendor61 = 61,
    Vendor62 = 62,
    Vendor63 = 63,
}

impl From<u8> for TrbType {
    fn from(value: u8) -> Self {
        Self::from_repr(value).expect(
            "TrbType should only be converted from a 6-bit control field",
        )
    }
}
impl From<TrbType> for u8 {
    fn from(value: TrbType) -> Self {
        value as u8
    }
}

/// "TRT". See xHCI 1.2 table 6-26.
#[derive(FromRepr, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum TrbTransferType {
    NoDataStage = 0,
    Reserved = 1,
    OutDataStage = 2,
    InDataStage = 3,
}
impl From<u8> for TrbTransferType {
    fn from(value: u8) -> Self {
        Self::from_repr(value).expect(
            "TrbTransferType should only be converted from a 2-bit field",
        )
    }
}
impl From<TrbTransferType> for u8 {
    fn from(value: TrbTransferType) -> Self {
        value as u8
    }
}

#[derive(FromRepr, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum TrbDirection {
    Out = 0,
    In = 1,
}
impl From<bool> for TrbDirection {
    fn from(value: bool) -> Self {
        if value {
            Self::In
        } else {
            Self::Out
        }
    }
}
impl From<TrbDirection> for bool {
    fn from(value: TrbDirection) -> Self {
        value == TrbDirection::In
    }
}

/// The named completion codes of xHCI 1.2 section 6.4.5. The raw status
/// field stores the full 8-bit value; reserved and vendor-defined codes
/// simply fail `from_repr`.
#[derive(FromRepr, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum TrbCompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetectedError = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    BandwidthError = 8,
    NoSlotsAvailableError = 9,
    InvalidStreamTypeError = 10,
    SlotNotEnabledError = 11,
    EndpointNotEnabledError = 12,
    ShortPacket = 13,
    RingUnderrun = 14,
    RingOverrun = 15,
    VfEventRingFullError = 16,
    ParameterError = 17,
    BandwidthOverrunError = 18,
    ContextStateError = 19,
    NoPingResponseError = 20,
    EventRingFullError = 21,
    IncompatibleDeviceError = 22,
    MissedServiceError = 23,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    StoppedLengthInvalid = 27,
    StoppedShortPacket = 28,
    MaxExitLatencyTooLarge = 29,
    Reserved30 = 30,
    IsochBufferOverrun = 31,
    EventLostError = 32,
    UndefinedError = 33,
    InvalidStreamIdError = 34,
    SecondaryBandwidthError = 35,
    SplitTransactionError = 36,
}

/// One entry of the Event Ring Segment Table (xHCI 1.2 sect 6.5). The
/// controller reads this table directly from DMA memory, so the layout is
/// fixed: 64-bit segment base, 16 valid bits of segment size in the third
/// dword, and a reserved fourth dword.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable)]
pub struct ErstEntry {
    /// Segment base address; 64-byte aligned, low 6 bits reserved.
    pub base_address: u64,
    /// Number of TRB slots in the segment, in the low 16 bits.
    pub segment_trb_count: u32,
    pub reserved: u32,
}

impl ErstEntry {
    pub fn new(base: PhysAddr, trb_count: usize) -> Self {
        Self {
            base_address: base.0,
            segment_trb_count: trb_count as u32 & 0xffff,
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn trb_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Trb>(), 16);
    }

    #[test]
    fn cycle_and_type_are_common_to_all_control_variants() {
        let mut trb = Trb::link(PhysAddr(0x1000), true);
        assert_eq!(trb.control.trb_type(), TrbType::Link);
        assert!(!trb.control.cycle());
        trb.control.set_cycle(true);
        assert!(trb.control.cycle());
        assert!(unsafe { trb.control.link.toggle_cycle() });
        assert_eq!(trb.parameter, 0x1000);
    }

    #[test]
    fn chain_bit_only_on_chainable_types() {
        let normal = Trb {
            control: TrbControlField {
                normal: TrbControlFieldNormal::default()
                    .with_trb_type(TrbType::Normal)
                    .with_chain_bit(true),
            },
            ..Default::default()
        };
        assert!(normal.is_chained());

        let event = Trb {
            control: TrbControlField {
                event: TrbControlFieldEvent::default()
                    .with_trb_type(TrbType::TransferEvent),
            },
            ..Default::default()
        };
        assert_eq!(event.control.chain_bit(), None);
        assert!(!event.is_chained());
    }

    #[test]
    fn erst_entry_wire_layout() {
        let entry = ErstEntry::new(PhysAddr(0xdead_b000), 256);
        let bytes = entry.as_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..8], &0xdead_b000u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &256u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0; 4]);
    }
}
