//! ## Constants
//!
//! Various constants used throughout the project.
//!

#[allow(unused)]
pub mod usb {
    /// Agilent (now Keysight) vendor id
    pub const AGILENT_VENDOR_ID: u16 = 0x0957;
    /// 82357A with firmware loaded
    pub const AGILENT_82357A_PRODUCT_ID: u16 = 0x0107;
    /// 82357A before its firmware is loaded
    pub const AGILENT_82357A_PREINIT_PRODUCT_ID: u16 = 0x0007;
    /// 82357B with firmware loaded
    pub const AGILENT_82357B_PRODUCT_ID: u16 = 0x0718;
    /// 82357B before its firmware is loaded
    pub const AGILENT_82357B_PREINIT_PRODUCT_ID: u16 = 0x0518;

    pub const BULK_IN_ENDPOINT: u8 = 0x82;
    pub const AGILENT_82357A_BULK_OUT_ENDPOINT: u8 = 0x01;
    pub const AGILENT_82357A_INTERRUPT_IN_ENDPOINT: u8 = 0x83;
    pub const AGILENT_82357B_BULK_OUT_ENDPOINT: u8 = 0x06;
    pub const AGILENT_82357B_INTERRUPT_IN_ENDPOINT: u8 = 0x88;
}

#[allow(unused)]
pub mod misc {
    use std::time::Duration;

    /// The default I/O timeout of a fresh session (T3s)
    pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(3);
    /// The default serial poll timeout (T1s)
    pub const DEFAULT_SPOLL_TIMEOUT_DURATION: Duration = Duration::from_secs(1);
    /// The default parallel poll timeout
    pub const DEFAULT_PPOLL_TIMEOUT_DURATION: Duration = Duration::from_micros(2);
    /// Size of the board I/O buffer, the largest chunk handed to the adapter at once
    pub const DEFAULT_BUFFER_LENGTH: usize = 0x1000;
    /// Number of serial poll bytes a device queue keeps before dropping the oldest
    pub const DEFAULT_STATUS_QUEUE_CAPACITY: usize = 16;
    /// Size in bytes of the header in front of a read or write frame
    pub const DATA_PIPE_HEADER_SIZE: usize = 8;
    /// Size in bytes of a register command reply
    pub const REGISTER_REPLY_SIZE: usize = 0x20;
    /// Size in bytes of the interrupt packet
    pub const INTERRUPT_BUFFER_SIZE: usize = 4;
    /// Bounded wait for the adapter to acknowledge an abort/flush request
    pub const ABORT_ACK_TIMEOUT: Duration = Duration::from_millis(100);
    /// Timeout used for plain register traffic
    pub const REGISTER_TIMEOUT: Duration = Duration::from_millis(1000);
    /// How long the interrupt listener blocks before re-checking its stop flag
    pub const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
    /// How often `wait` re-reads the board status while nothing notifies it
    pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
    /// Duration of the IFC pulse sent by `interface_clear`
    pub const IFC_PULSE_DURATION: Duration = Duration::from_micros(100);
    /// Time given to an addressed listener to pull NDAC before the lines are sampled
    pub const LISTENER_SETTLE: Duration = Duration::from_millis(2);
    /// Number of 1us polls `take_control` waits for ATN
    pub const TAKE_CONTROL_POLLS: u32 = 1000;
    /// Firmware clock period used by the fast talker T1 register
    pub const T1_NANOSEC_PER_CLOCK: u32 = 21;
    /// Number of session handles a [`Gpib`](crate::Gpib) hands out
    pub const MAX_DESCRIPTORS: usize = 0x1000;
    /// How often the autopoll task re-checks SRQ while nothing notifies it
    pub const AUTOPOLL_INTERVAL: Duration = Duration::from_millis(50);
    /// Highest primary or secondary GPIB address
    pub const MAX_ADDRESS: u8 = 30;
    /// Serial poll byte bit set by a device requesting service
    pub const RQS_BIT: u8 = 0x40;
}

#[allow(unused)]
pub mod bulk_commands {
    pub const DATA_PIPE_CMD_WRITE: u8 = 0x1;
    pub const DATA_PIPE_CMD_READ: u8 = 0x3;
    pub const DATA_PIPE_CMD_WR_REGS: u8 = 0x4;
    pub const DATA_PIPE_CMD_RD_REGS: u8 = 0x5;
    /// Transfer id placed at the end of a read request
    pub const ACK_ID: u8 = 0xff;
}

#[allow(unused)]
pub mod control_requests {
    /// bRequest used for every vendor request
    pub const CONTROL_REQUEST: u8 = 0x4;
    pub const XFER_ABORT: u16 = 0xa0;
    pub const XFER_STATUS: u16 = 0xb0;
    /// wIndex flag asking XFER_ABORT to flush
    pub const XA_FLUSH: u16 = 0x1;
    pub const XFER_ABORT_REPLY_SIZE: usize = 2;
    pub const XFER_STATUS_REPLY_SIZE: usize = 8;
}

#[allow(unused)]
pub mod ugp_status {
    pub const UGP_SUCCESS: u8 = 0;
    pub const UGP_ERR_INVALID_CMD: u8 = 1;
    pub const UGP_ERR_INVALID_PARAM: u8 = 2;
    pub const UGP_ERR_INVALID_REG: u8 = 3;
    pub const UGP_ERR_GPIB_READ: u8 = 4;
    pub const UGP_ERR_GPIB_WRITE: u8 = 5;
    pub const UGP_ERR_FLUSHING: u8 = 6;
    pub const UGP_ERR_FLUSHING_ALREADY: u8 = 7;
    pub const UGP_ERR_UNSUPPORTED: u8 = 8;
    pub const UGP_ERR_OTHER: u8 = 9;
}

#[allow(unused)]
pub mod registers {
    // TMS9914 write registers
    pub const IMR0: u8 = 0;
    pub const IMR1: u8 = 1;
    pub const AUXCR: u8 = 3;
    pub const ADR: u8 = 4;
    pub const SPMR: u8 = 5;
    pub const PPR: u8 = 6;
    pub const CDOR: u8 = 7;

    // TMS9914 read registers
    pub const ISR0: u8 = 0;
    pub const ISR1: u8 = 1;
    pub const ADSR: u8 = 2;
    pub const BSR: u8 = 3;
    pub const CPTR: u8 = 6;
    pub const DIR: u8 = 7;

    /// Highest TMS9914 register number
    pub const TMS9914_LAST_REGISTER: u8 = 7;

    // firmware registers
    pub const HW_CONTROL: u8 = 0xa;
    pub const LED_CONTROL: u8 = 0xb;
    pub const RESET_TO_POWERUP: u8 = 0xc;
    pub const PROTOCOL_CONTROL: u8 = 0xd;
    pub const FAST_TALKER_T1: u8 = 0xe;

    // HW_CONTROL bits
    pub const NOT_TI_RESET: u8 = 0x1;
    pub const SYSTEM_CONTROLLER: u8 = 0x2;
    pub const NOT_PARALLEL_POLL: u8 = 0x4;
    pub const OSCILLATOR_5V_ON: u8 = 0x8;
    pub const OUTPUT_5V_ON: u8 = 0x20;
    pub const CPLD_3V_ON: u8 = 0x80;

    // LED_CONTROL bits
    pub const FIRMWARE_LED_CONTROL: u8 = 0x1;
    pub const FAIL_LED_ON: u8 = 0x20;
    pub const READY_LED_ON: u8 = 0x40;
    pub const ACCESS_LED_ON: u8 = 0x80;

    /// RESET_TO_POWERUP bit, wait 2ms after sending
    pub const RESET_SPACEBALL: u8 = 0x1;

    /// PROTOCOL_CONTROL bit
    pub const WRITE_COMPLETE_INTERRUPT_EN: u8 = 0x1;

    // IMR0 / IMR1 bits
    pub const HR_BOIE: u8 = 1 << 4;
    pub const HR_BIIE: u8 = 1 << 5;
    pub const HR_SRQIE: u8 = 1 << 1;

    // ADSR bits
    pub const HR_TA: u8 = 1 << 1;
    pub const HR_LA: u8 = 1 << 2;
    pub const HR_ATN: u8 = 1 << 5;
    pub const HR_LLO: u8 = 1 << 6;
    pub const HR_REM: u8 = 1 << 7;

    /// ADR mask for the 5 address bits
    pub const ADDRESS_MASK: u8 = 0x1f;

    // BSR bits
    pub const BSR_REN_BIT: u8 = 0x1;
    pub const BSR_IFC_BIT: u8 = 0x2;
    pub const BSR_SRQ_BIT: u8 = 0x4;
    pub const BSR_EOI_BIT: u8 = 0x8;
    pub const BSR_NRFD_BIT: u8 = 0x10;
    pub const BSR_NDAC_BIT: u8 = 0x20;
    pub const BSR_DAV_BIT: u8 = 0x40;
    pub const BSR_ATN_BIT: u8 = 0x80;
}

#[allow(unused)]
pub mod aux_commands {
    /// set bit instead of clearing it
    pub const AUX_CS: u8 = 0x80;
    pub const AUX_CHIP_RESET: u8 = 0x0;
    pub const AUX_INVAL: u8 = 0x1;
    pub const AUX_NBAF: u8 = 0x5;
    pub const AUX_HLDE: u8 = 0x4;
    pub const AUX_RTL: u8 = 0x7;
    pub const AUX_LON: u8 = 0x9;
    pub const AUX_TON: u8 = 0xa;
    pub const AUX_GTS: u8 = 0xb;
    pub const AUX_TCA: u8 = 0xc;
    pub const AUX_TCS: u8 = 0xd;
    pub const AUX_RPP: u8 = 0xe;
    pub const AUX_SIC: u8 = 0xf;
    pub const AUX_SRE: u8 = 0x10;
    pub const AUX_RQC: u8 = 0x11;
    pub const AUX_RLC: u8 = 0x12;
    pub const AUX_STDL: u8 = 0x15;
    pub const AUX_VSTDL: u8 = 0x17;
    pub const AUX_RSV2: u8 = 0x18;
}

/// IEEE-488 multiline commands, sent with ATN asserted
#[allow(unused)]
pub mod bus_commands {
    pub const GTL: u8 = 0x01;
    pub const SDC: u8 = 0x04;
    pub const PPC: u8 = 0x05;
    pub const GET: u8 = 0x08;
    pub const TCT: u8 = 0x09;
    pub const LLO: u8 = 0x11;
    pub const DCL: u8 = 0x14;
    pub const PPU: u8 = 0x15;
    pub const SPE: u8 = 0x18;
    pub const SPD: u8 = 0x19;
    pub const LAD: u8 = 0x20;
    pub const UNL: u8 = 0x3f;
    pub const TAD: u8 = 0x40;
    pub const UNT: u8 = 0x5f;
    pub const SAD: u8 = 0x60;
    pub const PPE: u8 = 0x60;
    pub const PPD: u8 = 0x70;

    /// My listen address
    pub const fn mla(pad: u8) -> u8 {
        pad | LAD
    }

    /// My talk address
    pub const fn mta(pad: u8) -> u8 {
        pad | TAD
    }

    /// My secondary address
    pub const fn msa(sad: u8) -> u8 {
        sad | SAD
    }
}
