//! SX126x opcodes and register addresses used by the control layer.

/// Command opcodes (datasheet section 13)
pub mod opcode {
    pub const SET_STANDBY: u8 = 0x80;
    pub const SET_RX: u8 = 0x82;
    pub const SET_TX: u8 = 0x83;
    pub const SET_RF_FREQUENCY: u8 = 0x86;
    pub const SET_CAD_PARAMS: u8 = 0x88;
    pub const SET_PACKET_TYPE: u8 = 0x8A;
    pub const SET_MODULATION_PARAMS: u8 = 0x8B;
    pub const SET_PACKET_PARAMS: u8 = 0x8C;
    pub const SET_TX_PARAMS: u8 = 0x8E;
    pub const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
    pub const SET_PA_CONFIG: u8 = 0x95;
    pub const CALIBRATE_IMAGE: u8 = 0x98;
    pub const SET_DIO2_AS_RF_SWITCH_CTRL: u8 = 0x9D;
    pub const SET_CAD: u8 = 0xC5;
    pub const SET_DIO_IRQ_PARAMS: u8 = 0x08;
    pub const CLEAR_IRQ_STATUS: u8 = 0x02;
    pub const WRITE_BUFFER: u8 = 0x0E;

    pub const GET_STATUS: u8 = 0xC0;
    pub const GET_IRQ_STATUS: u8 = 0x12;
    pub const GET_RX_BUFFER_STATUS: u8 = 0x13;
    pub const GET_PACKET_STATUS: u8 = 0x14;
    pub const READ_BUFFER: u8 = 0x1E;
}

/// Register addresses
pub mod register {
    /// FSK sync word, 8 bytes
    pub const FSK_SYNC_WORD: u16 = 0x06C0;
    /// IQ polarity workaround register (datasheet 15.4)
    pub const IQ_POLARITY: u16 = 0x0736;
    /// LoRa sync word, 2 bytes MSB first
    pub const LORA_SYNC_WORD: u16 = 0x0740;
    /// RX gain: 0x94 power saving, 0x96 boosted
    pub const RX_GAIN: u16 = 0x08AC;
    /// Over-current protection
    pub const OCP: u16 = 0x08E7;
}

/// `SetRx` timeout value for continuous reception
pub const RX_CONTINUOUS: u32 = 0x00FF_FFFF;

/// Crystal frequency of SX126x modules
pub const XTAL_FREQ_HZ: u64 = 32_000_000;
