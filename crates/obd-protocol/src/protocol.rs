//! ELM327 Adapter Protocol Selection and Initialization

use serde::{Deserialize, Serialize};

/// Bus protocol the adapter is told to use (`ATSPn`).
///
/// Every `ATSP` digit is selectable from configuration because older
/// vehicles need a fixed protocol when auto detection stalls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObdProtocol {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "j1850_pwm")]
    J1850Pwm,
    #[serde(rename = "j1850_vpw")]
    J1850Vpw,
    /// K-line, 5 baud init
    #[serde(rename = "iso9141")]
    Iso9141,
    /// K-line KWP2000, slow init
    #[serde(rename = "kwp_slow")]
    KwpSlowInit,
    /// K-line KWP2000, fast init
    #[serde(rename = "kwp_fast")]
    KwpFastInit,
    #[serde(rename = "can_11bit_500k")]
    Can11Bit500k,
    #[serde(rename = "can_29bit_500k")]
    Can29Bit500k,
    #[serde(rename = "can_11bit_250k")]
    Can11Bit250k,
    #[serde(rename = "can_29bit_250k")]
    Can29Bit250k,
}

impl ObdProtocol {
    /// `ATSPn` command selecting this protocol
    pub fn select_command(self) -> &'static str {
        const COMMANDS: [&str; 10] = [
            "ATSP0", "ATSP1", "ATSP2", "ATSP3", "ATSP4", "ATSP5", "ATSP6", "ATSP7", "ATSP8",
            "ATSP9",
        ];
        COMMANDS[self.adapter_digit() as usize]
    }

    /// Protocol number in the ELM327 command set
    pub fn adapter_digit(self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141 => 3,
            ObdProtocol::KwpSlowInit => 4,
            ObdProtocol::KwpFastInit => 5,
            ObdProtocol::Can11Bit500k => 6,
            ObdProtocol::Can29Bit500k => 7,
            ObdProtocol::Can11Bit250k => 8,
            ObdProtocol::Can29Bit250k => 9,
        }
    }
}

/// Adapter setup commands, sent in order after every (re)connect:
/// reset, echo off, linefeeds off, spaces off, headers off, protocol select.
pub fn init_sequence(protocol: ObdProtocol) -> [&'static str; 6] {
    [
        "ATZ",
        "ATE0",
        "ATL0",
        "ATS0",
        "ATH0",
        protocol.select_command(),
    ]
}
