//! eDVS command strings and bias table.
//!
//! The firmware takes newline-terminated ASCII commands. All of them are
//! fire-and-forget; the driver never parses a reply once echo is disabled.

use std::fmt;

/// Model name used in device strings.
pub const DEVICE_NAME: &str = "eDVS4337";
/// Substring the startup banner must contain.
pub(crate) const BANNER_MARKER: &str = "EDVS";

/// Bias values are 24 bits wide on the chip.
pub const BIAS_MAX: u32 = 0x00FF_FFFF;

/// Commands understood by the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Bare newline, flushes a half-sent command.
    Newline,
    /// Reboot the firmware; it answers with a startup banner.
    Reset,
    DisableEcho,
    /// Select the 4-byte event format with 16-bit timestamps.
    EventFormat,
    StartStreaming,
    StopStreaming,
    TimestampReset,
    SetBias { bias: Bias, value: u32 },
    FlushBiases,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Newline => writeln!(f),
            Command::Reset => writeln!(f, "R"),
            Command::DisableEcho => writeln!(f, "!U0"),
            Command::EventFormat => writeln!(f, "!E2"),
            Command::StartStreaming => writeln!(f, "E+"),
            Command::StopStreaming => writeln!(f, "E-"),
            Command::TimestampReset => writeln!(f, "!ET0"),
            Command::SetBias { bias, value } => {
                writeln!(f, "!B{}={}", bias.index(), value & BIAS_MAX)
            }
            Command::FlushBiases => writeln!(f, "!BF"),
        }
    }
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

/// On-chip bias generators, in firmware index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bias {
    Cas = 0,
    InjGnd = 1,
    ReqPd = 2,
    PuX = 3,
    DiffOff = 4,
    Req = 5,
    Refr = 6,
    PuY = 7,
    DiffOn = 8,
    Diff = 9,
    Foll = 10,
    Pr = 11,
}

impl Bias {
    pub const ALL: [Bias; 12] = [
        Bias::Cas,
        Bias::InjGnd,
        Bias::ReqPd,
        Bias::PuX,
        Bias::DiffOff,
        Bias::Req,
        Bias::Refr,
        Bias::PuY,
        Bias::DiffOn,
        Bias::Diff,
        Bias::Foll,
        Bias::Pr,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Current value of every bias, as last sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiasSet {
    values: [u32; 12],
}

impl Default for BiasSet {
    /// DVS128 "fast" bias set.
    fn default() -> Self {
        Self {
            values: [
                1992, 1_108_364, 16_777_215, 8_159_221, 132, 309_590, 969, 16_777_215, 209_996,
                13125, 271, 217,
            ],
        }
    }
}

impl BiasSet {
    pub fn get(&self, bias: Bias) -> u32 {
        self.values[bias.index()]
    }

    /// Store a value, truncated to 24 bits like the on-chip register.
    pub fn set(&mut self, bias: Bias, value: u32) {
        self.values[bias.index()] = value & BIAS_MAX;
    }

    /// Commands programming `bias`, or every bias when `None`, then flushing.
    pub fn commands(&self, bias: Option<Bias>) -> Vec<Command> {
        let selected: Vec<Bias> = match bias {
            Some(b) => vec![b],
            None => Bias::ALL.to_vec(),
        };
        selected
            .into_iter()
            .map(|bias| Command::SetBias {
                bias,
                value: self.get(bias),
            })
            .chain(std::iter::once(Command::FlushBiases))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding() {
        assert_eq!(Command::StartStreaming.encode(), b"E+\n");
        assert_eq!(Command::StopStreaming.encode(), b"E-\n");
        assert_eq!(Command::TimestampReset.encode(), b"!ET0\n");
        assert_eq!(Command::Newline.encode(), b"\n");
        assert_eq!(
            Command::SetBias {
                bias: Bias::Refr,
                value: 969
            }
            .encode(),
            b"!B6=969\n"
        );
    }

    #[test]
    fn bias_values_are_24_bit() {
        let mut biases = BiasSet::default();
        biases.set(Bias::Pr, 0x1234_5678);
        assert_eq!(biases.get(Bias::Pr), 0x0034_5678);
    }

    #[test]
    fn full_program_ends_with_flush() {
        let cmds = BiasSet::default().commands(None);
        assert_eq!(cmds.len(), 13);
        assert_eq!(
            cmds[0],
            Command::SetBias {
                bias: Bias::Cas,
                value: 1992
            }
        );
        assert_eq!(cmds.last(), Some(&Command::FlushBiases));

        let single = BiasSet::default().commands(Some(Bias::Diff));
        assert_eq!(single.len(), 2);
    }
}
