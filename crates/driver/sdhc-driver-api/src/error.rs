//! Driver error types.

use core::fmt;

/// Errors and terminal failure codes reported by the host controller core.
///
/// Usage errors are returned synchronously from the operation that detected
/// them. Bus-level failures end up in a request's terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdError {
    // -- Command line -------------------------------------------------------
    /// No response to a command within the command timeout.
    CmdTimeout,
    /// CRC error in a command response.
    CmdCrc,
    /// End bit of a command response was 0.
    CmdEndBit,
    /// Response carried the wrong command index.
    CmdIndex,

    // -- Data line ----------------------------------------------------------
    /// Data timeout (read data or busy release).
    DataTimeout,
    /// CRC error in a data block or CRC status token.
    DataCrc,
    /// End bit of a data block was 0.
    DataEndBit,
    /// The controller cut bus power after exceeding its current limit.
    CurrentLimit,
    /// The controller flagged a response error.
    ResponseError,

    // -- Auto command -------------------------------------------------------
    /// Auto-CMD12 recovered: auto command issued, no data error.
    AutoCmd12RecoverableA,
    /// Auto-CMD12 recovered: auto command issued, data error present.
    AutoCmd12RecoverableB,
    /// Auto-CMD12 recovered: auto command not issued, no data error.
    AutoCmd12RecoverableC,
    /// Auto-CMD12 recovered: auto command not issued, data error present.
    AutoCmd12RecoverableD,
    /// The abort issued to recover an auto-CMD12 error failed too.
    AutoCmd12Unrecoverable,
    /// Auto-CMD23 failure.
    AutoCmd,

    // -- Transfer engine ----------------------------------------------------
    /// ADMA descriptor or transfer error.
    Adma,
    /// The sampling point could not be found.
    Tuning,

    // -- Recovery -----------------------------------------------------------
    /// Error recovery could not return the bus to idle.
    Unrecoverable,

    // -- Command queue ------------------------------------------------------
    /// The command queue is not enabled.
    QueueDisabled,
    /// Task ID out of range or reserved for direct commands.
    InvalidTask,
    /// The task was never attached.
    NotAttached,
    /// The task was discarded before it completed.
    TaskDiscarded,
    /// The queue could not be halted or resumed.
    Io,

    // -- Usage --------------------------------------------------------------
    /// The slot (or task) already has an outstanding request.
    Busy,
    /// A parameter was out of range.
    InvalidParameter,
    /// The controller or device lacks the requested feature.
    Unsupported,
    /// No card is present in the slot.
    NoCard,
    /// A wait exceeded its budget.
    Timeout,
    /// The card reported an error in its response.
    InvalidResponse,
    /// The device registry is full.
    RegistryFull,

    /// Status bits did not match any known error.
    Undefined,
}

impl SdError {
    /// Returns `true` for the four recovered auto-CMD12 outcomes.
    #[must_use]
    pub const fn is_auto_cmd12_recoverable(self) -> bool {
        matches!(
            self,
            Self::AutoCmd12RecoverableA
                | Self::AutoCmd12RecoverableB
                | Self::AutoCmd12RecoverableC
                | Self::AutoCmd12RecoverableD
        )
    }

    /// Returns `true` for errors raised on the command line.
    #[must_use]
    pub const fn is_command_line(self) -> bool {
        matches!(
            self,
            Self::CmdTimeout | Self::CmdCrc | Self::CmdEndBit | Self::CmdIndex
        )
    }

    /// Returns `true` for errors raised on the data lines.
    #[must_use]
    pub const fn is_data_line(self) -> bool {
        matches!(
            self,
            Self::DataTimeout | Self::DataCrc | Self::DataEndBit | Self::Adma
        )
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::CmdTimeout => "command timeout",
            Self::CmdCrc => "command CRC error",
            Self::CmdEndBit => "command end bit error",
            Self::CmdIndex => "command index error",
            Self::DataTimeout => "data timeout",
            Self::DataCrc => "data CRC error",
            Self::DataEndBit => "data end bit error",
            Self::CurrentLimit => "current limit error",
            Self::ResponseError => "response error",
            Self::AutoCmd12RecoverableA => "auto CMD12 error recovered (issued, no data error)",
            Self::AutoCmd12RecoverableB => "auto CMD12 error recovered (issued, data error)",
            Self::AutoCmd12RecoverableC => "auto CMD12 error recovered (not issued, no data error)",
            Self::AutoCmd12RecoverableD => "auto CMD12 error recovered (not issued, data error)",
            Self::AutoCmd12Unrecoverable => "auto CMD12 error not recoverable",
            Self::AutoCmd => "auto command error",
            Self::Adma => "ADMA error",
            Self::Tuning => "tuning failed",
            Self::Unrecoverable => "unrecoverable bus error",
            Self::QueueDisabled => "command queue disabled",
            Self::InvalidTask => "invalid task ID",
            Self::NotAttached => "task not attached",
            Self::TaskDiscarded => "task discarded",
            Self::Io => "command queue I/O error",
            Self::Busy => "slot busy",
            Self::InvalidParameter => "invalid parameter",
            Self::Unsupported => "operation not supported",
            Self::NoCard => "no card present",
            Self::Timeout => "operation timed out",
            Self::InvalidResponse => "invalid card response",
            Self::RegistryFull => "device registry full",
            Self::Undefined => "undefined error",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_selected_variants() {
        assert_eq!(format!("{}", SdError::CmdTimeout), "command timeout");
        assert_eq!(format!("{}", SdError::Busy), "slot busy");
        assert_eq!(format!("{}", SdError::Tuning), "tuning failed");
        assert_eq!(
            format!("{}", SdError::AutoCmd12RecoverableD),
            "auto CMD12 error recovered (not issued, data error)"
        );
        assert_eq!(format!("{}", SdError::Io), "command queue I/O error");
    }

    #[test]
    fn auto_cmd12_codes_are_distinct() {
        let codes = [
            SdError::AutoCmd12RecoverableA,
            SdError::AutoCmd12RecoverableB,
            SdError::AutoCmd12RecoverableC,
            SdError::AutoCmd12RecoverableD,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(a.is_auto_cmd12_recoverable());
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
                assert_ne!(format!("{a}"), format!("{b}"));
            }
        }
        assert!(!SdError::AutoCmd12Unrecoverable.is_auto_cmd12_recoverable());
    }

    #[test]
    fn line_classes() {
        assert!(SdError::CmdIndex.is_command_line());
        assert!(!SdError::CmdIndex.is_data_line());
        assert!(SdError::DataCrc.is_data_line());
        assert!(!SdError::Busy.is_command_line());
    }
}
