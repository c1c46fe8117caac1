//! Device context supplied by the card protocol layer.

/// Kind of card attached to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// SD memory card.
    SdMemory,
    /// SDIO card.
    Sdio,
    /// SD combo card (memory plus SDIO functions).
    Combo,
    /// eMMC device.
    Emmc,
}

impl DeviceKind {
    /// Returns `true` if the device speaks the eMMC command set.
    #[must_use]
    pub const fn is_emmc(self) -> bool {
        matches!(self, Self::Emmc)
    }

    /// Returns `true` if the device has SDIO functions.
    #[must_use]
    pub const fn has_sdio(self) -> bool {
        matches!(self, Self::Sdio | Self::Combo)
    }
}

/// What the core needs to know about the attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    /// Device kind; selects response validation rules and the tuning command.
    pub kind: DeviceKind,
    /// Relative card address assigned during identification.
    pub rca: u16,
}

/// Data bus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    /// DAT0 only.
    One,
    /// DAT0-3.
    Four,
    /// DAT0-7 (eMMC).
    Eight,
}

/// Bus timing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Default speed.
    DefaultSpeed,
    /// SD/MMC high speed.
    HighSpeed,
    /// UHS-I SDR12.
    Sdr12,
    /// UHS-I SDR25.
    Sdr25,
    /// UHS-I SDR50.
    Sdr50,
    /// UHS-I SDR104.
    Sdr104,
    /// UHS-I DDR50.
    Ddr50,
    /// eMMC HS200.
    Hs200,
    /// eMMC HS400.
    Hs400,
    /// eMMC HS400 with enhanced strobe.
    Hs400Es,
}

impl AccessMode {
    /// Returns `true` for modes that need a tuned sampling point.
    ///
    /// SDR50 is tuned only when the controller asks for it, which the caller
    /// passes as `sdr50_needs_tuning`. HS400 runs on the point found in
    /// HS200; enhanced strobe does not sample on the clock at all.
    #[must_use]
    pub const fn requires_tuning(self, sdr50_needs_tuning: bool) -> bool {
        match self {
            Self::Sdr104 | Self::Hs200 | Self::Hs400 => true,
            Self::Sdr50 => sdr50_needs_tuning,
            _ => false,
        }
    }

    /// UHS mode select value for host control 2.
    #[must_use]
    pub const fn uhs_select(self) -> u32 {
        match self {
            Self::DefaultSpeed | Self::Sdr12 => 0,
            Self::HighSpeed | Self::Sdr25 => 1,
            Self::Sdr50 => 2,
            Self::Sdr104 | Self::Hs200 => 3,
            Self::Ddr50 => 4,
            Self::Hs400 | Self::Hs400Es => 5,
        }
    }
}
