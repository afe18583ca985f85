//! Well-known property and command names.
//!
//! The engine treats names as opaque tokens; these constants only save
//! callers from typos for the identifiers XMC-series firmware is known to
//! report.

pub const POWER: &str = "power";
pub const VOLUME: &str = "volume";
pub const MUTE: &str = "mute";
pub const INPUT: &str = "input";
pub const MODE: &str = "mode";
pub const AUDIO_BITSTREAM: &str = "audio_bitstream";

pub const ZONE2_POWER: &str = "zone2_power";
pub const ZONE2_VOLUME: &str = "zone2_volume";
pub const ZONE2_MUTE: &str = "zone2_mute";
pub const ZONE2_INPUT: &str = "zone2_input";

/// Properties the reference firmware emits notifications for out of the box.
pub const NOTIFY_PROPERTIES: &[&str] = &[
    POWER,
    VOLUME,
    MUTE,
    INPUT,
    MODE,
    ZONE2_POWER,
    ZONE2_VOLUME,
    ZONE2_MUTE,
    ZONE2_INPUT,
];

/// Menu navigation command names accepted by `emotivaControl`.
pub const MENU_COMMANDS: &[&str] = &[
    "up",
    "down",
    "left",
    "right",
    "select",
    "back",
    "home",
];
