//! Channel flags.
//!
//! On the wire a single integer carries both the attach-state flags (low
//! bits) and the channel mode flags (bits 16 and up). Internally the two are
//! kept as separate typed sets and only merged when an envelope is encoded.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident, mask = $mask:expr, { $($flag:ident = $bit:expr => $label:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $(pub const $flag: $name = $name($bit);)+

            const ALL: &'static [($name, &'static str)] = &[$(($name::$flag, $label)),+];

            pub const fn empty() -> Self {
                $name(0)
            }

            /// Keeps only the bits that belong to this set.
            pub const fn from_bits_truncate(bits: u32) -> Self {
                $name(bits & $mask)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn labels(self) -> impl Iterator<Item = &'static str> {
                Self::ALL
                    .iter()
                    .filter(move |(flag, _)| self.contains(*flag))
                    .map(|(_, label)| *label)
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_set().entries(self.labels()).finish()
            }
        }
    };
}

flag_set!(
    /// Per-attachment flags reported by the server (and ATTACH_RESUME sent by us).
    AttachFlags, mask = 0x0000_ffff, {
        HAS_PRESENCE = 1 << 0 => "has_presence",
        HAS_BACKLOG = 1 << 1 => "has_backlog",
        RESUMED = 1 << 2 => "resumed",
        TRANSIENT = 1 << 4 => "transient",
        ATTACH_RESUME = 1 << 5 => "attach_resume",
    }
);

flag_set!(
    /// Capabilities requested for, or granted on, a channel attachment.
    ChannelModes, mask = 0xffff_0000, {
        PRESENCE = 1 << 16 => "presence",
        PUBLISH = 1 << 17 => "publish",
        SUBSCRIBE = 1 << 18 => "subscribe",
        PRESENCE_SUBSCRIBE = 1 << 19 => "presence_subscribe",
    }
);

impl ChannelModes {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut modes = ChannelModes::empty();
        for label in labels {
            let label = label.trim().to_ascii_lowercase();
            let (flag, _) = Self::ALL.iter().find(|(_, name)| *name == label)?;
            modes.insert(*flag);
        }
        Some(modes)
    }
}

/// The `flags` field of a protocol envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub attach: AttachFlags,
    pub modes: ChannelModes,
}

impl Flags {
    pub fn from_wire(bits: u32) -> Self {
        Self {
            attach: AttachFlags::from_bits_truncate(bits),
            modes: ChannelModes::from_bits_truncate(bits),
        }
    }

    pub fn to_wire(self) -> u32 {
        self.attach.bits() | self.modes.bits()
    }

    pub fn is_empty(&self) -> bool {
        self.attach.is_empty() && self.modes.is_empty()
    }
}

impl Serialize for Flags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Flags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Flags::from_wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_value_splits_into_two_sets() {
        let bits = (1 << 0) | (1 << 2) | (1 << 16) | (1 << 18);
        let flags = Flags::from_wire(bits);
        assert!(flags.attach.contains(AttachFlags::HAS_PRESENCE));
        assert!(flags.attach.contains(AttachFlags::RESUMED));
        assert!(!flags.attach.contains(AttachFlags::HAS_BACKLOG));
        assert_eq!(flags.modes, ChannelModes::PRESENCE | ChannelModes::SUBSCRIBE);
        assert_eq!(flags.to_wire(), bits);
    }

    #[test]
    fn unknown_low_bits_stay_in_attach_set() {
        let flags = Flags::from_wire(1 << 3);
        assert_eq!(flags.attach.bits(), 1 << 3);
        assert!(flags.modes.is_empty());
    }

    #[test]
    fn modes_parse_from_labels() {
        let modes = ChannelModes::from_labels(["publish", "SUBSCRIBE"]).unwrap();
        assert_eq!(modes.bits(), (1 << 17) | (1 << 18));
        assert!(ChannelModes::from_labels(["history"]).is_none());
        assert_eq!(format!("{modes:?}"), r#"{"publish", "subscribe"}"#);
    }

    #[test]
    fn serializes_as_single_integer() {
        let flags = Flags {
            attach: AttachFlags::ATTACH_RESUME,
            modes: ChannelModes::PUBLISH,
        };
        assert_eq!(serde_json::to_string(&flags).unwrap(), "131104");
        let back: Flags = serde_json::from_str("131104").unwrap();
        assert_eq!(back, flags);
    }
}
