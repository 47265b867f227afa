//! Persistent session flags

use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags::bitflags! {
    /// Bitset of persistent session flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct SessionFlags: u32 {
        /// Session survives its last user leaving
        const PERSISTENT = 0x01;
        /// Chat is kept in history
        const PRESERVE_CHAT = 0x02;
        /// Not suitable for minors
        const NSFM = 0x04;
        /// Trusted users may kick and ban
        const DEPUTIES = 0x08;
        /// Only authenticated users may join
        const AUTH_ONLY = 0x10;
        /// Session is exempt from the idle timeout
        const IDLE_OVERRIDE = 0x20;
        /// Browser clients may join
        const ALLOW_WEB = 0x40;
    }
}

// Journals store the raw bits; bits this build does not know are dropped
impl Serialize for SessionFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryEvent;

    #[test]
    fn test_set_and_contains() {
        let mut flags = SessionFlags::empty();
        assert!(!flags.contains(SessionFlags::NSFM));

        flags.set(SessionFlags::NSFM, true);
        flags |= SessionFlags::PERSISTENT;
        assert!(flags.contains(SessionFlags::NSFM));
        assert!(flags.contains(SessionFlags::PERSISTENT | SessionFlags::NSFM));

        flags.set(SessionFlags::NSFM, false);
        assert!(!flags.contains(SessionFlags::NSFM));
        assert_eq!(flags.bits(), 0x01);
    }

    #[test]
    fn test_serialized_as_bits() {
        let flags = SessionFlags::NSFM | SessionFlags::DEPUTIES;
        assert_eq!(serde_json::to_string(&flags).unwrap(), "12");
    }

    #[test]
    fn test_unknown_bits_dropped_on_load() {
        let json = r#"{"event":"flags","flags":4294967295}"#;
        let event: HistoryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            HistoryEvent::Flags {
                flags: SessionFlags::all()
            }
        );
        assert_eq!(SessionFlags::all().bits(), 0x7f);
    }
}
