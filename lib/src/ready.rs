use std::{fmt, ops};

/// Readiness flags of a socket, a small copy of what mio exposes through
/// its events, that can be stored and combined.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Ready(pub u16);

const READABLE: u16 = 0b00001;
const WRITABLE: u16 = 0b00010;
const ERROR: u16 = 0b00100;
const HUP: u16 = 0b01000;

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(READABLE);
    pub const WRITABLE: Ready = Ready(WRITABLE);
    pub const ERROR: Ready = Ready(ERROR);
    pub const HUP: Ready = Ready(HUP);
    pub const ALL: Ready = Ready(READABLE | WRITABLE | ERROR | HUP);

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::EMPTY
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::READABLE)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::ERROR)
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::HUP)
    }

    #[inline]
    pub fn insert<T: Into<Self>>(&mut self, other: T) {
        let other = other.into();
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove<T: Into<Self>>(&mut self, other: T) {
        let other = other.into();
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains<T: Into<Self>>(&self, other: T) -> bool {
        let other = other.into();
        (*self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready.insert(Ready::READABLE);
        }
        if event.is_writable() {
            ready.insert(Ready::WRITABLE);
        }
        if event.is_error() {
            ready.insert(Ready::ERROR);
        }
        // a half closed socket still has bytes to read, the reader sees the EOF
        if event.is_read_closed() || event.is_write_closed() {
            ready.insert(Ready::HUP);
        }
        ready
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Ready::READABLE, "Readable"),
            (Ready::WRITABLE, "Writable"),
            (Ready::ERROR, "Error"),
            (Ready::HUP, "Hup"),
        ];
        let mut one = false;
        for (flag, name) in flags {
            if self.contains(flag) {
                if one {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                one = true;
            }
        }
        if !one {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

impl fmt::Display for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.is_readable() { "R" } else { "-" },
            if self.is_writable() { "W" } else { "-" },
            if self.is_error() { "E" } else { "-" },
            if self.is_hup() { "H" } else { "-" },
        )
    }
}

/// What an endpoint wants to do (`interest`) and what the poller reported
/// (`event`). With edge triggered notifications the event is kept until the
/// socket returns would-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub interest: Ready,
    pub event: Ready,
}

impl Readiness {
    pub const fn new() -> Readiness {
        Readiness {
            interest: Ready::EMPTY,
            event: Ready::EMPTY,
        }
    }

    pub fn reset(&mut self) {
        self.interest = Ready::EMPTY;
        self.event = Ready::EMPTY;
    }

    /// the part of the events the endpoint can act on
    pub fn filter_interest(&self) -> Ready {
        self.event & self.interest
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "I({}) E({})", self.interest, self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_contains() {
        let mut ready = Ready::EMPTY;
        assert!(ready.is_empty());
        ready.insert(Ready::READABLE | Ready::HUP);
        assert!(ready.is_readable());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());
        ready.remove(Ready::READABLE);
        assert_eq!(ready, Ready::HUP);
        assert!(Ready::ALL.contains(Ready::WRITABLE | Ready::ERROR));
    }

    #[test]
    fn filter_interest() {
        let readiness = Readiness {
            interest: Ready::READABLE,
            event: Ready::READABLE | Ready::WRITABLE,
        };
        assert_eq!(readiness.filter_interest(), Ready::READABLE);
        assert_eq!(format!("{readiness}"), "I(R---) E(RW--)");
        assert_eq!(format!("{:?}", Ready::READABLE | Ready::ERROR), "Readable | Error");
    }
}
