//! DIMSE response status codes.

pub const SUCCESS: u16 = 0x0000;
pub const PENDING: u16 = 0xFF00;
/// Pending, with one or more optional keys not supported
pub const PENDING_WARNING: u16 = 0xFF01;
pub const CANCEL: u16 = 0xFE00;
pub const PROCESSING_FAILURE: u16 = 0x0101;
pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
pub const MISSING_UID: u16 = 0xA900;
pub const MISMATCH_UID: u16 = 0xA901;
pub const CANNOT_UNDERSTAND: u16 = 0xC000;

/// The broad category of a status code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl StatusKind {
    pub fn of(status: u16) -> Self {
        match status {
            SUCCESS => StatusKind::Success,
            PENDING | PENDING_WARNING => StatusKind::Pending,
            CANCEL => StatusKind::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusKind::Warning,
            _ => StatusKind::Failure,
        }
    }

    /// Whether no further responses follow one with this status.
    pub fn is_final(self) -> bool {
        self != StatusKind::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SUCCESS, StatusKind::Success)]
    #[case(PENDING, StatusKind::Pending)]
    #[case(PENDING_WARNING, StatusKind::Pending)]
    #[case(CANCEL, StatusKind::Cancel)]
    #[case(0xB007, StatusKind::Warning)]
    #[case(MISSING_UID, StatusKind::Failure)]
    #[case(MISMATCH_UID, StatusKind::Failure)]
    #[case(CANNOT_UNDERSTAND, StatusKind::Failure)]
    #[case(PROCESSING_FAILURE, StatusKind::Failure)]
    fn classify(#[case] status: u16, #[case] kind: StatusKind) {
        assert_eq!(StatusKind::of(status), kind);
        assert_eq!(kind.is_final(), kind != StatusKind::Pending);
    }
}
