/// Fatal TLS alerts written to rejected clients

pub const UNRECOGNIZED_NAME: u8 = 112;
pub const INTERNAL_ERROR: u8 = 80;

const ALERT_RECORD: u8 = 0x15;
const LEVEL_FATAL: u8 = 2;

/// A complete TLS 1.0-framed alert record
pub fn fatal(description: u8) -> [u8; 7] {
    [ALERT_RECORD, 0x03, 0x01, 0x00, 0x02, LEVEL_FATAL, description]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_record() {
        assert_eq!(fatal(UNRECOGNIZED_NAME), [0x15, 3, 1, 0, 2, 2, 112]);
        assert_eq!(fatal(INTERNAL_ERROR)[6], 80);
    }
}
