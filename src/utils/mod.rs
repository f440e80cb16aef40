pub mod bins;
pub mod lock;
pub mod process;

pub mod time {
    use time::{OffsetDateTime, format_description::well_known::Rfc3339};

    /// Current UTC time, e.g. "2024-05-01T12:00:00.123456789Z".
    pub fn now_rfc3339() -> String {
        let now = OffsetDateTime::now_utc();
        now.format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string())
    }

}
