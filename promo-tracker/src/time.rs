use time::format_description::well_known::Rfc3339;

pub trait TimeSource {
    // Return an RFC 3339 timestamp
    fn current_time(&self) -> String;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        let time = time::OffsetDateTime::now_utc();

        time.format(&Rfc3339)
            .unwrap_or_else(|_| time.unix_timestamp().to_string())
    }
}

/// Always answers with the same timestamp, handy for asserting payloads.
#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.to_string()
    }
}
