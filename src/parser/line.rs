//! Turns one W3C data line into a [`LogRecord`]

use chrono::NaiveDate;
use std::str::FromStr;

use super::schema::FieldMap;
use crate::db::LogRecord;
use crate::error::LineRejection;

/// Parse a data line against the active directive.
///
/// Every numeric field must parse, or the whole line is rejected. A field
/// that is undeclared or holds the `-` placeholder counts as zero.
pub fn parse_line(
    fields: Option<&FieldMap>,
    line: &str,
    source_file: &str,
) -> Result<LogRecord, LineRejection> {
    let fields = fields.ok_or(LineRejection::NoDirective)?;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != fields.width() {
        return Err(LineRejection::ColumnCount {
            expected: fields.width(),
            found: tokens.len(),
        });
    }

    let text = |name: &str| fields.value(&tokens, name).to_string();

    let date_token = fields.value(&tokens, "date");
    let date = NaiveDate::parse_from_str(date_token, "%Y-%m-%d")
        .map_err(|_| LineRejection::InvalidDate(date_token.to_string()))?;

    let time = text("time");
    if !time.is_empty() && hour_of_day(&time).is_none() {
        return Err(LineRejection::InvalidTime(time));
    }

    Ok(LogRecord {
        file_name: source_file.to_string(),
        date,
        time,
        server_ip: text("s-ip"),
        method: text("cs-method"),
        uri_stem: text("cs-uri-stem"),
        uri_query: text("cs-uri-query"),
        port: number(fields, &tokens, "s-port")?,
        username: text("cs-username"),
        client_ip: text("c-ip"),
        user_agent: text("cs(User-Agent)"),
        referrer: text("cs(Referer)"),
        status_code: number(fields, &tokens, "sc-status")?,
        sub_status_code: number(fields, &tokens, "sc-substatus")?,
        win32_status: number(fields, &tokens, "sc-win32-status")?,
        time_taken: number(fields, &tokens, "time-taken")?,
        bytes_sent: number(fields, &tokens, "sc-bytes")?,
        bytes_received: number(fields, &tokens, "cs-bytes")?,
    })
}

/// Hour from a zero-padded `HH:MM:SS` time, read from the first two characters
pub fn hour_of_day(time: &str) -> Option<u32> {
    let digits = time.get(..2)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = digits.parse().ok()?;
    (hour < 24).then_some(hour)
}

fn number<T>(fields: &FieldMap, tokens: &[&str], name: &'static str) -> Result<T, LineRejection>
where
    T: FromStr + Default,
{
    let raw = fields.value(tokens, name);
    if raw.is_empty() {
        return Ok(T::default());
    }
    raw.parse().map_err(|_| LineRejection::InvalidNumber {
        field: name,
        value: raw.to_string(),
    })
}
