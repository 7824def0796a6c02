use time::{Date, Month, PrimitiveDateTime, Time};

/// Extracts a `width`-bit field starting at bit `shift`.
fn field(bits: u16, shift: u32, width: u32) -> u8 {
    ((bits >> shift) & ((1 << width) - 1)) as u8
}

/// Decodes a DOS date/time pair, or returns `None` if it does not name a
/// real date and time.  Seconds are stored halved.
pub fn datetime_from_bits(date: u16, time: u16) -> Option<PrimitiveDateTime> {
    let year = 1980 + (date >> 9) as i32;
    let month = Month::try_from(field(date, 5, 4)).ok()?;
    let date = Date::from_calendar_date(year, month, field(date, 0, 5)).ok()?;
    let time = Time::from_hms(
        field(time, 11, 5),
        field(time, 5, 6),
        2 * field(time, 0, 5),
    )
    .ok()?;
    Some(PrimitiveDateTime::new(date, time))
}
